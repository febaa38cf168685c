//! Household user workers
//!
//! One isolated task per virtual user, each owning exactly one WebSocket to
//! its dedicated endpoint. Workers never share sockets. A worker generates
//! its user's traffic shape on a timer, answers server pings, measures
//! latency with its own 2 s ping cadence, periodically requests download
//! traffic, and reports through an event sink channel handed in on
//! construction (the orchestrator owns the receiver).

use crate::config::Config;
use crate::error::{Error, TransportError};
use crate::household::profile::UserProfile;
use crate::household::wire::{
    self, ControlMessage, PacketDirection, PacketHeader, RedirectResponse,
};
use crate::metrics::{Ema, LatencyTracker, SlidingWindow};
use crate::types::{ActivityStatus, TestId, TrafficUpdate, UserId};
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

/// Consecutive connection failures before the worker gives up for good
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Worker-to-orchestrator report cadence
const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Inactivity watchdog cadence
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

/// Reports a worker sends up through its event sink
#[derive(Clone, Debug)]
pub(crate) enum WorkerEvent {
    /// A completed ping/pong round trip
    Latency {
        /// The worker's user
        user: UserId,
        /// Round trip in milliseconds
        rtt_ms: f64,
        /// Sample stdev of recent round trips
        jitter_ms: f64,
        /// Ping loss fraction
        loss: f64,
    },
    /// Periodic throughput report
    Traffic {
        /// The worker's user
        user: UserId,
        /// Consolidated report
        update: TrafficUpdate,
    },
    /// The worker went quiet past the inactivity alarm
    Inactive {
        /// The worker's user
        user: UserId,
        /// How long it has been silent
        silent_for: Duration,
    },
    /// The worker cannot continue (reconnects exhausted)
    Fatal {
        /// The worker's user
        user: UserId,
        /// One-line cause
        message: String,
    },
    /// The worker shut down cleanly
    Stopped {
        /// The worker's user
        user: UserId,
    },
}

/// Everything a worker needs, handed in at spawn
pub(crate) struct WorkerParams {
    /// The worker's user
    pub user: UserId,
    /// The user's static profile
    pub profile: UserProfile,
    /// Engine configuration
    pub config: Arc<Config>,
    /// Run identifier for the WS query string
    pub test_id: TestId,
    /// Event sink to the orchestrator
    pub events: tokio::sync::mpsc::Sender<WorkerEvent>,
    /// Cancellation token (the stop signal)
    pub cancel: CancellationToken,
}

/// Handle to a spawned worker
pub(crate) struct WorkerHandle {
    /// The worker's user
    pub user: UserId,
    /// Cancels the worker; safe to call more than once
    pub cancel: CancellationToken,
    /// The worker task
    pub join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// How one socket session ended
enum ConnectionEnd {
    /// The stop signal fired; do not reconnect
    Stopped,
    /// The socket closed or broke with the test still active; reconnect
    Closed,
    /// The connection could not be established
    Failed(String),
}

/// Spawn a worker task for one household user.
pub(crate) fn spawn_worker(params: WorkerParams) -> WorkerHandle {
    let user = params.user;
    let cancel = params.cancel.clone();
    let join = tokio::spawn(run_worker(params));
    WorkerHandle { user, cancel, join }
}

async fn run_worker(params: WorkerParams) {
    let mut failures: u32 = 0;

    loop {
        if params.cancel.is_cancelled() {
            break;
        }

        match run_connection(&params).await {
            ConnectionEnd::Stopped => break,
            ConnectionEnd::Closed => {
                failures += 1;
                if failures > MAX_RECONNECT_ATTEMPTS {
                    fatal(&params, "socket kept dropping; reconnects exhausted").await;
                    return;
                }
                tracing::info!(
                    user = %params.user,
                    attempt = failures,
                    "socket closed unexpectedly, reconnecting"
                );
            }
            ConnectionEnd::Failed(message) => {
                failures += 1;
                if failures > MAX_RECONNECT_ATTEMPTS {
                    fatal(&params, &message).await;
                    return;
                }
                tracing::warn!(user = %params.user, attempt = failures, error = %message, "connection failed, backing off");
            }
        }

        // 1 s backoff before resuming traffic
        tokio::select! {
            _ = tokio::time::sleep(params.config.household.reconnect_backoff) => {}
            _ = params.cancel.cancelled() => break,
        }
    }

    params
        .events
        .send(WorkerEvent::Stopped { user: params.user })
        .await
        .ok();
}

async fn fatal(params: &WorkerParams, message: &str) {
    tracing::error!(user = %params.user, message, "worker giving up");
    params
        .events
        .send(WorkerEvent::Fatal {
            user: params.user,
            message: message.to_string(),
        })
        .await
        .ok();
    params
        .events
        .send(WorkerEvent::Stopped { user: params.user })
        .await
        .ok();
}

/// Open the socket, honoring a JSON redirect reply if the endpoint serves
/// one instead of upgrading.
async fn connect_ws(
    params: &WorkerParams,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, Error> {
    let url = params.config.endpoints.user_ws_url(
        params.user.as_str(),
        params.test_id.get(),
        params.profile.dscp,
        params.profile.target_down_bps(),
    )?;
    let open_timeout = params.config.timeouts.ws_open;

    let attempt = tokio::time::timeout(open_timeout, connect_async(url.to_string())).await;
    match attempt {
        Err(_) => Err(Error::timeout("WebSocket open", open_timeout)),
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
            // The endpoint may answer the upgrade with a JSON redirect to a
            // dedicated per-user process; dial the advertised URL instead.
            let redirect = response
                .body()
                .as_deref()
                .and_then(|body| serde_json::from_slice::<RedirectResponse>(body).ok())
                .filter(|r| r.redirect);

            match redirect {
                Some(redirect) => {
                    tracing::info!(
                        user = %params.user,
                        target = %redirect.websocket_url,
                        "following WebSocket redirect"
                    );
                    match tokio::time::timeout(
                        open_timeout,
                        connect_async(redirect.websocket_url),
                    )
                    .await
                    {
                        Err(_) => Err(Error::timeout("WebSocket open (redirect)", open_timeout)),
                        Ok(Ok((ws, _response))) => Ok(ws),
                        Ok(Err(e)) => Err(Error::Transport(TransportError::WebSocket(e))),
                    }
                }
                None => Err(Error::Transport(TransportError::Closed)),
            }
        }
        Ok(Err(e)) => Err(Error::Transport(TransportError::WebSocket(e))),
    }
}

/// Drive one socket session until stop, close, or failure.
#[allow(clippy::too_many_lines)]
async fn run_connection(params: &WorkerParams) -> ConnectionEnd {
    let ws = match connect_ws(params).await {
        Ok(ws) => ws,
        Err(e) if e.is_cancelled() => return ConnectionEnd::Stopped,
        Err(e) => return ConnectionEnd::Failed(e.to_string()),
    };
    let (mut sink, mut stream) = ws.split();

    let clock = Instant::now();
    let now_ms = |clock: &Instant| clock.elapsed().as_millis() as u64;

    // Socket round-trip check, then announce the traffic shape
    if send_control(
        &mut sink,
        &ControlMessage::ConnectionTest {
            timestamp: now_ms(&clock),
        },
    )
    .await
    .is_err()
    {
        return ConnectionEnd::Closed;
    }
    let start = ControlMessage::StartTraffic {
        user_id: params.user.as_str().to_string(),
        activity: params.profile.activity.to_string(),
        packet_size: params.profile.nominal_packet_size() as u32,
        interval_ms: params.profile.interval().as_millis() as u64,
        upload_ratio: params.profile.upload_share,
        dscp: params.profile.dscp.to_string(),
    };
    if send_control(&mut sink, &start).await.is_err() {
        return ConnectionEnd::Closed;
    }
    tracing::info!(user = %params.user, "traffic session started");

    let mut rng = SmallRng::from_entropy();
    let mut latency = LatencyTracker::new();
    let mut down_window = SlidingWindow::new();
    let mut up_window = SlidingWindow::new();
    let mut ema = Ema::new();
    let mut ema_bytes: u64 = 0;
    let mut last_ema = Instant::now();

    let mut seq: u32 = 0;
    let mut ping_seq: u32 = 0;
    let mut packets: u64 = 0;
    let mut bytes_total: u64 = 0;

    // Back-pressure state: sends are skipped while the sink is failing, and
    // a worker silent past the alarm reports up before reconnecting
    let mut send_failing = false;
    let mut inactive_since: Option<Instant> = None;

    let mut send_at = tokio::time::Instant::now() + params.profile.jittered_interval(&mut rng);
    let mut ping_timer = tokio::time::interval(params.config.household.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.reset();
    let mut download_timer =
        tokio::time::interval(params.config.household.download_request_interval);
    download_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut report_timer = tokio::time::interval(REPORT_INTERVAL);
    report_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);

    loop {
        tokio::select! {
            _ = params.cancel.cancelled() => {
                // Best-effort goodbye; the socket may already be gone
                send_control(&mut sink, &ControlMessage::StopTraffic {
                    user_id: params.user.as_str().to_string(),
                })
                .await
                .ok();
                sink.send(Message::Close(None)).await.ok();
                return ConnectionEnd::Stopped;
            }

            frame = stream.next() => {
                match frame {
                    None => return ConnectionEnd::Closed,
                    Some(Err(e)) => {
                        tracing::debug!(user = %params.user, error = %e, "socket read error");
                        return ConnectionEnd::Closed;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match wire::decode_header(&data) {
                            Ok(_header) => {
                                packets += 1;
                                bytes_total += data.len() as u64;
                                down_window.record(Instant::now(), data.len() as u64);
                                ema_bytes += data.len() as u64;
                            }
                            Err(e) => {
                                tracing::debug!(user = %params.user, error = %e, "undecodable binary frame");
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(message) => {
                                if let Some(end) = handle_control(
                                    params, &mut sink, &mut latency, &clock, message,
                                ).await {
                                    return end;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(user = %params.user, error = %e, "undecodable control frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) => return ConnectionEnd::Closed,
                    Some(Ok(_)) => {}
                }
            }

            _ = tokio::time::sleep_until(send_at) => {
                send_at = tokio::time::Instant::now() + params.profile.jittered_interval(&mut rng);

                if !send_failing {
                    let (size, kind) = params.profile.next_packet(seq, &mut rng);
                    let header = PacketHeader {
                        seq,
                        ts_ms_lo: now_ms(&clock) as u32,
                        direction: PacketDirection::Upload,
                        payload_kind: kind,
                        size: size as u16,
                    };
                    seq = seq.wrapping_add(1);
                    let frame = wire::encode_packet(&header, &params.profile.marker());
                    let frame_len = frame.len() as u64;

                    match sink.send(Message::Binary(frame)).await {
                        Ok(()) => {
                            packets += 1;
                            bytes_total += frame_len;
                            up_window.record(Instant::now(), frame_len);
                            ema_bytes += frame_len;
                            inactive_since = None;
                        }
                        Err(e) => {
                            tracing::debug!(user = %params.user, error = %e, "send failed, marking worker inactive");
                            send_failing = true;
                            inactive_since.get_or_insert_with(Instant::now);
                        }
                    }
                }
            }

            _ = ping_timer.tick() => {
                if !send_failing {
                    latency.record_ping();
                    let ping = ControlMessage::Ping {
                        timestamp: now_ms(&clock),
                        sequence: ping_seq,
                    };
                    ping_seq = ping_seq.wrapping_add(1);
                    if send_control(&mut sink, &ping).await.is_err() {
                        send_failing = true;
                        inactive_since.get_or_insert_with(Instant::now);
                    }
                }
            }

            _ = download_timer.tick() => {
                if !send_failing {
                    let request = ControlMessage::RequestDownload {
                        user_id: params.user.as_str().to_string(),
                        throughput_bps: params.profile.target_down_bps(),
                        duration_ms: params.config.household.download_request_interval.as_millis() as u64,
                    };
                    if send_control(&mut sink, &request).await.is_err() {
                        send_failing = true;
                        inactive_since.get_or_insert_with(Instant::now);
                    }
                }
            }

            _ = report_timer.tick() => {
                let now = Instant::now();
                if now.duration_since(last_ema) >= REPORT_INTERVAL {
                    ema.update(ema_bytes, now.duration_since(last_ema));
                    ema_bytes = 0;
                    last_ema = now;
                }

                let down_bps = down_window.bps(now);
                let up_bps = up_window.bps(now);
                let status = if down_bps + up_bps > 0.0 && !send_failing {
                    ActivityStatus::Active
                } else {
                    ActivityStatus::Idle
                };

                let update = TrafficUpdate {
                    user_id: Some(params.user),
                    throughput: ema.value(),
                    download_throughput: down_bps,
                    upload_throughput: up_bps,
                    status,
                    packets,
                    bytes: bytes_total,
                    latency: latency.mean(),
                    jitter: latency.jitter(),
                };
                params.events.send(WorkerEvent::Traffic {
                    user: params.user,
                    update,
                }).await.ok();
            }

            _ = watchdog.tick() => {
                if let Some(since) = inactive_since {
                    let silent_for = since.elapsed();
                    if silent_for > params.config.household.inactive_alarm {
                        params.events.send(WorkerEvent::Inactive {
                            user: params.user,
                            silent_for,
                        }).await.ok();
                        return ConnectionEnd::Closed;
                    }
                }
            }
        }
    }
}

/// React to one control message. Returns `Some(end)` to close the session.
async fn handle_control(
    params: &WorkerParams,
    sink: &mut futures::stream::SplitSink<
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        Message,
    >,
    latency: &mut LatencyTracker,
    clock: &Instant,
    message: ControlMessage,
) -> Option<ConnectionEnd> {
    match message {
        ControlMessage::Pong { timestamp, .. } => {
            let now = clock.elapsed().as_millis() as u64;
            let rtt_ms = now.saturating_sub(timestamp) as f64;
            latency.record_rtt(rtt_ms);
            params
                .events
                .send(WorkerEvent::Latency {
                    user: params.user,
                    rtt_ms,
                    jitter_ms: latency.jitter().unwrap_or(0.0),
                    loss: latency.loss(),
                })
                .await
                .ok();
        }
        // Server-initiated ping: answer symmetrically, echoing its timestamp
        ControlMessage::Ping {
            timestamp,
            sequence,
        } => {
            let reply = ControlMessage::Pong {
                timestamp,
                server_timestamp: Some(clock.elapsed().as_millis() as u64),
                sequence,
            };
            if send_control(sink, &reply).await.is_err() {
                return Some(ConnectionEnd::Closed);
            }
        }
        ControlMessage::DownloadRequest { size } => {
            let reply = ControlMessage::DownloadResponse { size };
            send_control(sink, &reply).await.ok();
        }
        ControlMessage::ConnectionTestResponse { .. }
        | ControlMessage::TrafficStarted { .. }
        | ControlMessage::TrafficStopped { .. }
        | ControlMessage::DownloadResponse { .. } => {}
        ControlMessage::Error { message } => {
            tracing::warn!(user = %params.user, server_error = %message, "server reported an error");
        }
        // Requests only a client sends; a server echoing them is noise
        ControlMessage::StartTraffic { .. }
        | ControlMessage::StopTraffic { .. }
        | ControlMessage::RequestDownload { .. }
        | ControlMessage::ConnectionTest { .. } => {}
    }
    None
}

async fn send_control(
    sink: &mut futures::stream::SplitSink<
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        Message,
    >,
    message: &ControlMessage,
) -> Result<(), Error> {
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| Error::Transport(TransportError::WebSocket(e)))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use url::Url;

    /// Minimal loopback household endpoint: answers pings after a fixed
    /// delay, acknowledges traffic control, and counts binary frames.
    async fn spawn_echo_server(
        pong_delay: Duration,
    ) -> (std::net::SocketAddr, Arc<AtomicU64>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let binary_frames = Arc::new(AtomicU64::new(0));
        let counter = binary_frames.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = ws.split();
                    while let Some(Ok(message)) = stream.next().await {
                        match message {
                            Message::Text(text) => {
                                let Ok(control) =
                                    serde_json::from_str::<ControlMessage>(&text)
                                else {
                                    continue;
                                };
                                match control {
                                    ControlMessage::Ping {
                                        timestamp,
                                        sequence,
                                    } => {
                                        tokio::time::sleep(pong_delay).await;
                                        let pong = ControlMessage::Pong {
                                            timestamp,
                                            server_timestamp: None,
                                            sequence,
                                        };
                                        let text =
                                            serde_json::to_string(&pong).unwrap();
                                        if sink.send(Message::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    ControlMessage::StartTraffic { user_id, .. } => {
                                        let ack = ControlMessage::TrafficStarted { user_id };
                                        let text = serde_json::to_string(&ack).unwrap();
                                        sink.send(Message::Text(text)).await.ok();
                                    }
                                    ControlMessage::ConnectionTest { timestamp } => {
                                        let ack = ControlMessage::ConnectionTestResponse {
                                            timestamp,
                                        };
                                        let text = serde_json::to_string(&ack).unwrap();
                                        sink.send(Message::Text(text)).await.ok();
                                    }
                                    _ => {}
                                }
                            }
                            Message::Binary(_) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Message::Ping(payload) => {
                                sink.send(Message::Pong(payload)).await.ok();
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                });
            }
        });

        (addr, binary_frames)
    }

    fn worker_config(addr: std::net::SocketAddr) -> Arc<Config> {
        let mut config = Config::default();
        config.endpoints.base_url = Url::parse(&format!("http://{addr}/")).unwrap();
        config.household.reconnect_backoff = Duration::from_millis(100);
        Arc::new(config)
    }

    fn spawn_test_worker(
        user: UserId,
        config: Arc<Config>,
    ) -> (
        WorkerHandle,
        tokio::sync::mpsc::Receiver<WorkerEvent>,
    ) {
        let (events, event_rx) = tokio::sync::mpsc::channel(256);
        let handle = spawn_worker(WorkerParams {
            user,
            profile: UserProfile::for_user(user),
            config,
            test_id: TestId(1_700_000_000),
            events,
            cancel: CancellationToken::new(),
        });
        (handle, event_rx)
    }

    #[tokio::test]
    async fn worker_measures_ping_pong_latency_through_a_delayed_echo() {
        let (addr, _frames) = spawn_echo_server(Duration::from_millis(40)).await;
        let (handle, mut event_rx) = spawn_test_worker(UserId::Alex, worker_config(addr));

        // Wait for the first latency report (ping cadence is 2 s)
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut rtt = None;
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(5), event_rx.recv()).await {
                Ok(Some(WorkerEvent::Latency { rtt_ms, .. })) => {
                    rtt = Some(rtt_ms);
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }

        handle.stop();
        handle.join.await.unwrap();

        let rtt = rtt.expect("worker should have completed a ping/pong round trip");
        assert!(
            (38.0..=60.0).contains(&rtt),
            "RTT should be close to the injected 40 ms delay, got {rtt}"
        );
    }

    #[tokio::test]
    async fn worker_generates_marked_binary_traffic() {
        let (addr, frames) = spawn_echo_server(Duration::from_millis(1)).await;
        let (handle, mut event_rx) = spawn_test_worker(UserId::Jake, worker_config(addr));

        // Jake sends every 8 ms; half a second is plenty
        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.stop();
        handle.join.await.unwrap();

        let received = frames.load(Ordering::Relaxed);
        assert!(
            received >= 20,
            "streamer should have sent a steady packet train, server saw {received}"
        );

        // The worker reported its traffic along the way
        let mut saw_traffic = false;
        while let Ok(event) = event_rx.try_recv() {
            if let WorkerEvent::Traffic { user, update } = event {
                assert_eq!(user, UserId::Jake);
                if update.bytes > 0 {
                    saw_traffic = true;
                }
            }
        }
        assert!(saw_traffic, "worker must report nonzero traffic");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_reports_stopped_once() {
        let (addr, _frames) = spawn_echo_server(Duration::from_millis(1)).await;
        let (handle, mut event_rx) = spawn_test_worker(UserId::Sarah, worker_config(addr));

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop();
        handle.stop(); // second stop is a no-op
        handle.join.await.unwrap();

        let mut stopped = 0;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, WorkerEvent::Stopped { .. }) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1, "exactly one Stopped report");
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_reconnects_and_reports_fatal() {
        // Nothing listens on this port
        let mut config = Config::default();
        config.endpoints.base_url = Url::parse("http://127.0.0.1:1/").unwrap();
        config.household.reconnect_backoff = Duration::from_millis(20);
        config.timeouts.ws_open = Duration::from_millis(300);

        let (handle, mut event_rx) = spawn_test_worker(UserId::Computer, Arc::new(config));

        let mut saw_fatal = false;
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(10), event_rx.recv()).await {
                Ok(Some(WorkerEvent::Fatal { user, .. })) => {
                    assert_eq!(user, UserId::Computer);
                    saw_fatal = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        handle.join.await.unwrap();
        assert!(saw_fatal, "reconnect exhaustion must surface as Fatal");
    }

    #[tokio::test]
    async fn worker_follows_an_http_redirect_to_the_real_socket() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let (ws_addr, frames) = spawn_echo_server(Duration::from_millis(1)).await;

        // The advertised endpoint answers the upgrade with JSON instead
        let front = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ws/virtual-household/alex"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "redirect": true,
                "websocket_url": format!("ws://{ws_addr}/ws/virtual-household/alex"),
                "port": ws_addr.port(),
                "architecture": "process-per-user",
                "process_isolation": true,
            })))
            .mount(&front)
            .await;

        let mut config = Config::default();
        config.endpoints.base_url = Url::parse(&front.uri()).unwrap();
        config.household.reconnect_backoff = Duration::from_millis(50);

        let (handle, _event_rx) = spawn_test_worker(UserId::Alex, Arc::new(config));
        tokio::time::sleep(Duration::from_millis(700)).await;
        handle.stop();
        handle.join.await.unwrap();

        assert!(
            frames.load(Ordering::Relaxed) > 0,
            "traffic must flow through the redirected socket"
        );
    }
}
