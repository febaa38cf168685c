//! Household end-to-end test against a loopback server pair
//!
//! A wiremock instance plays the HTTP side (warmup bulk download, profile
//! update, WebSocket redirect, stop relay) while a real loopback WebSocket
//! server answers pings with a fixed injected delay. The run is shortened
//! via configuration; cadences keep their production values.

use bloatprobe::household::wire::ControlMessage;
use bloatprobe::types::{Event, UserId};
use bloatprobe::{Config, HouseholdTest};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Loopback household endpoint: acknowledges control traffic, answers pings
/// after `pong_delay`, and counts binary frames.
async fn spawn_echo_server(pong_delay: Duration) -> (std::net::SocketAddr, Arc<AtomicU64>) {
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
                            let Ok(control) = serde_json::from_str::<ControlMessage>(&text)
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
                                    let text = serde_json::to_string(&pong).unwrap();
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
                                    let ack =
                                        ControlMessage::ConnectionTestResponse { timestamp };
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

/// Mount the full HTTP side of a household run on a wiremock server.
async fn mount_http_side(front: &MockServer, ws_addr: std::net::SocketAddr) {
    Mock::given(method("GET"))
        .and(path("/api/warmup/bulk-download"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5_u8; 2_000_000]))
        .mount(front)
        .await;

    Mock::given(method("POST"))
        .and(path("/ws/virtual-household/computer/update-profile"))
        .respond_with(ResponseTemplate::new(200))
        .mount(front)
        .await;

    for user in UserId::ALL {
        Mock::given(method("GET"))
            .and(path(format!("/ws/virtual-household/{user}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "redirect": true,
                "websocket_url": format!("ws://{ws_addr}/ws/virtual-household/{user}"),
                "port": ws_addr.port(),
                "architecture": "process-per-user",
                "process_isolation": true,
            })))
            .mount(front)
            .await;
    }

    Mock::given(method("POST"))
        .and(path_regex(
            r"^/api/virtual-household/stop-user-sessions/\d+$",
        ))
        .respond_with(ResponseTemplate::new(200))
        .mount(front)
        .await;
}

fn short_run_config(front_uri: &str) -> Config {
    let mut config = Config::default();
    config.endpoints.base_url = url::Url::parse(front_uri).unwrap();
    // Short probe and simulation windows; cadences stay at production values
    config.timeouts.warmup_download = Duration::from_secs(1);
    config.timeouts.warmup_grace = Duration::from_secs(2);
    config.household.duration = Duration::from_secs(7);
    config
}

#[tokio::test]
async fn household_run_measures_latency_and_produces_a_summary() {
    let (ws_addr, frames) = spawn_echo_server(Duration::from_millis(40)).await;
    let front = MockServer::start().await;
    mount_http_side(&front, ws_addr).await;

    let test = HouseholdTest::new(short_run_config(&front.uri()));
    let mut events = test.subscribe();

    let summary = test.run().await.expect("household run should complete");

    // Every user is represented and binary traffic actually flowed
    assert_eq!(summary.users.len(), 4);
    assert!(
        frames.load(Ordering::Relaxed) > 100,
        "four workers should have pushed a lot of packets, saw {}",
        frames.load(Ordering::Relaxed)
    );

    // Latency measurements track the injected 40 ms pong delay. Ping
    // cadence is 2 s, so a 7 s run yields roughly 3 pings per user.
    let mut latency_samples = Vec::new();
    let mut saw_complete = false;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::LatencyMeasurement(m) => latency_samples.push(m.latency),
            Event::TestComplete { summary, .. } => {
                assert!(summary.is_some(), "household completion carries a summary");
                saw_complete = true;
            }
            _ => {}
        }
    }
    assert!(saw_complete, "test-complete must be published");
    assert!(
        !latency_samples.is_empty(),
        "ping/pong must have produced latency measurements"
    );
    let mean = latency_samples.iter().sum::<f64>() / latency_samples.len() as f64;
    assert!(
        (38.0..=70.0).contains(&mean),
        "mean reported latency should track the injected 40 ms delay, got {mean}"
    );

    // The stop relay was called on teardown
    let stop_calls = front
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            r.url
                .path()
                .starts_with("/api/virtual-household/stop-user-sessions/")
        })
        .count();
    assert_eq!(stop_calls, 1, "exactly one central stop relay POST");
}

#[tokio::test]
async fn household_pushes_exactly_one_profile_update_before_simulating() {
    let (ws_addr, _frames) = spawn_echo_server(Duration::from_millis(5)).await;
    let front = MockServer::start().await;
    mount_http_side(&front, ws_addr).await;

    let mut config = short_run_config(&front.uri());
    config.household.duration = Duration::from_secs(3);

    let test = HouseholdTest::new(config);
    test.run().await.expect("household run should complete");

    let requests = front.received_requests().await.unwrap();
    let profile_updates: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/ws/virtual-household/computer/update-profile")
        .collect();
    assert_eq!(
        profile_updates.len(),
        1,
        "the adaptive profile must be pushed exactly once"
    );

    let body: serde_json::Value = serde_json::from_slice(&profile_updates[0].body).unwrap();
    assert_eq!(body["user_type"], "computer");
    assert!(
        body["profile_updates"]["download_mbps"].as_f64().unwrap() > 0.0,
        "the probe's p80 must land in the update"
    );

    // Ordering: the update precedes any WS redirect probe (the simulation)
    let update_index = requests
        .iter()
        .position(|r| r.url.path() == "/ws/virtual-household/computer/update-profile")
        .unwrap();
    let first_ws_index = requests
        .iter()
        .position(|r| {
            r.url.path().starts_with("/ws/virtual-household/")
                && !r.url.path().ends_with("/update-profile")
        })
        .unwrap();
    assert!(
        update_index < first_ws_index,
        "the household phase must not begin before the profile update"
    );
}

#[tokio::test]
async fn stop_mid_run_tears_down_and_is_idempotent() {
    let (ws_addr, _frames) = spawn_echo_server(Duration::from_millis(5)).await;
    let front = MockServer::start().await;
    mount_http_side(&front, ws_addr).await;

    let mut config = short_run_config(&front.uri());
    config.household.duration = Duration::from_secs(60);

    let test = HouseholdTest::new(config);
    let runner = test.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(3)).await;
    test.stop();
    test.stop(); // double stop is a no-op

    let result = tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .expect("a stopped run must wind down promptly")
        .unwrap();
    // A stop mid-run still yields the summary collected so far
    assert!(result.is_ok(), "stop is not a failure: {result:?}");
}
