//! Throughput and latency accounting
//!
//! Two throughput views are maintained on purpose: the raw sliding window
//! feeds decisions (warmup convergence, saturation checks) while the
//! exponential moving average feeds human-facing readouts. Latency keeps a
//! short ring of round trips and reports mean and sample standard deviation.

use crate::types::{ActivityStatus, Event, TrafficUpdate};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sliding-window horizon for raw throughput
pub const WINDOW_HORIZON: Duration = Duration::from_secs(5);

/// Minimum Δt used when computing windowed throughput. Prevents spiky-fast
/// reads from overstating very short bursts.
pub const WINDOW_MIN_SPAN: Duration = Duration::from_secs(1);

/// Smoothing factor for the UI-facing moving average
pub const EMA_ALPHA: f64 = 0.3;

/// Round trips retained per latency tracker
pub const RTT_RING_CAPACITY: usize = 10;

/// Raw metric samples retained per household user
pub const RAW_METRIC_RING_CAPACITY: usize = 100;

/// Zero-rate updates after which the smoothed readout snaps to zero
const EMA_ZERO_SNAP_STREAK: u32 = 3;

/// Time-ordered ring of (timestamp, bytes) events over a bounded horizon
///
/// On query, events older than the horizon are dropped; throughput is
/// Δbytes / max(Δt, 1 s) in bits per second, zero when the ring is empty.
#[derive(Debug)]
pub struct SlidingWindow {
    samples: VecDeque<(Instant, u64)>,
    horizon: Duration,
}

impl SlidingWindow {
    /// Create a window with the default 5 s horizon
    pub fn new() -> Self {
        Self::with_horizon(WINDOW_HORIZON)
    }

    /// Create a window with a custom horizon
    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            horizon,
        }
    }

    /// Record bytes observed at `now`
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    /// Current throughput in bits per second
    ///
    /// The oldest event's bytes accumulated before its own timestamp, so
    /// they fall outside the measured span and are excluded from Δbytes.
    pub fn bps(&mut self, now: Instant) -> f64 {
        self.prune(now);

        let Some(&(oldest, oldest_bytes)) = self.samples.front() else {
            return 0.0;
        };

        let total_bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        let delta_bytes = if self.samples.len() >= 2 {
            total_bytes - oldest_bytes
        } else {
            oldest_bytes
        };
        let span = now.duration_since(oldest).max(WINDOW_MIN_SPAN);
        (delta_bytes as f64 * 8.0) / span.as_secs_f64()
    }

    /// Drop the ring entirely
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.horizon);
        if let Some(cutoff) = cutoff {
            while let Some(&(ts, _)) = self.samples.front() {
                if ts < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential moving average of throughput for human-facing readouts
///
/// Updated on a fixed cadence from the bytes accumulated in each interval.
/// A short streak of zero-rate intervals snaps the value to zero so a
/// stopped transfer reads as stopped instead of decaying from its peak for
/// many seconds.
#[derive(Debug)]
pub struct Ema {
    value: f64,
    alpha: f64,
    zero_streak: u32,
}

impl Ema {
    /// Create a smoother with α = 0.3
    pub fn new() -> Self {
        Self::with_alpha(EMA_ALPHA)
    }

    /// Create a smoother with a custom α
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha,
            zero_streak: 0,
        }
    }

    /// Feed the bytes accumulated over `interval`
    pub fn update(&mut self, bytes: u64, interval: Duration) {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return;
        }

        if bytes == 0 {
            self.zero_streak += 1;
            if self.zero_streak >= EMA_ZERO_SNAP_STREAK {
                self.value = 0.0;
                return;
            }
        } else {
            self.zero_streak = 0;
        }

        let rate_bps = (bytes as f64 * 8.0) / secs;
        self.value = self.alpha * rate_bps + (1.0 - self.alpha) * self.value;
    }

    /// Current smoothed value in bits per second
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Default for Ema {
    fn default() -> Self {
        Self::new()
    }
}

/// Round-trip latency tracker
///
/// Keeps the last ten round trips; reports mean, sample standard deviation
/// (jitter), and ping loss clipped to [0, 1].
#[derive(Debug, Default)]
pub struct LatencyTracker {
    rtts: VecDeque<f64>,
    pings_sent: u64,
    pongs_received: u64,
}

impl LatencyTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a ping left the client
    pub fn record_ping(&mut self) {
        self.pings_sent += 1;
    }

    /// Record a completed round trip in milliseconds
    pub fn record_rtt(&mut self, rtt_ms: f64) {
        self.pongs_received += 1;
        if self.rtts.len() == RTT_RING_CAPACITY {
            self.rtts.pop_front();
        }
        self.rtts.push_back(rtt_ms);
    }

    /// Mean of the retained round trips, or `None` before the first pong
    pub fn mean(&self) -> Option<f64> {
        if self.rtts.is_empty() {
            return None;
        }
        Some(self.rtts.iter().sum::<f64>() / self.rtts.len() as f64)
    }

    /// Sample standard deviation of the retained round trips
    ///
    /// `None` until two samples exist (n−1 in the denominator).
    pub fn jitter(&self) -> Option<f64> {
        let n = self.rtts.len();
        if n < 2 {
            return None;
        }
        let mean = self.rtts.iter().sum::<f64>() / n as f64;
        let variance =
            self.rtts.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
        Some(variance.sqrt())
    }

    /// Ping loss fraction, clipped to [0, 1]
    pub fn loss(&self) -> f64 {
        if self.pings_sent == 0 {
            return 0.0;
        }
        let loss = 1.0 - self.pongs_received as f64 / self.pings_sent as f64;
        loss.clamp(0.0, 1.0)
    }

    /// Pings sent so far
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Pongs received so far
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received
    }
}

/// One raw per-user metrics observation, as reported on a worker tick
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawMetric {
    /// Sliding-window download throughput at sample time, bits per second
    pub download_bps: f64,
    /// Sliding-window upload throughput at sample time, bits per second
    pub upload_bps: f64,
    /// Mean round-trip latency at sample time, milliseconds
    pub latency_ms: Option<f64>,
    /// Jitter at sample time, milliseconds
    pub jitter_ms: Option<f64>,
    /// Ping loss fraction at sample time
    pub loss: f64,
}

/// Bounded ring of raw metric samples for one household user
///
/// Holds the last [`RAW_METRIC_RING_CAPACITY`] observations; older samples
/// fall off the front, same discipline as the RTT ring. Run summaries fold
/// their per-user aggregates from here.
#[derive(Debug, Default)]
pub struct MetricsRing {
    samples: VecDeque<RawMetric>,
}

impl MetricsRing {
    /// Create an empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation, evicting the oldest at capacity
    pub fn record(&mut self, sample: RawMetric) {
        if self.samples.len() == RAW_METRIC_RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Samples currently retained
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True before the first observation
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The most recent observation
    pub fn latest(&self) -> Option<&RawMetric> {
        self.samples.back()
    }

    /// Mean download throughput over the retained samples, bits per second
    pub fn mean_download_bps(&self) -> f64 {
        self.mean(|s| s.download_bps)
    }

    /// Mean upload throughput over the retained samples, bits per second
    pub fn mean_upload_bps(&self) -> f64 {
        self.mean(|s| s.upload_bps)
    }

    fn mean(&self, field: impl Fn(&RawMetric) -> f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(field).sum::<f64>() / self.samples.len() as f64
    }
}

/// Shared byte and packet totals, written by stream tasks and sampled by the
/// reporter. Counter updates happen-before the publication of any sample
/// that includes them (atomics are read after the write on the same counter).
#[derive(Debug, Default)]
pub struct TrafficTotals {
    download_bytes: AtomicU64,
    upload_bytes: AtomicU64,
    packets: AtomicU64,
}

impl TrafficTotals {
    /// Create zeroed totals
    pub fn new() -> Self {
        Self::default()
    }

    /// Count bytes received on a download stream
    pub fn record_download(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count bytes confirmed sent on an upload stream
    pub fn record_upload(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Total download bytes so far
    pub fn download_bytes(&self) -> u64 {
        self.download_bytes.load(Ordering::Relaxed)
    }

    /// Total upload bytes so far
    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    /// Transfer events (chunks received + POSTs completed) so far
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

/// Parameters for spawning the single-user traffic reporter
pub(crate) struct TrafficReporterParams {
    /// Shared byte totals written by the saturation drivers
    pub totals: Arc<TrafficTotals>,
    /// Latency accountant fed by the external sampler
    pub latency: Arc<std::sync::Mutex<LatencyTracker>>,
    /// Event broadcast sender
    pub event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Publish cadence (200 ms in single-user mode)
    pub aggregate_interval: Duration,
    /// Smoothed-readout cadence (500 ms)
    pub ema_interval: Duration,
    /// Cancellation token
    pub cancel: CancellationToken,
}

/// Spawn a background task that publishes consolidated throughput reports.
pub(crate) fn spawn_traffic_reporter(
    params: TrafficReporterParams,
) -> tokio::task::JoinHandle<()> {
    let TrafficReporterParams {
        totals,
        latency,
        event_tx,
        aggregate_interval,
        ema_interval,
        cancel,
    } = params;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(aggregate_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut down_window = SlidingWindow::new();
        let mut up_window = SlidingWindow::new();
        let mut ema = Ema::new();

        let mut last_down = totals.download_bytes();
        let mut last_up = totals.upload_bytes();
        let mut ema_bytes: u64 = 0;
        let mut last_ema_update = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();

                    let down = totals.download_bytes();
                    let up = totals.upload_bytes();
                    let delta_down = down.saturating_sub(last_down);
                    let delta_up = up.saturating_sub(last_up);
                    last_down = down;
                    last_up = up;

                    down_window.record(now, delta_down);
                    up_window.record(now, delta_up);

                    ema_bytes += delta_down + delta_up;
                    if now.duration_since(last_ema_update) >= ema_interval {
                        ema.update(ema_bytes, now.duration_since(last_ema_update));
                        ema_bytes = 0;
                        last_ema_update = now;
                    }

                    let status = if delta_down + delta_up > 0 {
                        ActivityStatus::Active
                    } else {
                        ActivityStatus::Idle
                    };

                    let (latency_ms, jitter_ms) = match latency.lock() {
                        Ok(tracker) => (tracker.mean(), tracker.jitter()),
                        Err(_) => (None, None),
                    };

                    // Non-blocking publish; a lagging subscriber drops updates
                    event_tx
                        .send(Event::TrafficUpdate(TrafficUpdate {
                            user_id: None,
                            throughput: ema.value(),
                            download_throughput: down_window.bps(now),
                            upload_throughput: up_window.bps(now),
                            status,
                            packets: totals.packets(),
                            bytes: down + up,
                            latency: latency_ms,
                            jitter: jitter_ms,
                        }))
                        .ok();
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
    })
}

/// Percentile of a sample set by nearest-rank, ignoring non-finite values
///
/// Returns `None` when no finite samples remain -- the caller falls back to
/// documented defaults in that case.
pub(crate) fn percentile(samples: &[f64], p: f64) -> Option<f64> {
    let mut finite: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((finite.len() - 1) as f64 * p).round() as usize;
    Some(finite[idx.min(finite.len() - 1)])
}
