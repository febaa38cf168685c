//! Single-user sequenced saturation test
//!
//! Runs the fixed 60 s timeline: baseline, download warmup and saturation,
//! upload warmup and saturation, then both at once. The phase controller
//! ticks the timetable; this engine starts and stops the saturation drivers
//! on phase events, accounts throughput per phase, attributes external
//! latency samples to phases, and assembles the inputs the grade layer
//! consumes. It computes no grade itself.

use crate::config::{Config, GradeThresholds};
use crate::error::{Error, Result};
use crate::metrics::{
    LatencyTracker, TrafficReporterParams, TrafficTotals, spawn_traffic_reporter,
};
use crate::payload::PayloadSource;
use crate::phase::{PhaseControllerParams, phase_deadline, spawn_phase_controller};
use crate::registry::StreamRegistry;
use crate::saturation::{
    OptimalParamsStore, SaturationContext, download, start_bidirectional, upload, warmup,
};
use crate::types::{Direction, Event, GradeInputs, Phase, TestId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Deadline for the grade-threshold config fetch
const THRESHOLDS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state behind the latency sink
struct LatencyShared {
    tracker: Arc<Mutex<LatencyTracker>>,
    current_phase: Mutex<Phase>,
    per_phase: Mutex<HashMap<Phase, Vec<f64>>>,
}

/// Handle the external latency sampler pushes round trips into
///
/// The sampler itself is outside this engine; whatever it measures lands
/// here and is attributed to the phase active at arrival time.
#[derive(Clone)]
pub struct LatencySink {
    shared: Arc<LatencyShared>,
}

impl LatencySink {
    fn new() -> Self {
        Self {
            shared: Arc::new(LatencyShared {
                tracker: Arc::new(Mutex::new(LatencyTracker::new())),
                current_phase: Mutex::new(Phase::Idle),
                per_phase: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record one measured round trip in milliseconds
    pub fn record_rtt(&self, rtt_ms: f64) {
        if let Ok(mut tracker) = self.shared.tracker.lock() {
            tracker.record_rtt(rtt_ms);
        }
        let phase = self
            .shared
            .current_phase
            .lock()
            .map(|p| *p)
            .unwrap_or(Phase::Idle);
        if let Ok(mut per_phase) = self.shared.per_phase.lock() {
            per_phase.entry(phase).or_default().push(rtt_ms);
        }
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.shared.current_phase.lock() {
            *current = phase;
        }
    }

    fn phase_mean(&self, phase: Phase) -> Option<f64> {
        let per_phase = self.shared.per_phase.lock().ok()?;
        let samples = per_phase.get(&phase)?;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// The underlying tracker, shared with the traffic reporter
    fn tracker_handle(&self) -> Arc<Mutex<LatencyTracker>> {
        self.shared.tracker.clone()
    }
}

impl std::fmt::Debug for LatencySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencySink").finish_non_exhaustive()
    }
}

/// Throughput observed for one finished phase
#[derive(Clone, Copy, Debug, Default)]
struct PhaseThroughput {
    down_bps: f64,
    up_bps: f64,
}

/// The single-user test engine (cloneable -- all state is Arc-wrapped)
#[derive(Clone)]
pub struct SingleUserTest {
    config: Arc<Config>,
    http: reqwest::Client,
    payload: PayloadSource,
    registry: StreamRegistry,
    totals: Arc<TrafficTotals>,
    latency: LatencySink,
    params: Arc<OptimalParamsStore>,
    thresholds: Arc<OnceLock<GradeThresholds>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SingleUserTest {
    /// Create a single-user test from configuration
    pub fn new(config: Config) -> Self {
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
        let registry = StreamRegistry::new(
            event_tx.clone(),
            config.timeouts.terminate,
            config.timeouts.terminate_all,
        );

        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            payload: PayloadSource::new(),
            registry,
            totals: Arc::new(TrafficTotals::new()),
            latency: LatencySink::new(),
            params: Arc::new(OptimalParamsStore::new()),
            thresholds: Arc::new(OnceLock::new()),
            event_tx,
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The sink the external latency sampler feeds
    pub fn latency_sink(&self) -> LatencySink {
        self.latency.clone()
    }

    /// The stream registry, exposed for lifecycle observation
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Optimal parameters discovered by warmup, read-only after it runs
    pub fn optimal_params(&self) -> &OptimalParamsStore {
        &self.params
    }

    /// The grade thresholds fetched (or substituted) during this run
    pub fn grade_thresholds(&self) -> Option<&GradeThresholds> {
        self.thresholds.get()
    }

    /// Fetch the latency grade threshold config, substituting the compiled
    /// fallback if the endpoint is unreachable or serves garbage
    pub async fn fetch_grade_thresholds(&self) -> GradeThresholds {
        let url = match self.config.endpoints.thresholds_url() {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "cannot build thresholds URL, using fallback");
                return GradeThresholds::fallback();
            }
        };

        let fetched = tokio::time::timeout(THRESHOLDS_FETCH_TIMEOUT, async {
            let response = self.http.get(url).send().await.ok()?;
            if !response.status().is_success() {
                return None;
            }
            response.json::<GradeThresholds>().await.ok()
        })
        .await;

        match fetched {
            Ok(Some(thresholds)) => thresholds,
            _ => {
                tracing::warn!("grade thresholds unavailable, using compiled fallback");
                GradeThresholds::fallback()
            }
        }
    }

    /// Stop the test. Idempotent: stopping twice, or after the timeline has
    /// completed, is a no-op.
    pub async fn stop_test(&self) {
        if self.completed.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("single-user test stopping");
        self.cancel.cancel();
        self.registry.terminate_all().await;
    }

    /// Run the full 60 s timeline and return the grade-layer inputs.
    #[allow(clippy::too_many_lines)]
    pub async fn run(&self) -> Result<GradeInputs> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("single-user test already started".into()));
        }

        let test_id = TestId::now();
        self.publish(Event::TestStart {
            mode: "single-user".into(),
            test_id,
        });

        let thresholds = self.fetch_grade_thresholds().await;
        self.thresholds.set(thresholds).ok();

        let ctx = SaturationContext {
            http: self.http.clone(),
            payload: self.payload.clone(),
            registry: self.registry.clone(),
            totals: self.totals.clone(),
            config: self.config.clone(),
        };

        let reporter = spawn_traffic_reporter(TrafficReporterParams {
            totals: self.totals.clone(),
            latency: self.latency.tracker_handle(),
            event_tx: self.event_tx.clone(),
            aggregate_interval: self.config.single_user.aggregate_interval,
            ema_interval: self.config.single_user.ema_interval,
            cancel: self.cancel.child_token(),
        });

        let (phase_tx, mut phase_rx) = tokio::sync::mpsc::channel(16);
        let controller = spawn_phase_controller(PhaseControllerParams {
            tick: self.config.single_user.phase_tick,
            phase_tx,
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.child_token(),
        });
        let t0 = Instant::now();

        let mut phase_throughput: HashMap<Phase, PhaseThroughput> = HashMap::new();
        let mut active_mark: Option<(Phase, Instant, u64, u64)> = None;
        let mut phase_cancel: Option<CancellationToken> = None;
        let mut phase_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        while let Some(phase) = phase_rx.recv().await {
            // Close out the ending phase: record its throughput, cancel its
            // streams, and let the supervisors tear down in the background
            // while the new phase starts on schedule.
            if let Some((ended, started_at, down0, up0)) = active_mark.take() {
                let elapsed = started_at.elapsed().as_secs_f64().max(1e-9);
                phase_throughput.insert(
                    ended,
                    PhaseThroughput {
                        down_bps: (self.totals.download_bytes() - down0) as f64 * 8.0 / elapsed,
                        up_bps: (self.totals.upload_bytes() - up0) as f64 * 8.0 / elapsed,
                    },
                );
            }
            if let Some(token) = phase_cancel.take() {
                token.cancel();
            }
            for task in phase_tasks.drain(..) {
                tokio::spawn(async move {
                    task.await.ok();
                });
            }

            self.latency.set_phase(phase);
            active_mark = Some((
                phase,
                Instant::now(),
                self.totals.download_bytes(),
                self.totals.upload_bytes(),
            ));
            let token = self.cancel.child_token();
            phase_cancel = Some(token.clone());

            match phase {
                Phase::Idle => {}
                // Unloaded latency only; the engine generates no traffic
                Phase::Baseline => {}
                Phase::DlWarmup => {
                    let ctx = ctx.clone();
                    let params = self.params.clone();
                    let deadline = phase_deadline(t0, Phase::DlWarmup)
                        .unwrap_or_else(|| Instant::now() + Duration::from_secs(7));
                    phase_tasks.push(tokio::spawn(async move {
                        let result = warmup::run_download_warmup(&ctx, deadline, &token).await;
                        params.set(Direction::Download, result);
                    }));
                }
                Phase::Dl => {
                    let params = self.params.get_or_fallback(Direction::Download);
                    let deadline = phase_deadline(t0, Phase::Dl)
                        .unwrap_or_else(|| Instant::now() + Duration::from_secs(12));
                    phase_tasks.extend(download::start_download_saturation(
                        ctx.clone(),
                        download::DownloadOptions {
                            stream_count: params.stream_count,
                            chunk_delay: self.config.single_user.chunk_delay,
                            deadline,
                        },
                        token,
                    ));
                }
                Phase::UlWarmup => {
                    let ctx = ctx.clone();
                    let params = self.params.clone();
                    let deadline = phase_deadline(t0, Phase::UlWarmup)
                        .unwrap_or_else(|| Instant::now() + Duration::from_secs(13));
                    phase_tasks.push(tokio::spawn(async move {
                        let result = warmup::run_upload_warmup(&ctx, deadline, &token).await;
                        params.set(Direction::Upload, result);
                    }));
                }
                Phase::Ul => {
                    let params = self.params.get_or_fallback(Direction::Upload);
                    let deadline = phase_deadline(t0, Phase::Ul)
                        .unwrap_or_else(|| Instant::now() + Duration::from_secs(12));
                    phase_tasks.extend(upload::start_upload_saturation(
                        ctx.clone(),
                        upload::UploadOptions {
                            stream_count: params.stream_count,
                            pending_per_stream: params.pending_per_stream,
                            chunk_size: params.chunk_size,
                            upload_delay: params.upload_delay(),
                            warmup: false,
                            ramp: None,
                            deadline,
                        },
                        token,
                    ));
                }
                Phase::Bidi => {
                    // Both directions with the recorded single-direction
                    // parameters, unchanged
                    let dl = self.params.get_or_fallback(Direction::Download);
                    let ul = self.params.get_or_fallback(Direction::Upload);
                    let deadline = phase_deadline(t0, Phase::Bidi)
                        .unwrap_or_else(|| Instant::now() + Duration::from_secs(12));
                    phase_tasks
                        .extend(start_bidirectional(&ctx, dl, ul, deadline, token).await);
                }
                Phase::Complete => {
                    break;
                }
            }
        }

        // Final teardown: every remaining stream goes away before results
        // are promoted
        if let Some(token) = phase_cancel.take() {
            token.cancel();
        }
        self.registry.terminate_all().await;
        for task in phase_tasks.drain(..) {
            task.await.ok();
        }
        controller.await.ok();
        self.cancel.cancel();
        reporter.await.ok();

        if self.stopped.load(Ordering::SeqCst) {
            // User-initiated stop: no partial results are promoted
            return Err(Error::Cancelled);
        }

        // Record the last phase mark (bidi) if the loop ended on Complete
        if let Some((ended, started_at, down0, up0)) = active_mark.take()
            && ended != Phase::Complete
        {
            let elapsed = started_at.elapsed().as_secs_f64().max(1e-9);
            phase_throughput.insert(
                ended,
                PhaseThroughput {
                    down_bps: (self.totals.download_bytes() - down0) as f64 * 8.0 / elapsed,
                    up_bps: (self.totals.upload_bytes() - up0) as f64 * 8.0 / elapsed,
                },
            );
        }

        let inputs = assemble_grade_inputs(&self.latency, &phase_throughput);
        self.completed.store(true, Ordering::SeqCst);
        self.publish(Event::TestComplete {
            summary: None,
            grade_inputs: Some(inputs.clone()),
        });
        tracing::info!("single-user test complete");
        Ok(inputs)
    }

    fn publish(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

impl std::fmt::Debug for SingleUserTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleUserTest").finish_non_exhaustive()
    }
}

/// Build the grade-layer inputs from per-phase latency and throughput
fn assemble_grade_inputs(
    latency: &LatencySink,
    phase_throughput: &HashMap<Phase, PhaseThroughput>,
) -> GradeInputs {
    let baseline = latency.phase_mean(Phase::Baseline).unwrap_or(0.0);
    let increase = |phase: Phase| -> f64 {
        latency
            .phase_mean(phase)
            .map(|mean| mean - baseline)
            .unwrap_or(0.0)
    };
    let throughput = |phase: Phase| -> PhaseThroughput {
        phase_throughput.get(&phase).copied().unwrap_or_default()
    };

    GradeInputs {
        baseline_latency_ms: baseline,
        dl_latency_increase_ms: increase(Phase::Dl),
        ul_latency_increase_ms: increase(Phase::Ul),
        bidi_latency_increase_ms: increase(Phase::Bidi),
        dl_throughput: throughput(Phase::Dl).down_bps,
        ul_throughput: throughput(Phase::Ul).up_bps,
        bidi_dl_throughput: throughput(Phase::Bidi).down_bps,
        bidi_ul_throughput: throughput(Phase::Bidi).up_bps,
    }
}
