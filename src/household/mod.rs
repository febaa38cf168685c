//! Virtual household simulation -- four concurrent users sharing one link.
//!
//! The orchestrator runs a two-phase test: an adaptive speed probe that
//! sizes the bulk user, then the concurrent simulation with one worker per
//! user. Workers report through an event sink channel; the orchestrator
//! owns the receiver, aggregates per-user metrics, derives sentiment, and
//! publishes to the view layer.
//!
//! Submodules:
//! - [`profile`] - per-user traffic shapes, sentiment weights, message tables
//! - [`wire`] - binary packet codec and JSON control frames
//! - [`worker`] - one task per user owning its WebSocket
//! - [`probe`] - adaptive speed probe and central stop relay

pub(crate) mod probe;
pub mod profile;
pub mod wire;
pub(crate) mod worker;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::household::profile::{SentimentScorer, UserProfile, message_for};
use crate::household::worker::{WorkerEvent, WorkerHandle, WorkerParams, spawn_worker};
use crate::metrics::{LatencyTracker, MetricsRing, RawMetric};
use crate::types::{
    Event, LatencyMeasurement, OverallSummary, RunSummary, Sentiment, SentimentLevel,
    SentimentTrend, TestId, UserId, UserSummary,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Window for workers to wind down after the run ends
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The virtual household test (cloneable -- all state is Arc-wrapped)
#[derive(Clone)]
pub struct HouseholdTest {
    config: Arc<Config>,
    http: reqwest::Client,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    started: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Rolling per-user aggregates kept by the orchestrator
///
/// Raw worker reports land in a bounded ring (the last 100 observations);
/// the run summary folds its per-user throughput from that ring rather than
/// from unbounded accumulators.
struct UserStats {
    profile: UserProfile,
    scorer: SentimentScorer,
    tracker: LatencyTracker,
    metrics: MetricsRing,
    sentiment: Option<Sentiment>,
    latency_ms: f64,
    jitter_ms: f64,
    loss: f64,
}

impl UserStats {
    fn new(profile: UserProfile) -> Self {
        Self {
            profile,
            scorer: SentimentScorer::new(),
            tracker: LatencyTracker::new(),
            metrics: MetricsRing::new(),
            sentiment: None,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss: 0.0,
        }
    }
}

impl HouseholdTest {
    /// Create a household test from configuration
    pub fn new(config: Config) -> Self {
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
            event_tx,
            started: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to engine events
    ///
    /// Multiple subscribers are supported; a subscriber that falls behind
    /// loses events rather than blocking the engine.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Stop the run. Idempotent: stopping twice, or after completion, is a
    /// no-op.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the two-phase household test to completion.
    ///
    /// Phase 1 probes the link and sizes the adaptive bulk user; phase 2
    /// runs the four workers concurrently for the configured duration. A
    /// worker that cannot hold its connection aborts the run with no
    /// partial results.
    pub async fn run(&self) -> Result<RunSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "household test already started".into(),
            ));
        }

        let test_id = TestId::now();
        self.publish(Event::TestStart {
            mode: "household".into(),
            test_id,
        });

        // ── Phase 1: adaptive speed probe ───────────────────────────────
        let measured_mbps = match probe::measure_bulk_download_mbps(&self.http, &self.config).await
        {
            Ok(mbps) => mbps,
            Err(e) => {
                self.publish(Event::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        tracing::info!(p80_mbps = measured_mbps, "adaptive probe complete");

        let mut profiles: HashMap<UserId, UserProfile> = UserProfile::household()
            .into_iter()
            .map(|p| (p.user, p))
            .collect();
        if let Some(computer) = profiles.get_mut(&UserId::Computer) {
            computer.set_target_down_once(measured_mbps);

            // Exactly one POST, no retry. The simulation waits for this to
            // return; on rejection the measured target still applies
            // locally and only server-side shaping falls back.
            let upload_mbps = computer.target_up_mbps;
            if let Err(e) =
                probe::push_computer_profile(&self.http, &self.config, measured_mbps, upload_mbps)
                    .await
            {
                tracing::warn!(error = %e, "profile update not acknowledged, server keeps defaults");
            }
        }

        // ── Phase 2: concurrent user simulation ─────────────────────────
        let (event_sink, mut worker_events) = tokio::sync::mpsc::channel(512);
        let mut handles: Vec<WorkerHandle> = Vec::with_capacity(UserId::ALL.len());
        let mut stats: HashMap<UserId, UserStats> = HashMap::new();

        for user in UserId::ALL {
            let profile = profiles
                .get(&user)
                .cloned()
                .unwrap_or_else(|| UserProfile::for_user(user));
            stats.insert(user, UserStats::new(profile.clone()));
            handles.push(spawn_worker(WorkerParams {
                user,
                profile,
                config: self.config.clone(),
                test_id,
                events: event_sink.clone(),
                cancel: self.cancel.child_token(),
            }));
        }
        drop(event_sink);

        let run_end = tokio::time::Instant::now() + self.config.household.duration;
        let mut fatal: Option<Error> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(run_end) => break,
                _ = self.cancel.cancelled() => break,
                event = worker_events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(e) = self.handle_worker_event(&mut stats, event) {
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }

        // ── Teardown ────────────────────────────────────────────────────
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, handle.join)
                .await
                .is_err()
            {
                tracing::warn!("a worker did not drain within the teardown window");
            }
        }
        probe::relay_stop_sessions(&self.http, &self.config, Some(test_id)).await;

        if let Some(e) = fatal {
            self.publish(Event::Error {
                message: e.to_string(),
            });
            return Err(e);
        }

        let summary = build_summary(&stats);
        self.publish(Event::TestComplete {
            summary: Some(summary.clone()),
            grade_inputs: None,
        });
        Ok(summary)
    }

    /// Fold one worker report into the aggregates. Returns `Some(error)`
    /// when the run must abort.
    fn handle_worker_event(
        &self,
        stats: &mut HashMap<UserId, UserStats>,
        event: WorkerEvent,
    ) -> Option<Error> {
        match event {
            WorkerEvent::Latency {
                user,
                rtt_ms,
                jitter_ms,
                loss,
            } => {
                if let Some(user_stats) = stats.get_mut(&user) {
                    user_stats.tracker.record_rtt(rtt_ms);
                    user_stats.latency_ms = user_stats.tracker.mean().unwrap_or(rtt_ms);
                    user_stats.jitter_ms = jitter_ms;
                    user_stats.loss = loss;

                    let severity = severity_for(&user_stats.profile, rtt_ms);
                    self.publish(Event::LatencyMeasurement(LatencyMeasurement {
                        user_id: user,
                        latency: rtt_ms,
                        jitter: jitter_ms,
                        bufferbloat_severity: severity,
                        timestamp: chrono::Utc::now(),
                    }));
                }
                None
            }
            WorkerEvent::Traffic { user, update } => {
                if let Some(user_stats) = stats.get_mut(&user) {
                    user_stats.metrics.record(RawMetric {
                        download_bps: update.download_throughput,
                        upload_bps: update.upload_throughput,
                        latency_ms: update.latency,
                        jitter_ms: update.jitter,
                        loss: user_stats.loss,
                    });

                    let target = user_stats.profile.target_down_bps() as f64;
                    let ratio = if target > 0.0 {
                        update.download_throughput / target
                    } else {
                        1.0
                    };
                    let sentiment = user_stats.scorer.tick(
                        &user_stats.profile,
                        user_stats.latency_ms,
                        user_stats.jitter_ms,
                        user_stats.loss,
                        ratio,
                    );
                    user_stats.sentiment = Some(sentiment);

                    self.publish(Event::TrafficUpdate(update));
                }
                None
            }
            WorkerEvent::Inactive { user, silent_for } => {
                tracing::warn!(user = %user, silent_ms = silent_for.as_millis(), "worker went inactive");
                None
            }
            WorkerEvent::Fatal { user, message } => Some(Error::Fatal(format!(
                "{user} cannot hold its connection: {message}"
            ))),
            WorkerEvent::Stopped { .. } => None,
        }
    }

    fn publish(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

impl std::fmt::Debug for HouseholdTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HouseholdTest").finish_non_exhaustive()
    }
}

/// Coarse bufferbloat severity tag against the user's latency budget
fn severity_for(profile: &UserProfile, rtt_ms: f64) -> Option<String> {
    if rtt_ms > 2.0 * profile.latency_threshold_ms {
        Some("severe".into())
    } else if rtt_ms > profile.latency_threshold_ms {
        Some("moderate".into())
    } else {
        None
    }
}

/// Neutral sentiment for a user that produced no reports
fn neutral_sentiment() -> Sentiment {
    Sentiment {
        score: 50.0,
        level: SentimentLevel::Fair,
        trend: SentimentTrend::Stable,
    }
}

fn build_summary(stats: &HashMap<UserId, UserStats>) -> RunSummary {
    let mut users: Vec<UserSummary> = UserId::ALL
        .iter()
        .filter_map(|user| stats.get(user))
        .map(|s| UserSummary {
            user_id: s.profile.user,
            download_throughput: s.metrics.mean_download_bps(),
            upload_throughput: s.metrics.mean_upload_bps(),
            mean_latency_ms: s.latency_ms,
            jitter_ms: s.jitter_ms,
            loss: s.loss,
            sentiment: s.sentiment.unwrap_or_else(neutral_sentiment),
        })
        .collect();
    users.sort_by_key(|u| u.user_id.as_str());

    let overall = OverallSummary {
        total_download_throughput: users.iter().map(|u| u.download_throughput).sum(),
        total_upload_throughput: users.iter().map(|u| u.upload_throughput).sum(),
        worst_latency_ms: users
            .iter()
            .map(|u| u.mean_latency_ms)
            .fold(0.0, f64::max),
        worst_jitter_ms: users.iter().map(|u| u.jitter_ms).fold(0.0, f64::max),
        worst_score: users
            .iter()
            .map(|u| u.sentiment.score)
            .fold(100.0, f64::min),
    };

    let recommendations = recommendations_for(&users);

    RunSummary {
        users,
        overall,
        recommendations,
    }
}

fn recommendations_for(users: &[UserSummary]) -> Vec<String> {
    let Some(worst) = users.iter().min_by(|a, b| {
        a.sentiment
            .score
            .partial_cmp(&b.sentiment.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) else {
        return Vec::new();
    };

    let mut recommendations = Vec::new();
    match worst.sentiment.level {
        SentimentLevel::Excellent => {
            recommendations
                .push("Your connection handled the whole household comfortably.".to_string());
        }
        SentimentLevel::Good => {
            recommendations.push(format!(
                "Mostly smooth, though {} felt occasional pressure under load.",
                worst.user_id
            ));
        }
        SentimentLevel::Fair | SentimentLevel::Poor => {
            recommendations.push(format!(
                "{}: {}",
                worst.user_id,
                message_for(worst.user_id, worst.sentiment.level, worst.sentiment.trend)
            ));
            recommendations.push(
                "Enable Smart Queue Management (SQM / fq_codel / CAKE) on your router to cut \
                 latency under load."
                    .to_string(),
            );
        }
    }
    recommendations
}
