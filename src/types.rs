//! Core types and events for bloatprobe

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a traffic stream
///
/// Assigned by the stream registry; never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Create a new StreamId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<StreamId> for u64 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a test run
///
/// Seconds since the Unix epoch at run start; also used as the `test_id`
/// query parameter on household WebSocket endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub u64);

impl TestId {
    /// Create a TestId from the current wall clock
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(secs)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Traffic direction of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server-to-client traffic
    Download,
    /// Client-to-server traffic
    Upload,
}

impl Direction {
    /// Lowercase name, as used in lifecycle events
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the single-user test timeline
///
/// Transitions are strictly forward; the phase controller walks this
/// ordering on a wall-clock schedule and never revisits an earlier phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Not started yet
    Idle,
    /// Unloaded latency measurement, no generated traffic
    Baseline,
    /// Download parameter discovery
    DlWarmup,
    /// Download saturation
    Dl,
    /// Upload parameter discovery
    UlWarmup,
    /// Upload saturation
    Ul,
    /// Simultaneous download and upload saturation
    Bidi,
    /// Timeline exhausted
    Complete,
}

impl Phase {
    /// The phase that follows this one, or `None` after `Complete`
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Baseline),
            Phase::Baseline => Some(Phase::DlWarmup),
            Phase::DlWarmup => Some(Phase::Dl),
            Phase::Dl => Some(Phase::UlWarmup),
            Phase::UlWarmup => Some(Phase::Ul),
            Phase::Ul => Some(Phase::Bidi),
            Phase::Bidi => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    /// Human-readable phase string for the user-visible surface
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Baseline => "baseline",
            Phase::DlWarmup => "dl-warmup",
            Phase::Dl => "dl",
            Phase::UlWarmup => "ul-warmup",
            Phase::Ul => "ul",
            Phase::Bidi => "bidi",
            Phase::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Virtual household user identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserId {
    /// Gamer -- small packets, tight latency budget
    Alex,
    /// Video call -- codec-shaped GOP traffic
    Sarah,
    /// HD streaming -- large download-heavy bursts
    Jake,
    /// Bulk transfer -- adaptive background load
    Computer,
}

impl UserId {
    /// All four household users, in canonical order
    pub const ALL: [UserId; 4] = [UserId::Alex, UserId::Sarah, UserId::Jake, UserId::Computer];

    /// Lowercase id used in endpoint paths and events
    pub fn as_str(&self) -> &'static str {
        match self {
            UserId::Alex => "alex",
            UserId::Sarah => "sarah",
            UserId::Jake => "jake",
            UserId::Computer => "computer",
        }
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "alex" => Ok(UserId::Alex),
            "sarah" => Ok(UserId::Sarah),
            "jake" => Ok(UserId::Jake),
            "computer" => Ok(UserId::Computer),
            other => Err(format!("unknown user id: {other}")),
        }
    }
}

/// Reported activity of a stream or user at publish time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    /// Traffic observed within the current window
    Active,
    /// No traffic in the current window
    Idle,
}

/// Stream lifecycle transition kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    /// Stream was registered and is live
    Created,
    /// Stream was removed from the registry
    Terminated,
}

/// Consolidated throughput report for a user or for the whole single-user run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficUpdate {
    /// Household user this report belongs to; `None` for single-user mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    /// Smoothed total throughput in bits per second (for human-facing readouts)
    pub throughput: f64,

    /// Raw sliding-window download throughput in bits per second
    pub download_throughput: f64,

    /// Raw sliding-window upload throughput in bits per second
    pub upload_throughput: f64,

    /// Whether traffic was observed in the current window
    pub status: ActivityStatus,

    /// Packets (or completed transfers) observed so far
    pub packets: u64,

    /// Total bytes observed so far, both directions
    pub bytes: u64,

    /// Mean round-trip latency in milliseconds, when a sampler is attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,

    /// Sample standard deviation of recent round trips, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

/// A single latency observation for a household user
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMeasurement {
    /// User the measurement belongs to
    pub user_id: UserId,

    /// Round-trip latency in milliseconds
    pub latency: f64,

    /// Jitter (sample stdev of the last RTTs) in milliseconds
    pub jitter: f64,

    /// Coarse severity tag when latency exceeds the user's threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bufferbloat_severity: Option<String>,

    /// Wall-clock timestamp of the observation
    pub timestamp: DateTime<Utc>,
}

/// Derived per-user experience score
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    /// Score in [0, 100]
    pub score: f64,
    /// Banded quality level
    pub level: SentimentLevel,
    /// Direction the score has been moving
    pub trend: SentimentTrend,
}

/// Quality band for a sentiment score
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLevel {
    /// Score >= 90
    Excellent,
    /// Score >= 70
    Good,
    /// Score >= 50
    Fair,
    /// Score < 50
    Poor,
}

/// Trend of a sentiment score over recent ticks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentTrend {
    /// Score rising
    Improving,
    /// Score flat
    Stable,
    /// Score falling
    Degrading,
}

/// Per-user results carried on `test-complete` for household runs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    /// User these results belong to
    pub user_id: UserId,
    /// Mean download throughput over the run, bits per second
    pub download_throughput: f64,
    /// Mean upload throughput over the run, bits per second
    pub upload_throughput: f64,
    /// Mean round-trip latency in milliseconds
    pub mean_latency_ms: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Packet loss fraction in [0, 1]
    pub loss: f64,
    /// Final sentiment for the user
    pub sentiment: Sentiment,
}

/// Household-wide results carried on `test-complete`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Per-user results
    pub users: Vec<UserSummary>,
    /// Aggregate view across users
    pub overall: OverallSummary,
    /// Human-readable recommendations derived from the worst user experience
    pub recommendations: Vec<String>,
}

/// Aggregate results across all household users
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallSummary {
    /// Sum of per-user download throughput, bits per second
    pub total_download_throughput: f64,
    /// Sum of per-user upload throughput, bits per second
    pub total_upload_throughput: f64,
    /// Worst per-user mean latency in milliseconds
    pub worst_latency_ms: f64,
    /// Worst per-user jitter in milliseconds
    pub worst_jitter_ms: f64,
    /// Lowest per-user sentiment score
    pub worst_score: f64,
}

/// Inputs the external grade layer needs to compute a grade
///
/// The engine surfaces these and deliberately computes no grade itself:
/// which of the legacy formulas applies is the grade layer's decision.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeInputs {
    /// Mean unloaded latency during the baseline phase, milliseconds
    pub baseline_latency_ms: f64,
    /// Latency increase over baseline during download saturation, milliseconds
    pub dl_latency_increase_ms: f64,
    /// Latency increase over baseline during upload saturation, milliseconds
    pub ul_latency_increase_ms: f64,
    /// Latency increase over baseline during bidirectional saturation, milliseconds
    pub bidi_latency_increase_ms: f64,
    /// Sustained download throughput during the dl phase, bits per second
    pub dl_throughput: f64,
    /// Sustained upload throughput during the ul phase, bits per second
    pub ul_throughput: f64,
    /// Sustained download throughput during bidi, bits per second
    pub bidi_dl_throughput: f64,
    /// Sustained upload throughput during bidi, bits per second
    pub bidi_ul_throughput: f64,
}

/// Event emitted by the engine
///
/// Consumers subscribe via a broadcast channel; publication is non-blocking
/// and a lagging subscriber loses events rather than stalling the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A test run has started
    #[serde(rename = "test-start")]
    TestStart {
        /// "single-user" or "household"
        mode: String,
        /// Run identifier
        test_id: TestId,
    },

    /// The single-user phase controller crossed a timetable threshold
    #[serde(rename = "phase-changed")]
    PhaseChanged {
        /// The phase that just began
        phase: Phase,
    },

    /// Consolidated throughput report
    #[serde(rename = "traffic-update")]
    TrafficUpdate(TrafficUpdate),

    /// A household latency sample
    #[serde(rename = "latency-measurement")]
    LatencyMeasurement(LatencyMeasurement),

    /// The run finished; carries everything the result layers consume
    #[serde(rename = "test-complete")]
    TestComplete {
        /// Household summary, present for household runs
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<RunSummary>,
        /// Grade-layer inputs, present for single-user runs
        #[serde(skip_serializing_if = "Option::is_none")]
        grade_inputs: Option<GradeInputs>,
    },

    /// A stream was created or terminated
    #[serde(rename = "stream:lifecycle", rename_all = "camelCase")]
    StreamLifecycle {
        /// Created or terminated
        kind: LifecycleKind,
        /// The stream's id
        stream_id: StreamId,
        /// The stream's direction
        stream_type: Direction,
    },

    /// Every stream has been terminated after a `terminate_all`
    #[serde(rename = "stream:all_terminated")]
    AllTerminated,

    /// The graceful termination window expired and state was forced closed
    #[serde(rename = "stream:emergency_cleanup")]
    EmergencyCleanup,

    /// A fatal condition aborted the run
    #[serde(rename = "error")]
    Error {
        /// One-line human-readable cause
        message: String,
    },
}

/// Parameters discovered by warmup and consumed by saturation phases
///
/// Written exactly once per direction per run; bidi reuses both records
/// unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimalParameters {
    /// Number of concurrent streams
    pub stream_count: usize,
    /// In-flight POSTs per upload stream
    pub pending_per_stream: usize,
    /// Payload bytes per upload POST
    pub chunk_size: usize,
    /// Delay between upload chunks, milliseconds (0 = none)
    pub upload_delay_ms: u64,
}

impl OptimalParameters {
    /// Documented fallback used when warmup fails or produces degenerate values
    pub fn fallback() -> Self {
        Self {
            stream_count: 2,
            pending_per_stream: 2,
            chunk_size: 256 * 1024,
            upload_delay_ms: 0,
        }
    }

    /// Clamp to the documented validity envelope, substituting fallback
    /// fields for anything degenerate (invalid parameters from warmup are a
    /// configuration error: substitute and continue, never abort)
    pub fn sanitized(self) -> Self {
        let fallback = Self::fallback();
        Self {
            stream_count: if self.stream_count >= 1 {
                self.stream_count
            } else {
                fallback.stream_count
            },
            pending_per_stream: if self.pending_per_stream >= 1 {
                self.pending_per_stream
            } else {
                fallback.pending_per_stream
            },
            chunk_size: if self.chunk_size > 0 {
                self.chunk_size
            } else {
                fallback.chunk_size
            },
            upload_delay_ms: self.upload_delay_ms,
        }
    }

    /// Upload inter-chunk delay as a `Duration`
    pub fn upload_delay(&self) -> Duration {
        Duration::from_millis(self.upload_delay_ms)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // --- Phase ordering ---

    #[test]
    fn phase_next_walks_the_full_timeline_in_order() {
        let expected = [
            Phase::Baseline,
            Phase::DlWarmup,
            Phase::Dl,
            Phase::UlWarmup,
            Phase::Ul,
            Phase::Bidi,
            Phase::Complete,
        ];

        let mut phase = Phase::Idle;
        for want in expected {
            phase = phase.next().unwrap();
            assert_eq!(phase, want, "timeline must advance to {want:?}");
        }
        assert_eq!(phase.next(), None, "Complete is terminal");
    }

    #[test]
    fn phase_ordering_matches_timeline_order() {
        assert!(Phase::Baseline < Phase::DlWarmup);
        assert!(Phase::DlWarmup < Phase::Dl);
        assert!(Phase::Dl < Phase::UlWarmup);
        assert!(Phase::UlWarmup < Phase::Ul);
        assert!(Phase::Ul < Phase::Bidi);
        assert!(Phase::Bidi < Phase::Complete);
    }

    #[test]
    fn phase_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Phase::DlWarmup).unwrap(),
            "\"dl-warmup\""
        );
        assert_eq!(serde_json::to_string(&Phase::Bidi).unwrap(), "\"bidi\"");
    }

    #[test]
    fn phase_display_matches_human_phase_strings() {
        assert_eq!(Phase::UlWarmup.to_string(), "ul-warmup");
        assert_eq!(Phase::Complete.to_string(), "complete");
    }

    // --- UserId ---

    #[test]
    fn user_id_round_trips_through_str_for_all_users() {
        for user in UserId::ALL {
            let parsed = UserId::from_str(user.as_str()).unwrap();
            assert_eq!(parsed, user);
        }
    }

    #[test]
    fn user_id_rejects_unknown_names() {
        assert!(UserId::from_str("mallory").is_err());
        assert!(UserId::from_str("").is_err());
        assert!(
            UserId::from_str("Alex").is_err(),
            "ids are lowercase on the wire; case variants must not parse"
        );
    }

    // --- Event wire format ---

    #[test]
    fn event_type_tags_match_the_published_vocabulary() {
        let cases: Vec<(Event, &str)> = vec![
            (
                Event::TestStart {
                    mode: "single-user".into(),
                    test_id: TestId(1),
                },
                "test-start",
            ),
            (
                Event::PhaseChanged {
                    phase: Phase::Baseline,
                },
                "phase-changed",
            ),
            (Event::AllTerminated, "stream:all_terminated"),
            (Event::EmergencyCleanup, "stream:emergency_cleanup"),
            (
                Event::StreamLifecycle {
                    kind: LifecycleKind::Created,
                    stream_id: StreamId(7),
                    stream_type: Direction::Download,
                },
                "stream:lifecycle",
            ),
            (
                Event::Error {
                    message: "boom".into(),
                },
                "error",
            ),
        ];

        for (event, expected_tag) in cases {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(
                value["type"], expected_tag,
                "event {event:?} must publish type tag {expected_tag}"
            );
        }
    }

    #[test]
    fn traffic_update_serializes_camel_case_keys() {
        let update = TrafficUpdate {
            user_id: Some(UserId::Jake),
            throughput: 1_000_000.0,
            download_throughput: 900_000.0,
            upload_throughput: 100_000.0,
            status: ActivityStatus::Active,
            packets: 42,
            bytes: 12_345,
            latency: Some(18.5),
            jitter: Some(2.1),
        };

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["userId"], "jake");
        assert_eq!(value["downloadThroughput"], 900_000.0);
        assert_eq!(value["uploadThroughput"], 100_000.0);
        assert_eq!(value["status"], "active");
    }

    #[test]
    fn traffic_update_omits_absent_optionals() {
        let update = TrafficUpdate {
            user_id: None,
            throughput: 0.0,
            download_throughput: 0.0,
            upload_throughput: 0.0,
            status: ActivityStatus::Idle,
            packets: 0,
            bytes: 0,
            latency: None,
            jitter: None,
        };

        let value = serde_json::to_value(&update).unwrap();
        assert!(value.get("userId").is_none(), "userId must be omitted");
        assert!(value.get("latency").is_none(), "latency must be omitted");
        assert!(value.get("jitter").is_none(), "jitter must be omitted");
    }

    #[test]
    fn event_round_trips_through_json() {
        let original = Event::LatencyMeasurement(LatencyMeasurement {
            user_id: UserId::Alex,
            latency: 41.5,
            jitter: 1.2,
            bufferbloat_severity: Some("moderate".into()),
            timestamp: Utc::now(),
        });

        let json = serde_json::to_string(&original).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back {
            Event::LatencyMeasurement(m) => {
                assert_eq!(m.user_id, UserId::Alex);
                assert!((m.latency - 41.5).abs() < f64::EPSILON);
            }
            other => panic!("expected LatencyMeasurement, got {other:?}"),
        }
    }

    // --- OptimalParameters ---

    #[test]
    fn fallback_parameters_match_documented_values() {
        let p = OptimalParameters::fallback();
        assert_eq!(p.stream_count, 2);
        assert_eq!(p.pending_per_stream, 2);
        assert_eq!(p.chunk_size, 256 * 1024);
        assert_eq!(p.upload_delay_ms, 0);
    }

    #[test]
    fn sanitized_substitutes_fallback_for_degenerate_fields_only() {
        let p = OptimalParameters {
            stream_count: 0,
            pending_per_stream: 4,
            chunk_size: 0,
            upload_delay_ms: 5,
        }
        .sanitized();

        assert_eq!(p.stream_count, 2, "zero streams must fall back");
        assert_eq!(p.pending_per_stream, 4, "valid field must be preserved");
        assert_eq!(p.chunk_size, 256 * 1024, "zero chunk must fall back");
        assert_eq!(p.upload_delay_ms, 5, "delay is preserved as-is");
    }

    #[test]
    fn sanitized_preserves_valid_parameters() {
        let p = OptimalParameters {
            stream_count: 6,
            pending_per_stream: 3,
            chunk_size: 64 * 1024,
            upload_delay_ms: 0,
        };
        assert_eq!(p.sanitized(), p);
    }

    // --- StreamId / TestId ---

    #[test]
    fn stream_id_conversions_preserve_value() {
        let id = StreamId::from(99_u64);
        let raw: u64 = id.into();
        assert_eq!(raw, 99);
        assert_eq!(id.to_string(), "99");
    }

    #[test]
    fn test_id_now_is_plausible_epoch_seconds() {
        let id = TestId::now();
        // 2020-01-01 in epoch seconds; anything after is plausible
        assert!(id.get() > 1_577_836_800, "TestId should be epoch seconds");
    }
}
