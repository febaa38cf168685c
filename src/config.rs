//! Configuration types for bloatprobe

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Server endpoint layout
///
/// All paths are resolved against `base_url`. The household stop relay goes
/// through `isp_base_url` when set (central-server relay), falling back to
/// `base_url` otherwise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Measurement server base URL (default: "http://localhost:3000")
    #[serde(default = "default_base_url")]
    pub base_url: Url,

    /// Central ISP relay base URL for household session control (None = use base_url)
    #[serde(default)]
    pub isp_base_url: Option<Url>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            isp_base_url: None,
        }
    }
}

impl EndpointsConfig {
    /// Single-user download endpoint
    pub fn download_url(&self) -> Result<Url> {
        Ok(self.base_url.join("download")?)
    }

    /// Single-user upload endpoint
    pub fn upload_url(&self) -> Result<Url> {
        Ok(self.base_url.join("upload")?)
    }

    /// Latency grade threshold config endpoint
    pub fn thresholds_url(&self) -> Result<Url> {
        Ok(self.base_url.join("latencyGradeThresholds.json")?)
    }

    /// Household warmup bulk-download endpoint
    pub fn warmup_bulk_url(&self) -> Result<Url> {
        Ok(self.base_url.join("api/warmup/bulk-download")?)
    }

    /// Profile update endpoint for the adaptive computer user
    pub fn profile_update_url(&self, user_id: &str) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("ws/virtual-household/{user_id}/update-profile"))?)
    }

    /// Household WebSocket endpoint with query parameters
    pub fn user_ws_url(
        &self,
        user_id: &str,
        test_id: u64,
        dscp: &str,
        throughput_bps: u64,
    ) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("ws/virtual-household/{user_id}"))?;
        match url.scheme() {
            "http" => url
                .set_scheme("ws")
                .map_err(|()| Error::Other("cannot derive ws scheme".into()))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|()| Error::Other("cannot derive wss scheme".into()))?,
            _ => {}
        }
        url.query_pairs_mut()
            .append_pair("test_id", &test_id.to_string())
            .append_pair("dscp", dscp)
            .append_pair("throughput", &throughput_bps.to_string());
        Ok(url)
    }

    /// Central relay endpoint for stopping household user sessions
    ///
    /// `target` is a test id string or the literal `"all"`.
    pub fn stop_sessions_url(&self, target: &str) -> Result<Url> {
        let base = self.isp_base_url.as_ref().unwrap_or(&self.base_url);
        Ok(base.join(&format!("api/virtual-household/stop-user-sessions/{target}"))?)
    }
}

/// Operation deadlines
///
/// These are normative for the engine's teardown guarantees: terminate
/// escalation and emergency cleanup key off `terminate` and `terminate_all`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-POST deadline during upload saturation (default: 15 s)
    #[serde(default = "default_post_timeout")]
    pub post: Duration,

    /// Graceful window for terminating one stream (default: 3 s)
    #[serde(default = "default_terminate_timeout")]
    pub terminate: Duration,

    /// Outer window for terminating every stream (default: 5 s)
    #[serde(default = "default_terminate_all_timeout")]
    pub terminate_all: Duration,

    /// WebSocket open deadline (default: 5 s)
    #[serde(default = "default_ws_open_timeout")]
    pub ws_open: Duration,

    /// Household warmup bulk-download duration (default: 10 s)
    #[serde(default = "default_warmup_download")]
    pub warmup_download: Duration,

    /// Grace on top of the warmup download for connect and slow links (default: 5 s)
    #[serde(default = "default_warmup_grace")]
    pub warmup_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            post: default_post_timeout(),
            terminate: default_terminate_timeout(),
            terminate_all: default_terminate_all_timeout(),
            ws_open: default_ws_open_timeout(),
            warmup_download: default_warmup_download(),
            warmup_grace: default_warmup_grace(),
        }
    }
}

/// Retry behavior for transient transport failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial try (default: 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 500 ms)
    #[serde(default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay (default: 2 s)
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each attempt (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to each delay (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Single-user mode settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleUserConfig {
    /// Phase controller tick (default: 100 ms)
    #[serde(default = "default_phase_tick")]
    pub phase_tick: Duration,

    /// Throughput aggregation/publish cadence (default: 200 ms)
    #[serde(default = "default_aggregate_interval")]
    pub aggregate_interval: Duration,

    /// Smoothed-readout update cadence (default: 500 ms)
    #[serde(default = "default_ema_interval")]
    pub ema_interval: Duration,

    /// Optional pacing delay between download chunk reads (default: off)
    #[serde(default)]
    pub chunk_delay: Option<Duration>,
}

impl Default for SingleUserConfig {
    fn default() -> Self {
        Self {
            phase_tick: default_phase_tick(),
            aggregate_interval: default_aggregate_interval(),
            ema_interval: default_ema_interval(),
            chunk_delay: None,
        }
    }
}

/// Household mode settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HouseholdConfig {
    /// Duration of the concurrent-users simulation (default: 30 s)
    #[serde(default = "default_household_duration")]
    pub duration: Duration,

    /// Client-initiated ping cadence (default: 2 s)
    #[serde(default = "default_ping_interval")]
    pub ping_interval: Duration,

    /// Backoff before reconnecting a dropped socket (default: 1 s)
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: Duration,

    /// A worker silent for longer than this signals an error (default: 2 s)
    #[serde(default = "default_inactive_alarm")]
    pub inactive_alarm: Duration,

    /// Cadence of periodic `request_download` control frames (default: 1 s)
    #[serde(default = "default_download_request_interval")]
    pub download_request_interval: Duration,
}

impl Default for HouseholdConfig {
    fn default() -> Self {
        Self {
            duration: default_household_duration(),
            ping_interval: default_ping_interval(),
            reconnect_backoff: default_reconnect_backoff(),
            inactive_alarm: default_inactive_alarm(),
            download_request_interval: default_download_request_interval(),
        }
    }
}

/// Main configuration for the measurement engine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server endpoint layout
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    /// Operation deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Transient-failure retry behavior
    #[serde(default)]
    pub retry: RetryConfig,

    /// Single-user mode settings
    #[serde(default)]
    pub single_user: SingleUserConfig,

    /// Household mode settings
    #[serde(default)]
    pub household: HouseholdConfig,
}

/// One grade boundary within a threshold table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradeThreshold {
    /// Upper bound in milliseconds for this grade
    pub threshold: f64,
    /// Grade identifier (e.g., "a_plus")
    pub grade: String,
    /// CSS-style class tag consumed by the view layer
    pub class: String,
    /// Human-readable description
    pub description: String,
}

/// An ordered list of grade boundaries, best grade first
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    /// Boundaries in ascending threshold order
    pub thresholds: Vec<GradeThreshold>,
}

/// Latency grade thresholds fetched from the server, with hard fallbacks
///
/// The engine only ferries these to the grade layer; it applies none of them
/// itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradeThresholds {
    /// Grading of the unloaded (baseline) round-trip latency
    pub baseline: ThresholdTable,
    /// Grading of the latency increase under load
    pub increase: ThresholdTable,
}

impl GradeThresholds {
    /// Compiled-in fallback used when the fetch fails or the payload is
    /// malformed. These values are normative: they must match the defaults
    /// the server ships.
    pub fn fallback() -> Self {
        fn entry(threshold: f64, grade: &str, description: &str) -> GradeThreshold {
            GradeThreshold {
                threshold,
                grade: grade.to_string(),
                class: format!("grade-{}", grade.replace('_', "-")),
                description: description.to_string(),
            }
        }

        Self {
            baseline: ThresholdTable {
                thresholds: vec![
                    entry(20.0, "a_plus", "Excellent unloaded latency"),
                    entry(50.0, "a", "Very good unloaded latency"),
                    entry(100.0, "b", "Good unloaded latency"),
                    entry(200.0, "c", "Fair unloaded latency"),
                    entry(400.0, "d", "Poor unloaded latency"),
                    entry(f64::INFINITY, "f", "Very poor unloaded latency"),
                ],
            },
            increase: ThresholdTable {
                thresholds: vec![
                    entry(5.0, "a_plus", "No measurable bufferbloat"),
                    entry(30.0, "a", "Minimal bufferbloat"),
                    entry(60.0, "b", "Moderate bufferbloat"),
                    entry(200.0, "c", "Considerable bufferbloat"),
                    entry(400.0, "d", "Severe bufferbloat"),
                    entry(f64::INFINITY, "f", "Extreme bufferbloat"),
                ],
            },
        }
    }
}

// Static string, cannot fail to parse
#[allow(clippy::expect_used)]
fn default_base_url() -> Url {
    Url::parse("http://localhost:3000").expect("default base url is valid")
}

fn default_post_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_terminate_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_terminate_all_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ws_open_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_warmup_download() -> Duration {
    Duration::from_secs(10)
}

fn default_warmup_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_phase_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_aggregate_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_ema_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_household_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_inactive_alarm() -> Duration {
    Duration::from_secs(2)
}

fn default_download_request_interval() -> Duration {
    Duration::from_secs(1)
}
