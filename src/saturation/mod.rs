//! Saturation drivers -- keep N concurrent streams pushing or pulling as
//! fast as the link sustains until the phase ends.
//!
//! Split into focused submodules:
//! - [`download`] - long-lived GET streams with byte counting and replacement
//! - [`upload`] - per-stream payload FIFOs with K in-flight POSTs
//! - [`warmup`] - parameter discovery feeding the optimal-parameter store

pub(crate) mod download;
pub(crate) mod upload;
pub(crate) mod warmup;

pub use warmup::ChunkRamp;

use crate::config::Config;
use crate::metrics::TrafficTotals;
use crate::payload::PayloadSource;
use crate::registry::StreamRegistry;
use crate::types::{Direction, OptimalParameters};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Minimum phase runway required before opening a replacement stream
pub(crate) const REPLACEMENT_RUNWAY: Duration = Duration::from_secs(2);

/// Stagger between starting download and upload halves of bidi
pub(crate) const BIDI_STAGGER: Duration = Duration::from_millis(200);

/// How one stream's work ended
///
/// `Cancelled` is first-class and distinct from `Errored`: phase-end aborts
/// flow through here and must never be treated as failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    /// Remote closed or the work ran to its deadline (normal end)
    Completed,
    /// Aborted by a cancellation token (phase end or stop)
    Cancelled,
    /// A transport error exhausted its retries
    Errored,
}

/// Shared dependencies of the saturation drivers
#[derive(Clone)]
pub(crate) struct SaturationContext {
    /// HTTP client with keep-alive connection reuse
    pub http: reqwest::Client,
    /// Payload source for upload bodies
    pub payload: PayloadSource,
    /// Stream registry owning lifecycles
    pub registry: StreamRegistry,
    /// Shared byte totals observed by the accountants
    pub totals: Arc<TrafficTotals>,
    /// Engine configuration
    pub config: Arc<Config>,
}

/// Process-wide optimal parameter records, one per direction
///
/// Warmup is the only writer and writes each record exactly once per run;
/// saturation phases and bidi read them immutably thereafter.
#[derive(Debug, Default)]
pub struct OptimalParamsStore {
    download: OnceLock<OptimalParameters>,
    upload: OnceLock<OptimalParameters>,
}

impl OptimalParamsStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the warmup result for a direction
    ///
    /// Returns false (and changes nothing) if the direction was already set:
    /// the first write wins for the whole run.
    pub fn set(&self, direction: Direction, params: OptimalParameters) -> bool {
        let cell = match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        };
        cell.set(params.sanitized()).is_ok()
    }

    /// The recorded parameters for a direction, if warmup has run
    pub fn get(&self, direction: Direction) -> Option<OptimalParameters> {
        match direction {
            Direction::Download => self.download.get().copied(),
            Direction::Upload => self.upload.get().copied(),
        }
    }

    /// The recorded parameters, or the documented fallback
    pub fn get_or_fallback(&self, direction: Direction) -> OptimalParameters {
        self.get(direction).unwrap_or_else(|| {
            tracing::warn!(direction = %direction, "no warmup result recorded, using fallback parameters");
            OptimalParameters::fallback()
        })
    }

    /// The converged upload chunk size, if upload warmup has run
    pub fn optimal_chunk_size(&self) -> Option<usize> {
        self.upload.get().map(|p| p.chunk_size)
    }
}

/// Start bidirectional saturation: download first with its recorded
/// parameters, a 200 ms stagger, then upload with its recorded parameters.
///
/// Both halves run with the exact single-direction parameter records --
/// bidi's challenge is the link, not retuning.
pub(crate) async fn start_bidirectional(
    ctx: &SaturationContext,
    dl_params: OptimalParameters,
    ul_params: OptimalParameters,
    deadline: Instant,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = download::start_download_saturation(
        ctx.clone(),
        download::DownloadOptions {
            stream_count: dl_params.stream_count,
            chunk_delay: ctx.config.single_user.chunk_delay,
            deadline,
        },
        cancel.clone(),
    );

    tokio::select! {
        _ = tokio::time::sleep(BIDI_STAGGER) => {}
        _ = cancel.cancelled() => return handles,
    }

    handles.extend(upload::start_upload_saturation(
        ctx.clone(),
        upload::UploadOptions {
            stream_count: ul_params.stream_count,
            pending_per_stream: ul_params.pending_per_stream,
            chunk_size: ul_params.chunk_size,
            upload_delay: ul_params.upload_delay(),
            warmup: false,
            ramp: None,
            deadline,
        },
        cancel,
    ));

    handles
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_store_is_write_once_per_direction() {
        let store = OptimalParamsStore::new();
        let first = OptimalParameters {
            stream_count: 4,
            pending_per_stream: 2,
            chunk_size: 64 * 1024,
            upload_delay_ms: 0,
        };
        let second = OptimalParameters {
            stream_count: 8,
            pending_per_stream: 8,
            chunk_size: 4 * 1024,
            upload_delay_ms: 10,
        };

        assert!(store.set(Direction::Download, first));
        assert!(
            !store.set(Direction::Download, second),
            "second write for the same direction must be rejected"
        );
        assert_eq!(
            store.get(Direction::Download).unwrap().stream_count,
            4,
            "the first write must win"
        );
    }

    #[test]
    fn directions_are_independent_records() {
        let store = OptimalParamsStore::new();
        let dl = OptimalParameters {
            stream_count: 6,
            pending_per_stream: 1,
            chunk_size: 256 * 1024,
            upload_delay_ms: 0,
        };
        let ul = OptimalParameters {
            stream_count: 3,
            pending_per_stream: 4,
            chunk_size: 32 * 1024,
            upload_delay_ms: 0,
        };

        assert!(store.set(Direction::Download, dl));
        assert!(store.set(Direction::Upload, ul));

        assert_eq!(store.get(Direction::Download).unwrap().stream_count, 6);
        assert_eq!(store.get(Direction::Upload).unwrap().stream_count, 3);
        assert_eq!(store.optimal_chunk_size(), Some(32 * 1024));
    }

    #[test]
    fn unset_direction_falls_back_to_documented_defaults() {
        let store = OptimalParamsStore::new();
        let params = store.get_or_fallback(Direction::Upload);
        assert_eq!(params, OptimalParameters::fallback());
        assert!(store.get(Direction::Upload).is_none(), "fallback is not a write");
    }

    #[test]
    fn degenerate_warmup_results_are_sanitized_on_write() {
        let store = OptimalParamsStore::new();
        store.set(
            Direction::Upload,
            OptimalParameters {
                stream_count: 0,
                pending_per_stream: 0,
                chunk_size: 0,
                upload_delay_ms: 0,
            },
        );
        assert_eq!(
            store.get(Direction::Upload).unwrap(),
            OptimalParameters::fallback(),
            "a fully degenerate record must sanitize to the fallback"
        );
    }
}
