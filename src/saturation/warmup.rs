//! Warmup parameter discovery
//!
//! Warmup runs a small grid of (stream-count, pending-per-stream)
//! configurations, each for a short window, scoring the 80th-percentile
//! sliding throughput sampled at 250 ms. The winner populates the
//! optimal-parameter record for its direction. Upload warmup additionally
//! walks a logarithmic chunk ramp from 4 KiB to 128 KiB to converge a
//! sustainable POST size without head-of-line stalls on narrow uplinks.

use super::{SaturationContext, download, upload};
use crate::metrics::percentile;
use crate::types::OptimalParameters;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Chunk-ramp steps walked during upload warmup
pub(crate) const WARMUP_RAMP_STEPS: usize = 50;

/// Smallest ramp chunk
const RAMP_MIN_CHUNK: usize = 4 * 1024;

/// Largest ramp chunk
const RAMP_MAX_CHUNK: usize = 128 * 1024;

/// A POST slower than this marks its chunk size as not sustainable
const SUSTAINABLE_POST_DURATION: Duration = Duration::from_secs(1);

/// Throughput sampling cadence within a grid cell
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// How long each grid cell runs
const CELL_DURATION: Duration = Duration::from_millis(1500);

/// Time reserved at the end of the warmup window for teardown
const TEARDOWN_MARGIN: Duration = Duration::from_millis(500);

/// A later cell scoring below this fraction of the best seen is a
/// regression; scanning stops there
const REGRESSION_FRACTION: f64 = 0.85;

/// Stream-count grid for download warmup
const DOWNLOAD_GRID: [usize; 3] = [2, 3, 4];

/// (stream-count, pending-per-stream) grid for upload warmup
const UPLOAD_GRID: [(usize, usize); 4] = [(2, 2), (2, 4), (3, 2), (3, 4)];

/// Chunk size at a given ramp step: logarithmic from 4 KiB to 128 KiB
pub(crate) fn ramp_chunk_size(index: usize) -> usize {
    let last = WARMUP_RAMP_STEPS - 1;
    let i = index.min(last);
    let ratio = RAMP_MAX_CHUNK as f64 / RAMP_MIN_CHUNK as f64;
    let exponent = i as f64 / last as f64;
    (RAMP_MIN_CHUNK as f64 * ratio.powf(exponent)).round() as usize
}

/// Observations of how long POSTs of each chunk size took
///
/// Shared between the warmup upload streams (writers) and the warmup driver
/// (reader). The converged size is the largest one whose mean POST duration
/// stayed under the sustainability bound.
#[derive(Debug, Default)]
pub struct ChunkRamp {
    samples: Vec<(usize, Duration)>,
}

impl ChunkRamp {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed POST
    pub fn record(&mut self, size: usize, duration: Duration) {
        self.samples.push((size, duration));
    }

    /// The largest chunk size whose mean POST duration stayed sustainable,
    /// or `None` with no observations
    pub fn sustainable(&self) -> Option<usize> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sizes: Vec<usize> = self.samples.iter().map(|&(s, _)| s).collect();
        sizes.sort_unstable();
        sizes.dedup();

        let mut best = None;
        for size in sizes {
            let durations: Vec<Duration> = self
                .samples
                .iter()
                .filter(|&&(s, _)| s == size)
                .map(|&(_, d)| d)
                .collect();
            let mean = durations.iter().sum::<Duration>() / durations.len() as u32;
            if mean <= SUSTAINABLE_POST_DURATION {
                best = Some(size);
            }
        }

        // Everything stalled: the smallest size observed is the least bad
        best.or_else(|| self.samples.iter().map(|&(s, _)| s).min())
    }
}

/// Discover download parameters within the dl-warmup window.
///
/// Returns the documented fallback when every cell is degenerate.
pub(crate) async fn run_download_warmup(
    ctx: &SaturationContext,
    deadline: Instant,
    cancel: &CancellationToken,
) -> OptimalParameters {
    let mut best: Option<(f64, usize)> = None;

    for stream_count in DOWNLOAD_GRID {
        if cancel.is_cancelled()
            || Instant::now() + CELL_DURATION + TEARDOWN_MARGIN > deadline
        {
            break;
        }

        let cell_cancel = cancel.child_token();
        let handles = download::start_download_saturation(
            ctx.clone(),
            download::DownloadOptions {
                stream_count,
                chunk_delay: None,
                deadline,
            },
            cell_cancel.clone(),
        );

        let samples = sample_cell(ctx, CELL_DURATION, true).await;
        cell_cancel.cancel();
        for handle in handles {
            handle.await.ok();
        }

        let score = percentile(&samples, 0.8).filter(|s| *s > 0.0);
        tracing::debug!(stream_count, score = ?score, "download warmup cell finished");

        match score {
            None => continue,
            Some(score) => {
                if let Some((best_score, _)) = best {
                    if score < best_score * REGRESSION_FRACTION {
                        // Adding streams stopped helping; the search converged
                        break;
                    }
                    if score > best_score {
                        best = Some((score, stream_count));
                    }
                } else {
                    best = Some((score, stream_count));
                }
            }
        }
    }

    match best {
        Some((score, stream_count)) => {
            tracing::info!(stream_count, p80_bps = score, "download warmup converged");
            OptimalParameters {
                stream_count,
                pending_per_stream: 2,
                chunk_size: OptimalParameters::fallback().chunk_size,
                upload_delay_ms: 0,
            }
            .sanitized()
        }
        None => {
            tracing::warn!("download warmup produced no usable measurement, using fallback");
            OptimalParameters::fallback()
        }
    }
}

/// Discover upload parameters within the ul-warmup window.
pub(crate) async fn run_upload_warmup(
    ctx: &SaturationContext,
    deadline: Instant,
    cancel: &CancellationToken,
) -> OptimalParameters {
    let ramp = Arc::new(std::sync::Mutex::new(ChunkRamp::new()));
    let mut best: Option<(f64, (usize, usize))> = None;

    for (stream_count, pending_per_stream) in UPLOAD_GRID {
        if cancel.is_cancelled()
            || Instant::now() + CELL_DURATION + TEARDOWN_MARGIN > deadline
        {
            break;
        }

        let cell_cancel = cancel.child_token();
        let handles = upload::start_upload_saturation(
            ctx.clone(),
            upload::UploadOptions {
                stream_count,
                pending_per_stream,
                chunk_size: OptimalParameters::fallback().chunk_size,
                upload_delay: Duration::ZERO,
                warmup: true,
                ramp: Some(ramp.clone()),
                deadline,
            },
            cell_cancel.clone(),
        );

        let samples = sample_cell(ctx, CELL_DURATION, false).await;
        cell_cancel.cancel();
        for handle in handles {
            handle.await.ok();
        }

        let score = percentile(&samples, 0.8).filter(|s| *s > 0.0);
        tracing::debug!(
            stream_count,
            pending_per_stream,
            score = ?score,
            "upload warmup cell finished"
        );

        match score {
            None => continue,
            Some(score) => {
                if let Some((best_score, _)) = best {
                    if score < best_score * REGRESSION_FRACTION {
                        break;
                    }
                    if score > best_score {
                        best = Some((score, (stream_count, pending_per_stream)));
                    }
                } else {
                    best = Some((score, (stream_count, pending_per_stream)));
                }
            }
        }
    }

    let chunk_size = ramp
        .lock()
        .ok()
        .and_then(|r| r.sustainable())
        .unwrap_or_else(|| OptimalParameters::fallback().chunk_size);

    match best {
        Some((score, (stream_count, pending_per_stream))) => {
            tracing::info!(
                stream_count,
                pending_per_stream,
                chunk_size,
                p80_bps = score,
                "upload warmup converged"
            );
            OptimalParameters {
                stream_count,
                pending_per_stream,
                chunk_size,
                upload_delay_ms: 0,
            }
            .sanitized()
        }
        None => {
            tracing::warn!("upload warmup produced no usable measurement, using fallback");
            OptimalParameters::fallback()
        }
    }
}

/// Collect instantaneous throughput samples (bits per second) at 250 ms
/// cadence for one cell.
async fn sample_cell(ctx: &SaturationContext, duration: Duration, download: bool) -> Vec<f64> {
    let cell_end = Instant::now() + duration;
    let mut samples = Vec::new();
    let mut previous = if download {
        ctx.totals.download_bytes()
    } else {
        ctx.totals.upload_bytes()
    };

    while Instant::now() < cell_end {
        tokio::time::sleep(SAMPLE_INTERVAL).await;
        let current = if download {
            ctx.totals.download_bytes()
        } else {
            ctx.totals.upload_bytes()
        };
        let delta = current.saturating_sub(previous);
        previous = current;
        samples.push(delta as f64 * 8.0 / SAMPLE_INTERVAL.as_secs_f64());
    }

    samples
}
