//! Download saturation -- N long-lived GET streams consumed as fast as the
//! link delivers.
//!
//! Each stream opens a single unbounded GET against the server's download
//! endpoint and counts every chunk it consumes. A server close is a normal
//! end-of-stream, not an error; the supervisor opens a replacement as long
//! as the phase has runway. Optional pacing (`chunk_delay`) exists for rare
//! cases and defaults off.

use super::{REPLACEMENT_RUNWAY, SaturationContext, StreamOutcome};
use crate::registry::StreamHandle;
use futures::StreamExt;
use reqwest::header::CACHE_CONTROL;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Pause between a stream error and its replacement, keeping a flapping
/// endpoint from turning the supervisor into a busy loop
const REPLACEMENT_BACKOFF: Duration = Duration::from_millis(200);

/// Options for one download saturation phase
#[derive(Clone, Debug)]
pub(crate) struct DownloadOptions {
    /// Concurrent streams to maintain
    pub stream_count: usize,
    /// Optional pacing delay between chunk reads (default off)
    pub chunk_delay: Option<Duration>,
    /// Phase end; no stream is opened past this point
    pub deadline: Instant,
}

/// Start download saturation, returning one supervisor task per stream.
///
/// Supervisors keep their slot filled until the phase ends: a stream that
/// errors or reaches end-of-stream is replaced while at least
/// [`REPLACEMENT_RUNWAY`] remains before the deadline.
pub(crate) fn start_download_saturation(
    ctx: SaturationContext,
    opts: DownloadOptions,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..opts.stream_count)
        .map(|slot| {
            let ctx = ctx.clone();
            let opts = opts.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                supervise_slot(ctx, opts, cancel, slot).await;
            })
        })
        .collect()
}

/// Keep one download slot saturated until the phase ends.
async fn supervise_slot(
    ctx: SaturationContext,
    opts: DownloadOptions,
    cancel: CancellationToken,
    slot: usize,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now + REPLACEMENT_RUNWAY > opts.deadline {
            return;
        }

        let handle = ctx.registry.register(crate::types::Direction::Download).await;
        let id = handle.id;

        // The stream body runs as the registry's reader task so terminate()
        // can await (or abort) it; the supervisor observes the outcome
        // through a oneshot.
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let body_ctx = ctx.clone();
        let body_opts = opts.clone();
        let reader = tokio::spawn(async move {
            let outcome = run_download_stream(&body_ctx, &handle, &body_opts).await;
            done_tx.send(outcome).ok();
        });
        ctx.registry.attach_reader(id, reader).await;

        let outcome = done_rx.await.unwrap_or(StreamOutcome::Cancelled);
        ctx.registry.terminate(id).await;

        match outcome {
            StreamOutcome::Cancelled => return,
            StreamOutcome::Completed => {
                // Server closed early: normal end-of-stream, replace silently
                tracing::debug!(stream_id = id.0, slot, "download stream reached end-of-stream");
            }
            StreamOutcome::Errored => {
                if Instant::now() + REPLACEMENT_RUNWAY > opts.deadline {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(REPLACEMENT_BACKOFF) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

/// Consume one long-lived GET, counting bytes at the reader.
async fn run_download_stream(
    ctx: &SaturationContext,
    handle: &StreamHandle,
    opts: &DownloadOptions,
) -> StreamOutcome {
    let cancel = handle.cancel_token().clone();

    let url = match ctx.config.endpoints.download_url() {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, "cannot build download URL");
            return StreamOutcome::Errored;
        }
    };

    let request = ctx
        .http
        .get(url)
        .header(CACHE_CONTROL, "no-store")
        .header("x-stream-id", handle.id.to_string())
        .header("x-speed-test", "true");

    let response = tokio::select! {
        result = request.send() => result,
        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(stream_id = handle.id.0, error = %e, "download GET failed");
            return StreamOutcome::Errored;
        }
    };

    if !response.status().is_success() {
        tracing::warn!(
            stream_id = handle.id.0,
            status = response.status().as_u16(),
            "download GET returned unexpected status"
        );
        return StreamOutcome::Errored;
    }

    let mut body = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if !handle.add_bytes(bytes.len() as u64) {
                    // Stream was terminated under us; stop without logging
                    return StreamOutcome::Cancelled;
                }
                ctx.totals.record_download(bytes.len() as u64);

                if let Some(delay) = opts.chunk_delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                    }
                }
            }
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return StreamOutcome::Cancelled;
                }
                tracing::warn!(stream_id = handle.id.0, error = %e, "download read failed");
                return StreamOutcome::Errored;
            }
            // Remote closed the body: normal end-of-stream
            None => return StreamOutcome::Completed,
        }
    }
}
