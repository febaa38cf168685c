//! Upload saturation -- per-stream payload FIFOs drained by K concurrent
//! POSTs.
//!
//! Each stream pre-generates payload buffers into a FIFO and keeps up to K
//! POSTs in flight; every completion dequeues the next buffer. The FIFO is
//! replenished before it runs dry, and a stall watchdog force-feeds it when
//! the pipeline goes quiet. The in-flight cap is never exceeded, even while
//! a POST is retrying.

use super::warmup::{ChunkRamp, WARMUP_RAMP_STEPS, ramp_chunk_size};
use super::{REPLACEMENT_RUNWAY, SaturationContext, StreamOutcome};
use crate::error::{Error, TransportError};
use crate::registry::StreamHandle;
use crate::retry::retry_with_backoff;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::header::{ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

/// FIFO length below which a refill batch is enqueued
const REFILL_THRESHOLD: usize = 5;

/// Buffers per refill batch during steady state
const STEADY_REFILL_BATCH: usize = 10;

/// Buffers per refill batch during warmup (the ramp consumes them fast)
const WARMUP_REFILL_BATCH: usize = 25;

/// Quiet-pipeline threshold during warmup
const WARMUP_STALL_THRESHOLD: Duration = Duration::from_millis(300);

/// Quiet-pipeline threshold during steady state
const STEADY_STALL_THRESHOLD: Duration = Duration::from_millis(500);

/// Housekeeping cadence for stall and deadline checks
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(50);

/// Consecutive errors that, with a near-empty queue, end the stream
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// FIFO length considered "near empty" for the error policy
const NEAR_EMPTY_QUEUE: usize = 2;

/// Pause between a stream error and its replacement
const REPLACEMENT_BACKOFF: Duration = Duration::from_millis(200);

/// Options for one upload saturation phase
#[derive(Clone, Debug)]
pub(crate) struct UploadOptions {
    /// Concurrent streams to maintain
    pub stream_count: usize,
    /// In-flight POST cap per stream (K)
    pub pending_per_stream: usize,
    /// Payload bytes per POST during steady state
    pub chunk_size: usize,
    /// Optional delay between chunk launches (0 = none)
    pub upload_delay: Duration,
    /// Warmup mode: chunk sizes follow the logarithmic ramp
    pub warmup: bool,
    /// Ramp tracker collecting (size, duration) observations during warmup
    pub ramp: Option<Arc<std::sync::Mutex<ChunkRamp>>>,
    /// Phase end; no POST is launched past this point
    pub deadline: Instant,
}

/// Start upload saturation, returning one supervisor task per stream.
pub(crate) fn start_upload_saturation(
    ctx: SaturationContext,
    opts: UploadOptions,
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

async fn supervise_slot(
    ctx: SaturationContext,
    opts: UploadOptions,
    cancel: CancellationToken,
    slot: usize,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if Instant::now() + REPLACEMENT_RUNWAY > opts.deadline {
            return;
        }

        let handle = ctx.registry.register(crate::types::Direction::Upload).await;
        let id = handle.id;

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let body_ctx = ctx.clone();
        let body_opts = opts.clone();
        let reader = tokio::spawn(async move {
            let outcome = run_upload_stream(&body_ctx, &handle, &body_opts).await;
            done_tx.send(outcome).ok();
        });
        ctx.registry.attach_reader(id, reader).await;

        let outcome = done_rx.await.unwrap_or(StreamOutcome::Cancelled);
        ctx.registry.terminate(id).await;

        match outcome {
            StreamOutcome::Cancelled | StreamOutcome::Completed => return,
            StreamOutcome::Errored => {
                if Instant::now() + REPLACEMENT_RUNWAY > opts.deadline {
                    return;
                }
                tracing::debug!(slot, "replacing errored upload stream");
                tokio::select! {
                    _ = tokio::time::sleep(REPLACEMENT_BACKOFF) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

/// Drive one upload stream: FIFO, launch loop, completion handling, stall
/// watchdog.
async fn run_upload_stream(
    ctx: &SaturationContext,
    handle: &StreamHandle,
    opts: &UploadOptions,
) -> StreamOutcome {
    let cancel = handle.cancel_token().clone();

    let url = match ctx.config.endpoints.upload_url() {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, "cannot build upload URL");
            return StreamOutcome::Errored;
        }
    };

    let refill_batch = if opts.warmup {
        WARMUP_REFILL_BATCH
    } else {
        STEADY_REFILL_BATCH
    };
    let stall_threshold = if opts.warmup {
        WARMUP_STALL_THRESHOLD
    } else {
        STEADY_STALL_THRESHOLD
    };

    let mut fifo: VecDeque<Bytes> = VecDeque::new();
    let mut ramp_index: usize = 0;
    let mut consecutive_errors: u32 = 0;
    let mut last_activity = Instant::now();
    let mut inflight = FuturesUnordered::new();
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_TICK);
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    enqueue_batch(&mut fifo, ctx, opts, &mut ramp_index, refill_batch);

    loop {
        if fifo.len() < REFILL_THRESHOLD {
            enqueue_batch(&mut fifo, ctx, opts, &mut ramp_index, refill_batch);
        }

        // Launch up to K POSTs. Retry lives inside each future, so the cap
        // holds even while a chunk is on its second attempt.
        while inflight.len() < opts.pending_per_stream && Instant::now() < opts.deadline {
            let Some(buf) = fifo.pop_front() else { break };
            handle.pending().fetch_add(1, Ordering::Relaxed);
            inflight.push(send_chunk(
                ctx.clone(),
                url.clone(),
                buf,
                cancel.clone(),
            ));

            if !opts.upload_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(opts.upload_delay) => {}
                    _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,

            Some((result, size, elapsed)) = inflight.next(), if !inflight.is_empty() => {
                handle.pending().fetch_sub(1, Ordering::Relaxed);
                last_activity = Instant::now();

                match result {
                    Ok(()) => {
                        consecutive_errors = 0;
                        handle.add_bytes(size as u64);
                        ctx.totals.record_upload(size as u64);
                        if let Some(ramp) = &opts.ramp
                            && let Ok(mut ramp) = ramp.lock()
                        {
                            ramp.record(size, elapsed);
                        }
                    }
                    Err(e) if e.is_cancelled() => return StreamOutcome::Cancelled,
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            stream_id = handle.id.0,
                            error = %e,
                            consecutive = consecutive_errors,
                            "upload POST failed after retry"
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS
                            && fifo.len() <= NEAR_EMPTY_QUEUE
                        {
                            return StreamOutcome::Errored;
                        }
                    }
                }
            }

            _ = housekeeping.tick() => {
                let now = Instant::now();
                if now >= opts.deadline && inflight.is_empty() {
                    return StreamOutcome::Completed;
                }
                // Quiet pipeline: nothing in flight and nothing completing.
                // Force-feed the FIFO and reset the stall clock.
                if handle.pending().load(Ordering::Relaxed) == 0
                    && now.duration_since(last_activity) > stall_threshold
                {
                    tracing::debug!(stream_id = handle.id.0, "upload pipeline stalled, force-enqueueing");
                    enqueue_batch(&mut fifo, ctx, opts, &mut ramp_index, refill_batch);
                    last_activity = now;
                }
            }
        }
    }
}

/// Push one batch of payload buffers into the FIFO.
///
/// Steady state uses the phase's fixed chunk size; warmup walks the
/// logarithmic ramp and then settles on the largest size the link has
/// sustained so far.
fn enqueue_batch(
    fifo: &mut VecDeque<Bytes>,
    ctx: &SaturationContext,
    opts: &UploadOptions,
    ramp_index: &mut usize,
    batch: usize,
) {
    for _ in 0..batch {
        let size = if opts.warmup {
            if *ramp_index < WARMUP_RAMP_STEPS {
                let size = ramp_chunk_size(*ramp_index);
                *ramp_index += 1;
                size
            } else {
                opts.ramp
                    .as_ref()
                    .and_then(|ramp| ramp.lock().ok().and_then(|r| r.sustainable()))
                    .unwrap_or_else(|| ramp_chunk_size(WARMUP_RAMP_STEPS - 1))
            }
        } else {
            opts.chunk_size
        };
        fifo.push_back(ctx.payload.acquire(size));
    }
}

/// POST one chunk with the mandated headers, a 15 s deadline, and a single
/// 500 ms-backoff retry on timeout or non-2xx.
async fn send_chunk(
    ctx: SaturationContext,
    url: Url,
    buf: Bytes,
    cancel: CancellationToken,
) -> (Result<(), Error>, usize, Duration) {
    let size = buf.len();
    let start = Instant::now();
    let post_timeout = ctx.config.timeouts.post;

    let result = retry_with_backoff(&ctx.config.retry, || {
        let http = ctx.http.clone();
        let url = url.clone();
        let buf = buf.clone();
        let cancel = cancel.clone();
        async move {
            let request = http
                .post(url.clone())
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONNECTION, "keep-alive")
                .header(CACHE_CONTROL, "no-store")
                .header(ACCEPT_ENCODING, "identity")
                .body(buf);

            let response = tokio::select! {
                result = tokio::time::timeout(post_timeout, request.send()) => result,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            match response {
                Err(_) => Err(Error::timeout("upload POST", post_timeout)),
                Ok(Err(e)) => Err(Error::Transport(TransportError::Request(e))),
                Ok(Ok(resp)) if !resp.status().is_success() => {
                    Err(Error::bad_status(resp.status().as_u16(), url.path()))
                }
                Ok(Ok(_)) => Ok(()),
            }
        }
    })
    .await;

    (result, size, start.elapsed())
}
