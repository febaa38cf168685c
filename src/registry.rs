//! Stream registry -- single point of lifecycle truth for all live streams
//!
//! Every upload/download stream is registered here with a process-unique id
//! and owns a cancellation token wired into its transport operations.
//! Termination is idempotent, bounded by timeouts, and escalates to an
//! emergency force-close when the graceful window expires.

use crate::types::{Direction, Event, LifecycleKind, StreamId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live stream counts per direction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamCounts {
    /// Live download streams
    pub download: usize,
    /// Live upload streams
    pub upload: usize,
    /// All live streams
    pub total: usize,
}

/// Byte accounting cell shared between a stream task and the registry
///
/// Once `active` flips false no further bytes are accepted: a terminated
/// stream can never mutate its counters again.
#[derive(Debug, Default)]
struct StreamCounter {
    active: AtomicBool,
    bytes: AtomicU64,
}

/// Handle held by the task driving one stream
///
/// Carries the stream's identity, its cancellation token, its byte counter,
/// and (for upload streams) the in-flight POST count.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    /// The registry-assigned id
    pub id: StreamId,
    /// The stream's direction
    pub direction: Direction,
    counter: Arc<StreamCounter>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl StreamHandle {
    /// Count transferred bytes. Returns false (and counts nothing) once the
    /// stream has been terminated.
    pub fn add_bytes(&self, bytes: u64) -> bool {
        if !self.counter.active.load(Ordering::Acquire) {
            return false;
        }
        self.counter.bytes.fetch_add(bytes, Ordering::Relaxed);
        true
    }

    /// Bytes transferred so far
    pub fn bytes(&self) -> u64 {
        self.counter.bytes.load(Ordering::Relaxed)
    }

    /// True until the stream is terminated
    pub fn is_active(&self) -> bool {
        self.counter.active.load(Ordering::Acquire)
    }

    /// The token cancelled when the stream is terminated
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// In-flight request count (meaningful for upload streams)
    pub fn pending(&self) -> &Arc<AtomicUsize> {
        &self.pending
    }
}

struct StreamEntry {
    direction: Direction,
    created_at: Instant,
    counter: Arc<StreamCounter>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

struct RegistryInner {
    next_id: AtomicU64,
    streams: tokio::sync::Mutex<HashMap<StreamId, StreamEntry>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    terminate_timeout: Duration,
    terminate_all_timeout: Duration,
}

/// Registry of every live stream (cloneable -- state is Arc-wrapped)
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    /// Create a registry publishing lifecycle events on `event_tx`
    pub fn new(
        event_tx: tokio::sync::broadcast::Sender<Event>,
        terminate_timeout: Duration,
        terminate_all_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                streams: tokio::sync::Mutex::new(HashMap::new()),
                event_tx,
                terminate_timeout,
                terminate_all_timeout,
            }),
        }
    }

    /// Register a new stream and return its handle
    ///
    /// Assigns a process-unique id (never reused), stamps the creation time,
    /// marks the stream active, and publishes a `created` lifecycle event.
    pub async fn register(&self, direction: Direction) -> StreamHandle {
        let id = StreamId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let counter = Arc::new(StreamCounter {
            active: AtomicBool::new(true),
            bytes: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));

        let entry = StreamEntry {
            direction,
            created_at: Instant::now(),
            counter: counter.clone(),
            cancel: cancel.clone(),
            reader: None,
        };

        self.inner.streams.lock().await.insert(id, entry);
        self.publish(Event::StreamLifecycle {
            kind: LifecycleKind::Created,
            stream_id: id,
            stream_type: direction,
        });

        tracing::debug!(stream_id = id.0, direction = %direction, "stream registered");

        StreamHandle {
            id,
            direction,
            counter,
            cancel,
            pending,
        }
    }

    /// Attach the task join handle so termination can await (and if needed
    /// abort) the stream's reader
    pub async fn attach_reader(&self, id: StreamId, reader: JoinHandle<()>) {
        let mut streams = self.inner.streams.lock().await;
        if let Some(entry) = streams.get_mut(&id) {
            entry.reader = Some(reader);
        } else {
            // Terminated before the task handle arrived -- tear it down now
            reader.abort();
        }
    }

    /// Terminate one stream. Idempotent: a second call for the same id is a
    /// no-op and publishes nothing.
    ///
    /// Marks the stream inactive, cancels its token, awaits its reader up to
    /// the graceful window, forces an abort on timeout, and publishes
    /// `terminated` exactly once.
    pub async fn terminate(&self, id: StreamId) {
        let entry = { self.inner.streams.lock().await.remove(&id) };
        let Some(entry) = entry else {
            return;
        };

        self.terminate_entry(id, entry).await;
    }

    async fn terminate_entry(&self, id: StreamId, entry: StreamEntry) {
        entry.counter.active.store(false, Ordering::Release);
        entry.cancel.cancel();

        if let Some(mut reader) = entry.reader {
            let graceful =
                tokio::time::timeout(self.inner.terminate_timeout, &mut reader).await;
            match graceful {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        stream_id = id.0,
                        timeout_ms = self.inner.terminate_timeout.as_millis(),
                        "stream did not stop within graceful window, forcing close"
                    );
                    reader.abort();
                }
            }
        }

        self.publish(Event::StreamLifecycle {
            kind: LifecycleKind::Terminated,
            stream_id: id,
            stream_type: entry.direction,
        });

        tracing::debug!(
            stream_id = id.0,
            lifetime_ms = entry.created_at.elapsed().as_millis(),
            "stream terminated"
        );
    }

    /// Terminate every live stream
    ///
    /// The collective window is the only graceful budget here: readers are
    /// cancelled together and awaited against the shared deadline, NOT given
    /// the per-stream force-close each would get from [`terminate`](Self::terminate)
    /// (which would quietly heal every hang before the collective window
    /// could ever expire). Streams still stuck at the deadline go through
    /// [`emergency_cleanup`](Self::emergency_cleanup). `all_terminated` is
    /// published after every individual `terminated`.
    pub async fn terminate_all(&self) {
        let deadline = tokio::time::Instant::now() + self.inner.terminate_all_timeout;
        let drained: Vec<(StreamId, StreamEntry)> = {
            let mut streams = self.inner.streams.lock().await;
            streams.drain().collect()
        };

        // Stop all byte counting and fire every token before waiting on
        // anyone, so cooperative streams wind down in parallel
        for (_, entry) in &drained {
            entry.counter.active.store(false, Ordering::Release);
            entry.cancel.cancel();
        }

        let waits = drained.into_iter().map(|(id, mut entry)| async move {
            let graceful = match entry.reader.take() {
                None => true,
                Some(mut reader) => {
                    match tokio::time::timeout_at(deadline, &mut reader).await {
                        Ok(_) => true,
                        Err(_) => {
                            // Hand the still-running reader back so the
                            // emergency path can abort it
                            entry.reader = Some(reader);
                            false
                        }
                    }
                }
            };
            (id, entry, graceful)
        });

        let mut expired = false;
        for (id, entry, graceful) in futures::future::join_all(waits).await {
            if graceful {
                self.publish(Event::StreamLifecycle {
                    kind: LifecycleKind::Terminated,
                    stream_id: id,
                    stream_type: entry.direction,
                });
            } else {
                expired = true;
                self.inner.streams.lock().await.insert(id, entry);
            }
        }

        if expired {
            tracing::warn!(
                timeout_ms = self.inner.terminate_all_timeout.as_millis(),
                "collective termination window expired, running emergency cleanup"
            );
            self.emergency_cleanup().await;
        }

        self.publish(Event::AllTerminated);
    }

    /// Force every remaining stream closed without waiting
    ///
    /// Marks all state inactive, aborts readers best-effort, clears the
    /// registry, and publishes `terminated` markers plus `emergency_cleanup`.
    pub async fn emergency_cleanup(&self) {
        let drained: Vec<(StreamId, StreamEntry)> = {
            let mut streams = self.inner.streams.lock().await;
            streams.drain().collect()
        };

        for (id, entry) in drained {
            entry.counter.active.store(false, Ordering::Release);
            entry.cancel.cancel();
            if let Some(reader) = entry.reader {
                reader.abort();
            }
            self.publish(Event::StreamLifecycle {
                kind: LifecycleKind::Terminated,
                stream_id: id,
                stream_type: entry.direction,
            });
        }

        self.publish(Event::EmergencyCleanup);
        tracing::warn!("emergency cleanup complete, registry cleared");
    }

    /// Current live counts per direction
    pub async fn counts(&self) -> StreamCounts {
        let streams = self.inner.streams.lock().await;
        let mut counts = StreamCounts::default();
        for entry in streams.values() {
            match entry.direction {
                Direction::Download => counts.download += 1,
                Direction::Upload => counts.upload += 1,
            }
            counts.total += 1;
        }
        counts
    }

    fn publish(&self, event: Event) {
        // send() fails only when nobody subscribes, which is fine
        self.inner.event_tx.send(event).ok();
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry").finish_non_exhaustive()
    }
}
