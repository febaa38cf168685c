//! Deterministic payload source for saturation traffic
//!
//! Sustaining gigabit uploads means producing tens to hundreds of MiB/s of
//! payload. Allocation and RNG on the hot path would dominate CPU, so common
//! sizes come from a fixed pool of pre-filled pseudo-random buffers and a
//! fast xoshiro-family generator fills everything else.

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pool bucket sizes, ascending. Sizes above the largest bucket are
/// allocated directly.
const BUCKET_SIZES: [usize; 4] = [4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024];

/// Pre-filled buffers held per bucket. Consecutive acquires rotate through
/// the slots so back-to-back payloads differ on the wire.
const SLOTS_PER_BUCKET: usize = 8;

/// Shared source of opaque pseudo-random payload buffers
///
/// `acquire(size)` returns exactly `size` bytes whose content varies across
/// calls -- enough variance that compressing or deduplicating middleboxes
/// cannot elide the traffic. Returned buffers are immutable ([`Bytes`]) and
/// need no explicit release; pooling is internal and safe for concurrent use.
#[derive(Clone)]
pub struct PayloadSource {
    inner: Arc<PayloadInner>,
}

struct PayloadInner {
    buckets: Vec<Bucket>,
    /// Generator for sizes above the largest bucket. Large allocations are
    /// rare (steady state uses pooled sizes), so a mutex is fine here.
    rng: Mutex<SmallRng>,
}

struct Bucket {
    size: usize,
    slots: Vec<Bytes>,
    cursor: AtomicUsize,
}

impl PayloadSource {
    /// Create the source and preallocate every pool bucket
    pub fn new() -> Self {
        let mut rng = SmallRng::from_entropy();

        let buckets = BUCKET_SIZES
            .iter()
            .map(|&size| {
                let slots = (0..SLOTS_PER_BUCKET)
                    .map(|_| {
                        let mut buf = vec![0u8; size];
                        rng.fill_bytes(&mut buf);
                        Bytes::from(buf)
                    })
                    .collect();
                Bucket {
                    size,
                    slots,
                    cursor: AtomicUsize::new(0),
                }
            })
            .collect();

        Self {
            inner: Arc::new(PayloadInner {
                buckets,
                rng: Mutex::new(rng),
            }),
        }
    }

    /// Return a buffer of exactly `size` bytes
    ///
    /// Sizes up to the largest bucket are served from the pool with no
    /// allocation; larger sizes are filled fresh.
    pub fn acquire(&self, size: usize) -> Bytes {
        if size == 0 {
            return Bytes::new();
        }

        if let Some(bucket) = self.inner.buckets.iter().find(|b| b.size >= size) {
            let slot = bucket.cursor.fetch_add(1, Ordering::Relaxed) % bucket.slots.len();
            return bucket.slots[slot].slice(..size);
        }

        let mut buf = vec![0u8; size];
        match self.inner.rng.lock() {
            Ok(mut rng) => rng.fill_bytes(&mut buf),
            // A poisoned lock only means another thread panicked mid-fill;
            // fall back to a throwaway generator rather than propagate.
            Err(_) => SmallRng::from_entropy().fill_bytes(&mut buf),
        }
        Bytes::from(buf)
    }

    /// Largest size served from the pool
    pub fn max_pooled_size(&self) -> usize {
        BUCKET_SIZES[BUCKET_SIZES.len() - 1]
    }
}

impl Default for PayloadSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSource")
            .field("buckets", &BUCKET_SIZES)
            .field("slots_per_bucket", &SLOTS_PER_BUCKET)
            .finish()
    }
}
