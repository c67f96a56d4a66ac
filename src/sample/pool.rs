//! Sample factory / pool (C1, spec §4.1).
//!
//! Ported from the original `factory`/`sample` pair in `sample.h`: there, the freelist is
//! a hand-rolled MPSC stack over raw pointers with a sentinel node. Here the same role is
//! played by `crossbeam_queue::SegQueue`, a lock-free MPMC queue — the producer-only
//! requirement of the original still holds (only `Pool::allocate` pops), but consumers may
//! reclaim concurrently from any thread, which `SegQueue` supports natively. The payload
//! Rust already frees correctly on drop, so unlike the original there is no special-cased
//! string-channel destructor path on reclaim.

use super::{Payload, SampleRef};
use crate::format::ChannelFormat;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct PoolInner {
    format: ChannelFormat,
    channels: u32,
    freelist: SegQueue<Payload>,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl PoolInner {
    fn reclaim(&self, payload: Payload) {
        self.freelist.push(payload);
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// A pool-allocated sample record. Lives as long as any `SampleRef` (an `Arc<Sample>`)
/// referencing it, after which its payload is returned to the owning pool's freelist.
pub struct Sample {
    /// Capture timestamp, outlet local clock seconds. `DEDUCED_TIMESTAMP` means
    /// "predecessor + 1/rate".
    pub timestamp: f64,
    /// Whether this sample should be flushed through immediately rather than buffered.
    pub pushthrough: bool,
    format: ChannelFormat,
    channels: u32,
    payload: Option<Payload>,
    pool: Arc<PoolInner>,
}

impl Sample {
    pub fn format(&self) -> ChannelFormat {
        self.format
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn payload(&self) -> &Payload {
        self.payload.as_ref().expect("payload taken before drop")
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        self.payload.as_mut().expect("payload taken before drop")
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.pool.reclaim(payload);
        }
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.format == other.format
            && self.channels == other.channels
            && match (self.payload.as_ref(), other.payload.as_ref()) {
                (Some(Payload::Numeric(a)), Some(Payload::Numeric(b))) => a == b,
                (Some(Payload::Strings(a)), Some(Payload::Strings(b))) => a == b,
                _ => false,
            }
    }
}

/// Handle to a sample pool/factory, parameterized by `{format, channel_count, reserve_count}`.
/// Cheaply cloneable (shares the underlying freelist and counters).
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

impl Pool {
    pub fn new(format: ChannelFormat, channels: u32, reserve_count: u32) -> Self {
        let inner = Arc::new(PoolInner {
            format,
            channels,
            freelist: SegQueue::new(),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        });
        for _ in 0..reserve_count {
            inner.freelist.push(Self::blank_payload(format, channels));
        }
        Pool(inner)
    }

    fn blank_payload(format: ChannelFormat, channels: u32) -> Payload {
        if format == ChannelFormat::String {
            Payload::new_strings(channels)
        } else {
            Payload::new_numeric(format, channels)
        }
    }

    /// Allocate a zero-refcounted (by virtue of being a fresh `Arc`) sample. Never blocks:
    /// pops a recycled payload from the freelist, or builds a fresh one if it's empty.
    pub fn allocate(&self, timestamp: f64, pushthrough: bool) -> SampleRef {
        let payload = self
            .0
            .freelist
            .pop()
            .unwrap_or_else(|| Self::blank_payload(self.0.format, self.0.channels));
        self.0.allocated.fetch_add(1, Ordering::AcqRel);
        Arc::new(Sample {
            timestamp,
            pushthrough,
            format: self.0.format,
            channels: self.0.channels,
            payload: Some(payload),
            pool: self.0.clone(),
        })
    }

    pub fn format(&self) -> ChannelFormat {
        self.0.format
    }

    pub fn channels(&self) -> u32 {
        self.0.channels
    }

    /// `(total allocated) - (total released)`, an invariant-checking accessor (spec §8).
    pub fn live_count(&self) -> i64 {
        self.0.allocated.load(Ordering::Acquire) as i64 - self.0.released.load(Ordering::Acquire) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    #[test]
    fn allocate_and_release_balances() {
        let pool = Pool::new(ChannelFormat::Float32, 4, 2);
        let s1 = pool.allocate(0.0, false);
        let s2 = pool.allocate(1.0, false);
        assert_eq!(pool.live_count(), 2);
        drop(s1);
        assert_eq!(pool.live_count(), 1);
        drop(s2);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn freelist_recycles_payload_capacity() {
        let pool = Pool::new(ChannelFormat::Int16, 2, 0);
        let s = pool.allocate(0.0, false);
        drop(s);
        // The freed payload should be handed back out rather than freshly allocated.
        let s2 = pool.allocate(1.0, false);
        assert_eq!(s2.payload().as_numeric().unwrap().len(), 4);
    }

    #[test]
    fn concurrent_release_from_many_threads() {
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        let samples: Vec<_> = (0..64).map(|i| pool.allocate(i as f64, false)).collect();
        assert_eq!(pool.live_count(), 64);
        let mut handles = Vec::new();
        for s in samples {
            let s = StdArc::clone(&s);
            handles.push(std::thread::spawn(move || drop(s)));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn mutate_fresh_allocation_via_get_mut() {
        let pool = Pool::new(ChannelFormat::Int32, 1, 0);
        let mut s = pool.allocate(0.0, false);
        Arc::get_mut(&mut s)
            .unwrap()
            .payload_mut()
            .as_numeric_mut()
            .unwrap()
            .copy_from_slice(&42i32.to_le_bytes());
        assert_eq!(
            i32::from_le_bytes(s.payload().as_numeric().unwrap().try_into().unwrap()),
            42
        );
    }
}
