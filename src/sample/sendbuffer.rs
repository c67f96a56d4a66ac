//! Fan-out dispatcher from a single outlet producer to every attached consumer queue
//! (C3, spec §4.3).

use super::{ConsumerQueue, SampleRef};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Holds non-owning links to live consumer queues. A queue registers itself when
/// created through `new_consumer` and is dropped from the registry lazily (via `Weak`)
/// once its last strong reference elsewhere is gone — equivalent to "unregisters in its
/// destructor" without needing an explicit callback.
pub struct SendBuffer {
    queues: Mutex<Vec<Weak<ConsumerQueue>>>,
    cv: Condvar,
    max_buffered_cap: usize,
}

impl SendBuffer {
    pub fn new(max_buffered_cap: usize) -> Arc<Self> {
        Arc::new(SendBuffer {
            queues: Mutex::new(Vec::new()),
            cv: Condvar::new(),
            max_buffered_cap,
        })
    }

    /// Construct a new consumer queue with capacity `min(max_buffered, global_max)` and
    /// register it with this send buffer.
    pub fn new_consumer(&self, max_buffered: usize) -> Arc<ConsumerQueue> {
        let cap = max_buffered.min(self.max_buffered_cap).max(1);
        let queue = Arc::new(ConsumerQueue::new(cap));
        let mut guard = self.queues.lock();
        guard.push(Arc::downgrade(&queue));
        drop(guard);
        self.cv.notify_all();
        queue
    }

    /// Push a sample to every currently-registered (still-alive) queue.
    pub fn push(&self, sample: SampleRef) {
        let mut guard = self.queues.lock();
        guard.retain(|weak| {
            if let Some(q) = weak.upgrade() {
                q.push(sample.clone());
                true
            } else {
                false
            }
        });
    }

    /// Block until at least one consumer queue is registered, or the timeout elapses.
    /// Returns whether a consumer is present when it returns.
    pub fn wait_for_consumers(&self, timeout: Duration) -> bool {
        let mut guard = self.queues.lock();
        if Self::has_live(&guard) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Self::has_live(&guard);
            }
            let timed_out = self.cv.wait_for(&mut guard, deadline - now).timed_out();
            if Self::has_live(&guard) {
                return true;
            }
            if timed_out {
                return false;
            }
        }
    }

    /// Snapshot: whether any consumer is currently registered.
    pub fn have_consumers(&self) -> bool {
        let guard = self.queues.lock();
        Self::has_live(&guard)
    }

    fn has_live(guard: &[Weak<ConsumerQueue>]) -> bool {
        guard.iter().any(|w| w.strong_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelFormat;
    use crate::sample::Pool;
    use std::thread;

    #[test]
    fn push_with_no_consumers_succeeds_silently() {
        let sb = SendBuffer::new(1024);
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        sb.push(pool.allocate(0.0, false));
        assert!(!sb.have_consumers());
    }

    #[test]
    fn each_consumer_gets_one_copy_in_order() {
        let sb = SendBuffer::new(1024);
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        let q1 = sb.new_consumer(16);
        let q2 = sb.new_consumer(16);
        for i in 0..5 {
            sb.push(pool.allocate(i as f64, false));
        }
        for q in [&q1, &q2] {
            let mut got = Vec::new();
            while let Some(s) = q.pop(Duration::from_millis(0)) {
                got.push(s.timestamp);
            }
            assert_eq!(got, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        }
    }

    #[test]
    fn dropped_consumer_stops_receiving_and_is_pruned() {
        let sb = SendBuffer::new(1024);
        let pool = Pool::new(ChannelFormat::Int8, 1, 0);
        let q1 = sb.new_consumer(16);
        drop(q1);
        sb.push(pool.allocate(0.0, false));
        assert!(!sb.have_consumers());
    }

    #[test]
    fn wait_for_consumers_unblocks_on_registration() {
        let sb = SendBuffer::new(1024);
        let sbc = sb.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _q = sbc.new_consumer(8);
        });
        assert!(sb.wait_for_consumers(Duration::from_secs(1)));
        handle.join().unwrap();
    }
}
