//! Bounded per-subscriber consumer queue (C2, spec §4.2).
//!
//! The slot layout and push/pop algorithm follow Dmitry Vyukov's bounded MPMC queue, the
//! same algorithm the original `consumer_queue.h` cites explicitly (it's also what
//! powers `crossbeam-channel`'s bounded channel). The producer side here is restricted to
//! a single caller per the spec; `pop` may be called from multiple consumer threads.
//! `push` additionally implements "drop oldest on overrun": on a full ring it pops the
//! oldest entry before retrying, exactly like the original's `push_sample` loop.

use super::SampleRef;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct Slot {
    /// Sequencing stamp: `index` when empty-and-writable, `index+1` when full-and-readable.
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<SampleRef>>,
}

unsafe impl Sync for Slot {}

pub struct ConsumerQueue {
    buffer: Box<[Slot]>,
    capacity: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl ConsumerQueue {
    /// Construct a new queue with the given capacity (must be nonzero).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "consumer queue capacity must be nonzero");
        let buffer = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ConsumerQueue {
            buffer,
            capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Try to push without evicting. `Ok` on success; `Err(value)` hands the value back
    /// if the ring is currently full.
    fn try_push(&self, value: SampleRef) -> Result<(), SampleRef> {
        let tail = self.tail.load(Ordering::Relaxed);
        let index = tail % self.capacity;
        let slot = &self.buffer[index];
        let stamp = slot.stamp.load(Ordering::Acquire);
        if stamp != tail {
            // slot still holds an unread value from a previous lap: ring is full
            return Err(value);
        }
        // single producer: no CAS needed to claim `tail`
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.stamp.store(tail + 1, Ordering::Release);
        self.tail.store(tail + 1, Ordering::Relaxed);
        Ok(())
    }

    fn try_pop(&self) -> Option<SampleRef> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let index = head % self.capacity;
            let slot = &self.buffer[index];
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == head + 1 {
                if self
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    // ready for the producer's next lap write at this index
                    slot.stamp.store(head + self.capacity, Ordering::Release);
                    return Some(value);
                }
                // lost the race to another consumer; retry
            } else if stamp == head {
                return None; // empty
            } else {
                // another consumer is ahead of us; reload and retry
                continue;
            }
        }
    }

    /// Push a new sample. Never fails: evicts the oldest entry first if the ring is full.
    /// Wakes one blocked consumer. Single-producer only.
    pub fn push(&self, sample: SampleRef) {
        let mut value = sample;
        loop {
            match self.try_push(value) {
                Ok(()) => break,
                Err(v) => {
                    value = v;
                    self.try_pop();
                }
            }
        }
        let _guard = self.mutex.lock();
        self.cv.notify_one();
    }

    /// Pop a sample, blocking up to `timeout` if the ring is currently empty. A zero
    /// timeout never blocks. May be called concurrently from multiple threads.
    pub fn pop(&self, timeout: Duration) -> Option<SampleRef> {
        if let Some(v) = self.try_pop() {
            return Some(v);
        }
        if timeout.is_zero() {
            return None;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        loop {
            if let Some(v) = self.try_pop() {
                return Some(v);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let timed_out = self.cv.wait_for(&mut guard, deadline - now).timed_out();
            if timed_out {
                return self.try_pop();
            }
        }
    }

    /// Atomically drop and count all resident samples.
    pub fn flush(&self) -> u32 {
        let mut count = 0u32;
        while self.try_pop().is_some() {
            count += 1;
        }
        count
    }

    /// Approximate unless called on the consumer thread.
    pub fn empty(&self) -> bool {
        self.read_available() == 0
    }

    /// Approximate unless called on the consumer thread.
    pub fn read_available(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }
}

impl Drop for ConsumerQueue {
    fn drop(&mut self) {
        self.flush();
    }
}
