//! Inlet-side timestamp post-processing pipeline (C12, spec §4.12): clocksync, RLS
//! dejitter, monotonize, applied in that order and selected via a bitmask.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub const PROC_NONE: u32 = 0;
pub const PROC_CLOCKSYNC: u32 = 1;
pub const PROC_DEJITTER: u32 = 2;
pub const PROC_MONOTONIZE: u32 = 4;
pub const PROC_THREADSAFE: u32 = 8;
pub const PROC_ALL: u32 = PROC_CLOCKSYNC | PROC_DEJITTER | PROC_MONOTONIZE | PROC_THREADSAFE;

const REQUERY_SAMPLES: u64 = 50;
const REQUERY_INTERVAL: Duration = Duration::from_millis(500);

struct Dejitter {
    initialized: bool,
    applicable: bool,
    baseline: f64,
    n: f64,
    w0: f64,
    w1: f64,
    p00: f64,
    p01: f64,
    p10: f64,
    p11: f64,
    lambda: f64,
}

impl Dejitter {
    fn new() -> Self {
        Dejitter {
            initialized: false,
            applicable: false,
            baseline: 0.0,
            n: 0.0,
            w0: 0.0,
            w1: 0.0,
            p00: 1e4,
            p01: 0.0,
            p10: 0.0,
            p11: 1e4,
            lambda: 1.0,
        }
    }

    fn reinit(&mut self, value: f64, srate: f64, halftime: f32) {
        self.initialized = true;
        self.applicable = srate > 0.0;
        self.baseline = value;
        self.n = 0.0;
        self.w0 = 0.0;
        self.w1 = if srate > 0.0 { 1.0 / srate } else { 0.0 };
        self.p00 = 1e4;
        self.p01 = 0.0;
        self.p10 = 0.0;
        self.p11 = 1e4;
        self.lambda = if srate > 0.0 && halftime > 0.0 {
            2f64.powf(-1.0 / (srate as f64 * halftime as f64))
        } else {
            1.0
        };
    }

    /// Online RLS update of `t_hat = w0 + w1 * n` and return the smoothed estimate.
    fn update(&mut self, value: f64) -> f64 {
        if !self.applicable {
            return value;
        }
        let t = value - self.baseline;
        let (x0, x1) = (1.0, self.n);
        let px0 = self.p00 * x0 + self.p01 * x1;
        let px1 = self.p10 * x0 + self.p11 * x1;
        let denom = self.lambda + x0 * px0 + x1 * px1;
        let k0 = px0 / denom;
        let k1 = px1 / denom;
        let err = t - (self.w0 * x0 + self.w1 * x1);
        self.w0 += k0 * err;
        self.w1 += k1 * err;
        let np00 = (self.p00 - k0 * px0) / self.lambda;
        let np01 = (self.p01 - k0 * px1) / self.lambda;
        let np10 = (self.p10 - k1 * px0) / self.lambda;
        let np11 = (self.p11 - k1 * px1) / self.lambda;
        self.p00 = np00;
        self.p01 = np01;
        self.p10 = np10;
        self.p11 = np11;
        self.n += 1.0;
        self.baseline + self.w0 + self.w1 * (self.n - 1.0)
    }

    fn skip(&mut self, count: f64) {
        self.n += count;
    }
}

struct Inner {
    options: u32,
    halftime: f32,
    samples_seen: u64,
    next_query_at: Instant,
    last_offset: f64,
    dejitter: Dejitter,
    last_value: f64,
}

/// Applies clock-sync offset, RLS jitter smoothing, and monotonization to inlet
/// timestamps, in that order (spec §4.12). `query_correction`/`query_srate`/`query_reset`
/// let the pipeline pull fresh state from the owning inlet's time receiver without it
/// having to push updates in.
pub struct TimePostprocessor {
    inner: Mutex<Inner>,
    query_correction: Box<dyn Fn() -> f64 + Send + Sync>,
    query_srate: Box<dyn Fn() -> f64 + Send + Sync>,
    query_reset: Box<dyn Fn() -> bool + Send + Sync>,
}

impl TimePostprocessor {
    pub fn new(
        query_correction: Box<dyn Fn() -> f64 + Send + Sync>,
        query_srate: Box<dyn Fn() -> f64 + Send + Sync>,
        query_reset: Box<dyn Fn() -> bool + Send + Sync>,
        halftime: f32,
    ) -> Self {
        TimePostprocessor {
            inner: Mutex::new(Inner {
                options: PROC_NONE,
                halftime,
                samples_seen: 0,
                next_query_at: Instant::now(),
                last_offset: 0.0,
                dejitter: Dejitter::new(),
                last_value: f64::NEG_INFINITY,
            }),
            query_correction,
            query_srate,
            query_reset,
        }
    }

    /// Replace the active stage mask. Dejitter reinitializes on its next sample;
    /// monotonize's high-watermark resets to `-inf` (spec §4.12).
    pub fn set_options(&self, options: u32) {
        let mut inner = self.inner.lock();
        let dejitter_turned_on = options & PROC_DEJITTER != 0 && inner.options & PROC_DEJITTER == 0;
        let monotonize_turned_on =
            options & PROC_MONOTONIZE != 0 && inner.options & PROC_MONOTONIZE == 0;
        inner.options = options;
        if dejitter_turned_on {
            inner.dejitter.initialized = false;
        }
        if monotonize_turned_on {
            inner.last_value = f64::NEG_INFINITY;
        }
    }

    pub fn smoothing_halftime(&self, value: f32) {
        self.inner.lock().halftime = value;
    }

    /// Process one timestamp through the active pipeline stages.
    pub fn process_timestamp(&self, value: f64) -> f64 {
        let mut inner = self.inner.lock();
        let options = inner.options;
        let mut v = value;

        if options & PROC_CLOCKSYNC != 0 {
            let now = Instant::now();
            if (self.query_reset)() {
                inner.dejitter.initialized = false;
                inner.last_value = f64::NEG_INFINITY;
            }
            if now >= inner.next_query_at || inner.samples_seen % REQUERY_SAMPLES == 0 {
                inner.last_offset = (self.query_correction)();
                inner.next_query_at = now + REQUERY_INTERVAL;
            }
            v += inner.last_offset;
        }

        if options & PROC_DEJITTER != 0 {
            if !inner.dejitter.initialized {
                let srate = (self.query_srate)();
                let halftime = inner.halftime;
                inner.dejitter.reinit(v, srate, halftime);
                v = inner.dejitter.baseline;
            } else {
                v = inner.dejitter.update(v);
            }
        }

        if options & PROC_MONOTONIZE != 0 {
            if v < inner.last_value {
                v = inner.last_value;
            } else {
                inner.last_value = v;
            }
        }

        inner.samples_seen += 1;
        v
    }

    /// Advance the dejitter phase by `count` skipped samples without producing output,
    /// so a gap in the stream doesn't desynchronize the regression's sample index.
    pub fn note_skipped_samples(&self, count: u32) {
        let mut inner = self.inner.lock();
        inner.dejitter.skip(count as f64);
    }
}
