//! Process-wide monotonic clock (spec §6: `local_clock() -> f64 seconds`). All sample
//! timestamps and wire time-sync exchanges are expressed in this clock's units.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds since an arbitrary, process-wide fixed epoch, monotonically increasing.
/// Every subsystem that stamps a timestamp (outlet push, UDP time-probe receive/send)
/// must call this, never `SystemTime`, so that sample and time-sync clocks agree.
pub fn local_clock() -> f64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonically_increasing() {
        let a = local_clock();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = local_clock();
        assert!(b > a);
    }
}
