//! NTP-style time-offset subclient (part of C11, spec §4.11): probes the outlet's UDP
//! time service and republishes a smoothed offset/uncertainty pair.

use crate::clock::local_clock;
use crate::config;
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Reading {
    offset: f64,
    rtt: f64,
}

/// One `t0/t1/t2/t3` round trip: `offset = ((t1-t0)+(t2-t3))/2`, `rtt = (t3-t0)-(t2-t1)`.
fn probe_once(socket: &UdpSocket, addr: SocketAddr, wave_id: u64, timeout: Duration) -> Option<Reading> {
    let t0 = local_clock();
    let request = format!("LSL:timedata\r\n{wave_id} {t0}\r\n");
    socket.send_to(request.as_bytes(), addr).ok()?;
    socket.set_read_timeout(Some(timeout)).ok()?;

    let mut buf = [0u8; 256];
    let (len, _) = socket.recv_from(&mut buf).ok()?;
    let t3 = local_clock();
    let text = String::from_utf8_lossy(&buf[..len]);
    let mut parts = text.trim().split_whitespace();
    let reply_id: u64 = parts.next()?.parse().ok()?;
    if reply_id != wave_id {
        return None;
    }
    let got_t0: f64 = parts.next()?.parse().ok()?;
    let t1: f64 = parts.next()?.parse().ok()?;
    let t2: f64 = parts.next()?.parse().ok()?;
    if got_t0 != t0 {
        return None;
    }
    let offset = ((t1 - t0) + (t2 - t3)) / 2.0;
    let rtt = (t3 - t0) - (t2 - t1);
    Some(Reading { offset, rtt })
}

/// Run `time_probe_count` probes spaced `time_probe_interval` apart, and return the
/// reading with the smallest round-trip time (spec §4.11's "pick smallest-RTT reply").
fn probe_wave(socket: &UdpSocket, addr: SocketAddr, wave_base: u64) -> Option<Reading> {
    let cfg = config::get();
    let mut best: Option<Reading> = None;
    for i in 0..cfg.time_probe_count {
        if let Some(r) = probe_once(socket, addr, wave_base + i as u64, Duration::from_secs_f64(cfg.time_probe_max_rtt)) {
            if best.map(|b| r.rtt < b.rtt).unwrap_or(true) {
                best = Some(r);
            }
        }
        std::thread::sleep(Duration::from_secs_f64(cfg.time_probe_interval));
    }
    best
}

/// Background time-correction tracker. `time_correction(timeout)` returns the latest
/// smoothed offset, or blocks briefly for the first reading to arrive.
pub struct TimeReceiver {
    latest: Arc<Mutex<Option<Reading>>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeReceiver {
    /// Start probing `addr`. `shared_offset` is published into on every completed wave so
    /// a post-processor's `query_correction` callback can read it without holding a
    /// reference to this receiver (which may not exist yet when the pipeline is built).
    pub fn start(addr: SocketAddr, shared_offset: Arc<Mutex<Option<f64>>>) -> Self {
        let latest = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_latest = latest.clone();
        let worker_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else { return };
            let cfg = config::get();
            let mut wave: u64 = 1;
            while !worker_shutdown.load(Ordering::Acquire) {
                if let Some(reading) = probe_wave(&socket, addr, wave) {
                    *worker_latest.lock() = Some(reading);
                    *shared_offset.lock() = Some(reading.offset);
                }
                wave = wave.wrapping_add(cfg.time_probe_count as u64);
                std::thread::sleep(Duration::from_secs_f64(cfg.time_update_interval));
            }
        });

        TimeReceiver { latest, shutdown, worker: Mutex::new(Some(handle)) }
    }

    /// The most recently measured clock offset in seconds (`local_clock() + offset` maps
    /// an inlet-side timestamp onto the outlet's clock), waiting up to `timeout` for a
    /// first reading if none has arrived yet.
    pub fn time_correction(&self, timeout: Duration) -> Option<f64> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(r) = *self.latest.lock() {
                return Some(r.offset);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for TimeReceiver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
