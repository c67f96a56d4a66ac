//! Inlet-side API surface (C10–C12, spec §4.10–§4.12): connection/watchdog, the three
//! protocol subclients, and timestamp post-processing, composed into `StreamInlet`.

pub mod connection;
pub mod data_receiver;
pub mod info_receiver;
pub mod time_receiver;

use crate::descriptor::{buffer_len_to_samples, StreamInfo};
use crate::error::{LslError, Result};
use crate::sample::{Pool, SampleRef, DEDUCED_TIMESTAMP};
use connection::InletConnection;
use data_receiver::DataReceiver;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time_receiver::TimeReceiver;

/// How long a post-recovery reconnect attempt waits for the new endpoint to accept the
/// TCP data connection before giving up (spec §4.10 "Recovery").
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub use crate::postprocess::{
    TimePostprocessor, PROC_ALL, PROC_CLOCKSYNC, PROC_DEJITTER, PROC_MONOTONIZE, PROC_NONE,
    PROC_THREADSAFE,
};

fn endpoint_addrs(info: &StreamInfo) -> Result<(SocketAddr, SocketAddr)> {
    let net = &info.network;
    let ip: IpAddr = net
        .v4address
        .as_deref()
        .filter(|s| *s != "0.0.0.0")
        .or(Some("127.0.0.1"))
        .unwrap()
        .parse()
        .map_err(|_| LslError::internal("unparseable v4 address in stream info"))?;
    Ok((SocketAddr::new(ip, net.v4data_port), SocketAddr::new(ip, net.v4service_port)))
}

/// A subscription to one published stream (spec §6 `stream_inlet`).
pub struct StreamInlet {
    conn: Arc<InletConnection>,
    pool: Pool,
    data: Arc<Mutex<Option<Arc<DataReceiver>>>>,
    time: Arc<Mutex<Option<TimeReceiver>>>,
    shared_offset: Arc<Mutex<Option<f64>>>,
    postprocess: Arc<TimePostprocessor>,
    opened: Arc<AtomicBool>,
    onrecover_id: u64,
    max_buflen_requested: u32,
    max_chunklen: u32,
    cache_capacity: usize,
    last_timestamp: Mutex<f64>,
}

/// Reopen the data/time subclients against whatever endpoint `conn` currently reports.
/// Shared by `open_stream` and the post-recovery `onrecover` callback.
fn reopen(
    conn: &Arc<InletConnection>,
    pool: &Pool,
    shared_offset: &Arc<Mutex<Option<f64>>>,
    max_buflen_requested: u32,
    timeout: Duration,
) -> Result<(Arc<DataReceiver>, TimeReceiver)> {
    let (tcp_addr, udp_addr) = endpoint_addrs(&conn.endpoint())?;
    let srate = conn.current_srate();
    let buflen_samples =
        buffer_len_to_samples(max_buflen_requested as f64, true, false, srate).max(1) as usize;
    let receiver = DataReceiver::connect(conn, tcp_addr, pool.clone(), buflen_samples, timeout)?;
    let time = TimeReceiver::start(udp_addr, shared_offset.clone());
    Ok((receiver, time))
}

impl StreamInlet {
    pub fn new(info: StreamInfo, max_buflen: u32, max_chunklen: u32, recover: bool) -> Self {
        let cfg = crate::config::get();
        let format = info.descriptor.channel_format;
        let channels = info.descriptor.channel_count;
        let reserve = if cfg.inlet_buffer_reserve_samples > 0 {
            cfg.inlet_buffer_reserve_samples
        } else {
            0
        };
        let pool = Pool::new(format, channels, reserve);
        let conn = InletConnection::new(info);
        let shared_offset: Arc<Mutex<Option<f64>>> = Arc::new(Mutex::new(None));

        let conn_for_srate = conn.clone();
        let offset_for_query = shared_offset.clone();
        let postprocess = Arc::new(TimePostprocessor::new(
            Box::new(move || offset_for_query.lock().unwrap_or(0.0)),
            Box::new(move || conn_for_srate.current_srate()),
            Box::new(|| false),
            cfg.smoothing_halftime,
        ));

        let data: Arc<Mutex<Option<Arc<DataReceiver>>>> = Arc::new(Mutex::new(None));
        let time: Arc<Mutex<Option<TimeReceiver>>> = Arc::new(Mutex::new(None));
        let opened = Arc::new(AtomicBool::new(false));

        // On a successful re-resolve the watchdog swaps in a new endpoint but has no way
        // to know this inlet's subscriber sockets; reopen them here so a caller blocked in
        // `pull_sample` starts seeing the recovered producer's samples again.
        let onrecover_id = if recover {
            // Weak, not a clone of `conn`: this closure lives inside `conn`'s own onrecover
            // map, so a strong capture would keep the connection alive forever.
            let conn_weak = Arc::downgrade(&conn);
            let pool_bg = pool.clone();
            let data_bg = data.clone();
            let time_bg = time.clone();
            let shared_offset_bg = shared_offset.clone();
            let opened_bg = opened.clone();
            conn.register_onrecover(Box::new(move || {
                if !opened_bg.load(Ordering::Acquire) {
                    return;
                }
                let Some(conn_bg) = conn_weak.upgrade() else { return };
                match reopen(&conn_bg, &pool_bg, &shared_offset_bg, max_buflen, RECONNECT_TIMEOUT) {
                    Ok((receiver, time_receiver)) => {
                        *data_bg.lock() = Some(receiver);
                        *time_bg.lock() = Some(time_receiver);
                    }
                    Err(e) => log::warn!("reconnect after recovery failed: {e}"),
                }
            }))
        } else {
            0
        };

        StreamInlet {
            conn,
            pool,
            data,
            time,
            shared_offset,
            postprocess,
            opened,
            onrecover_id,
            max_buflen_requested: max_buflen,
            max_chunklen,
            cache_capacity: cfg.max_cached_queries,
            last_timestamp: Mutex::new(DEDUCED_TIMESTAMP),
        }
    }

    /// Fetch the full `<desc>`-inclusive metadata, retrying transient failures.
    pub fn info(&self, timeout: Duration) -> Result<StreamInfo> {
        let (tcp_addr, _) = endpoint_addrs(&self.conn.endpoint())?;
        info_receiver::fetch_info_with_retry(tcp_addr, timeout, 2, Duration::from_millis(200), self.cache_capacity)
    }

    /// Open the data and time subclients against the current endpoint.
    pub fn open_stream(&self, timeout: Duration) -> Result<()> {
        let (receiver, time_receiver) =
            reopen(&self.conn, &self.pool, &self.shared_offset, self.max_buflen_requested, timeout)?;
        *self.data.lock() = Some(receiver);
        *self.time.lock() = Some(time_receiver);
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    pub fn close_stream(&self) {
        self.opened.store(false, Ordering::Release);
        self.data.lock().take();
        self.time.lock().take();
    }

    pub fn set_postprocessing(&self, flags: u32) {
        self.postprocess.set_options(flags);
    }

    pub fn smoothing_halftime(&self, value: f32) {
        self.postprocess.smoothing_halftime(value);
    }

    fn deduce_if_needed(&self, sample: &SampleRef) -> f64 {
        let mut last = self.last_timestamp.lock();
        let srate = self.conn.current_srate();
        let ts = if sample.timestamp == DEDUCED_TIMESTAMP && srate > 0.0 && last.is_finite() {
            *last + 1.0 / srate
        } else {
            sample.timestamp
        };
        *last = ts;
        ts
    }

    /// Pull one sample, blocking up to `timeout`. Returns the sample and its
    /// post-processed capture timestamp.
    pub fn pull_sample(&self, timeout: Duration) -> Option<(SampleRef, f64)> {
        let data = self.data.lock().clone()?;
        let sample = data.pop(timeout)?;
        let raw_ts = self.deduce_if_needed(&sample);
        let ts = self.postprocess.process_timestamp(raw_ts);
        Some((sample, ts))
    }

    /// Drain up to `max_chunklen` samples (0 = unlimited), blocking for the first one.
    pub fn pull_chunk(&self, timeout: Duration) -> Vec<(SampleRef, f64)> {
        let limit = if self.max_chunklen == 0 { usize::MAX } else { self.max_chunklen as usize };
        let mut out = Vec::new();
        if let Some((s, t)) = self.pull_sample(timeout) {
            out.push((s, t));
            while out.len() < limit {
                match self.pull_sample(Duration::ZERO) {
                    Some((s, t)) => out.push((s, t)),
                    None => break,
                }
            }
        }
        out
    }

    pub fn samples_available(&self) -> usize {
        self.data.lock().as_ref().map(|d| d.samples_available()).unwrap_or(0)
    }

    pub fn flush(&self) -> u32 {
        self.data.lock().as_ref().map(|d| d.flush()).unwrap_or(0)
    }

    pub fn was_clock_reset(&self) -> bool {
        false
    }

    /// `(offset, uncertainty)` measured by the time receiver, if available within `timeout`.
    pub fn time_correction(&self, timeout: Duration) -> Option<f64> {
        self.time.lock().as_ref().and_then(|t| t.time_correction(timeout))
    }

    pub fn lost(&self) -> bool {
        self.conn.lost()
    }
}

impl Drop for StreamInlet {
    fn drop(&mut self) {
        self.close_stream();
        if self.onrecover_id != 0 {
            self.conn.unregister_onrecover(self.onrecover_id);
        }
        self.conn.shutdown();
    }
}
