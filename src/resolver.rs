//! Discovery client (C9, spec §4.9): oneshot and continuous resolution.

use crate::config;
use crate::descriptor::StreamInfo;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct ResultEntry {
    info: StreamInfo,
    last_seen: Instant,
    first_address: SocketAddr,
}

/// Keyed by instance UID (spec §3 "Resolver result map"). Most recent descriptor wins on
/// re-receive, but the earliest-known address is preserved.
#[derive(Default)]
struct ResultMap {
    entries: HashMap<String, ResultEntry>,
}

impl ResultMap {
    fn insert(&mut self, uid: String, info: StreamInfo, from: SocketAddr) {
        match self.entries.get_mut(&uid) {
            Some(existing) => {
                existing.info = info;
                existing.last_seen = Instant::now();
            }
            None => {
                self.entries.insert(uid, ResultEntry { info, last_seen: Instant::now(), first_address: from });
            }
        }
    }

    fn prune(&mut self, forget_after: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, e| now.duration_since(e.last_seen) < forget_after);
    }

    fn unique_count(&self) -> usize {
        self.entries.len()
    }
}

fn with_session_scope(query: &str, session_id: &str) -> String {
    if query.trim().is_empty() {
        format!("session_id='{session_id}'")
    } else {
        format!("({query}) and session_id='{session_id}'")
    }
}

fn query_id_for(query: &str) -> String {
    // A stable, non-cryptographic hash of the query string, used as a dedup/reply token.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in query.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// Send one wave of shortinfo queries to the configured multicast groups and known
/// unicast peers (spec §4.9), and collect replies into `map` until `cancel_after` elapses.
fn resolve_attempt(query: &str, socket: &UdpSocket, cancel_after: Duration, map: &Arc<Mutex<ResultMap>>) {
    let cfg = config::get();
    let return_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let qid = query_id_for(query);
    let request = format!("LSL:shortinfo\r\n{query}\r\n{return_port} {qid}\r\n");

    for group in config::active_multicast_groups(cfg) {
        if let Ok(addr) = group.parse::<Ipv4Addr>() {
            let dest = SocketAddr::new(addr.into(), cfg.multicast_port);
            let _ = socket.send_to(request.as_bytes(), dest);
        }
    }
    for peer in &cfg.known_peers {
        for port in cfg.base_port..cfg.base_port.saturating_add(cfg.port_range) {
            if let Ok(ip) = peer.parse::<std::net::IpAddr>() {
                let _ = socket.send_to(request.as_bytes(), SocketAddr::new(ip, port));
            }
        }
    }

    let deadline = Instant::now() + cancel_after;
    let mut buf = [0u8; 65536];
    let _ = socket.set_read_timeout(Some(Duration::from_millis(50)));
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let text = String::from_utf8_lossy(&buf[..len]);
                let mut lines = text.splitn(2, "\r\n");
                let Some(reply_qid) = lines.next() else { continue };
                if reply_qid != qid {
                    continue;
                }
                let Some(xml) = lines.next() else { continue };
                if let Ok(info) = StreamInfo::from_xml(xml, cfg.max_cached_queries) {
                    let uid = info.uid().to_string();
                    map.lock().insert(uid, info, from);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => continue,
        }
    }
}

/// A dedicated outbound socket for discovery queries, with the multicast TTL set per
/// the configured resolve scope (spec §4.9), matching the TTL the outlet side applies
/// to its own multicast listeners in `net/udp.rs`/`outlet.rs`.
fn new_resolve_socket() -> std::io::Result<UdpSocket> {
    let cfg = config::get();
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
    sock.set_multicast_ttl_v4(config::multicast_ttl_for_scope(cfg.resolve_scope))?;
    Ok(sock.into())
}

/// One-shot resolution: runs a wave schedule until `min_results` unique instance UIDs have
/// been seen for at least `min_time` seconds, or `timeout` elapses.
pub fn resolve_streams(query: &str, min_results: usize, timeout: Duration, min_time: Duration) -> Vec<StreamInfo> {
    let cfg = config::get();
    let scoped = with_session_scope(query, &cfg.session_id);
    let map = Arc::new(Mutex::new(ResultMap::default()));
    let start = Instant::now();
    let mut satisfied_since: Option<Instant> = None;

    let Ok(socket) = new_resolve_socket() else { return Vec::new() };

    loop {
        if start.elapsed() >= timeout {
            break;
        }
        let wave_budget = Duration::from_millis(500).min(timeout.saturating_sub(start.elapsed()));
        resolve_attempt(&scoped, &socket, wave_budget, &map);
        map.lock().prune(Duration::from_secs(3600));

        if map.lock().unique_count() >= min_results.max(1) {
            let now = Instant::now();
            let since = *satisfied_since.get_or_insert(now);
            if now.duration_since(since) >= min_time {
                break;
            }
        } else {
            satisfied_since = None;
        }
    }

    map.lock().entries.drain().map(|(_, e)| e.info).collect()
}

/// A continuous background resolver (spec §4.9): repeats the wave schedule at
/// `continuous_resolve_interval`, pruning entries older than `forget_after`.
pub struct ContinuousResolver {
    map: Arc<Mutex<ResultMap>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    forget_after: Duration,
}

impl ContinuousResolver {
    pub fn new(query: &str, forget_after: Duration) -> Self {
        let cfg = config::get();
        let scoped = with_session_scope(query, &cfg.session_id);
        let map = Arc::new(Mutex::new(ResultMap::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_map = map.clone();
        let worker_shutdown = shutdown.clone();
        let interval = Duration::from_secs_f64(cfg.continuous_resolve_interval.max(0.1));
        let handle = std::thread::spawn(move || {
            let Ok(socket) = new_resolve_socket() else { return };
            while !worker_shutdown.load(Ordering::Acquire) {
                resolve_attempt(&scoped, &socket, Duration::from_millis(500), &worker_map);
                worker_map.lock().prune(forget_after);
                std::thread::sleep(interval);
            }
        });

        ContinuousResolver { map, shutdown, worker: Mutex::new(Some(handle)), forget_after }
    }

    /// Current (pruned) results, at most `max` of them.
    pub fn results(&self, max: usize) -> Vec<StreamInfo> {
        let mut guard = self.map.lock();
        guard.prune(self.forget_after);
        guard.entries.drain().take(max).map(|(_, e)| e.info).collect()
    }
}

impl Drop for ContinuousResolver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Convenience wrapper for `resolve_by_property(prop, value, min, timeout)` (spec §6).
pub fn resolve_by_property(prop: &str, value: &str, min_results: usize, timeout: Duration) -> Vec<StreamInfo> {
    let escaped = value.replace('\'', "&apos;");
    resolve_streams(&format!("{prop}='{escaped}'"), min_results, timeout, Duration::ZERO)
}

/// `resolve_by_predicate(pred, min, timeout)` (spec §6): the predicate is used verbatim.
pub fn resolve_by_predicate(pred: &str, min_results: usize, timeout: Duration) -> Vec<StreamInfo> {
    resolve_streams(pred, min_results, timeout, Duration::ZERO)
}
