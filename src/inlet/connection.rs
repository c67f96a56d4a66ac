//! Inlet connection (C10, spec §4.10): shared endpoint state plus the re-resolve watchdog.

use crate::clock::local_clock;
use crate::config;
use crate::descriptor::StreamInfo;
use crate::resolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Anything long-lived (a socket, a streambuf) that a watchdog-driven re-resolve can tear
/// down from the outside, per spec §9 "Cancellable I/O". Each subclient registers its
/// cancellable on connect and relies on `Weak` upgrade failure for automatic unregistration.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Shared mutable endpoint state, read by the info/data/time loops and written only by the
/// watchdog on a successful re-resolve (spec §3 "Endpoint bundle").
pub struct InletConnection {
    current: RwLock<StreamInfo>,
    recovery_enabled: bool,
    lost: AtomicBool,
    shutdown: AtomicBool,
    active_transmissions: AtomicU32,
    last_receive_time_bits: AtomicU64,
    cancellables: parking_lot::Mutex<Vec<Weak<dyn Cancellable>>>,
    onlost: parking_lot::Mutex<HashMap<u64, Arc<parking_lot::Condvar>>>,
    onrecover: parking_lot::Mutex<HashMap<u64, Box<dyn Fn() + Send>>>,
    next_callback_id: AtomicU64,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
    recovering: AtomicBool,
}

impl InletConnection {
    pub fn new(info: StreamInfo) -> Arc<Self> {
        let recovery_enabled = !info.descriptor.source_id.is_empty();
        let conn = Arc::new(InletConnection {
            current: RwLock::new(info),
            recovery_enabled,
            lost: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            active_transmissions: AtomicU32::new(0),
            last_receive_time_bits: AtomicU64::new(local_clock().to_bits()),
            cancellables: parking_lot::Mutex::new(Vec::new()),
            onlost: parking_lot::Mutex::new(HashMap::new()),
            onrecover: parking_lot::Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(1),
            watchdog: parking_lot::Mutex::new(None),
            recovering: AtomicBool::new(false),
        });
        conn.clone().engage();
        conn
    }

    fn engage(self: Arc<Self>) {
        let cfg = config::get();
        let interval = Duration::from_secs_f64(cfg.watchdog_check_interval.max(0.1));
        let this = self.clone();
        let handle = std::thread::spawn(move || {
            while !this.shutdown.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                this.watchdog_tick();
            }
        });
        *self.watchdog.lock() = Some(handle);
    }

    fn watchdog_tick(&self) {
        let cfg = config::get();
        if self.active_transmissions.load(Ordering::Acquire) == 0 {
            return;
        }
        let elapsed = local_clock() - f64::from_bits(self.last_receive_time_bits.load(Ordering::Acquire));
        if elapsed <= cfg.watchdog_time_threshold {
            return;
        }
        self.try_recover();
    }

    /// Re-resolve the same logical stream under a new UID and swap it in. Guarded by
    /// `recovering` so a watchdog tick and a subclient's connection-loss notification can't
    /// both drive a resolve at once.
    fn try_recover(&self) {
        if !self.recovery_enabled {
            self.declare_lost();
            return;
        }
        if self.recovering.swap(true, Ordering::AcqRel) {
            return;
        }
        let current_uid = self.current_uid();
        let query = {
            let guard = self.current.read();
            format!(
                "name='{}' and type='{}' and source_id='{}' and uid!='{}'",
                guard.descriptor.name, guard.descriptor.stream_type, guard.descriptor.source_id, current_uid
            )
        };
        let results = resolver::resolve_streams(&query, 1, Duration::from_secs(2), Duration::ZERO);
        if let Some(new_info) = results.into_iter().next() {
            *self.current.write() = new_info;
            self.cancel_all();
            self.run_onrecover();
        }
        self.recovering.store(false, Ordering::Release);
    }

    /// Called by a subclient whose socket died unexpectedly (not via `shutdown()`): drives
    /// an immediate recovery attempt instead of waiting for the next watchdog tick, since
    /// `active_transmissions` drops to zero the moment the dead subclient's loop exits.
    pub fn notify_connection_lost(&self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.try_recover();
    }

    fn declare_lost(&self) {
        self.lost.store(true, Ordering::Release);
        let waiters = self.onlost.lock();
        for cv in waiters.values() {
            cv.notify_all();
        }
    }

    fn cancel_all(&self) {
        let mut guard = self.cancellables.lock();
        for weak in guard.drain(..) {
            if let Some(c) = weak.upgrade() {
                c.cancel();
            }
        }
    }

    fn run_onrecover(&self) {
        let callbacks = self.onrecover.lock();
        for f in callbacks.values() {
            f();
        }
    }

    pub fn register_cancellable(&self, c: Weak<dyn Cancellable>) {
        self.cancellables.lock().push(c);
    }

    pub fn register_onlost(&self) -> (u64, Arc<parking_lot::Condvar>) {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let cv = Arc::new(parking_lot::Condvar::new());
        self.onlost.lock().insert(id, cv.clone());
        (id, cv)
    }

    pub fn unregister_onlost(&self, id: u64) {
        self.onlost.lock().remove(&id);
    }

    pub fn register_onrecover(&self, f: Box<dyn Fn() + Send>) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.onrecover.lock().insert(id, f);
        id
    }

    pub fn unregister_onrecover(&self, id: u64) {
        self.onrecover.lock().remove(&id);
    }

    pub fn acquire_watchdog(&self) {
        self.active_transmissions.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_watchdog(&self) {
        self.active_transmissions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn update_receive_time(&self, t: f64) {
        self.last_receive_time_bits.store(t.to_bits(), Ordering::Release);
    }

    pub fn lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn shutdown_flag(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn current_uid(&self) -> String {
        self.current.read().uid().to_string()
    }

    pub fn current_srate(&self) -> f64 {
        self.current.read().descriptor.nominal_srate
    }

    pub fn endpoint(&self) -> parking_lot::RwLockReadGuard<'_, StreamInfo> {
        self.current.read()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cancel_all();
        let waiters = self.onlost.lock();
        for cv in waiters.values() {
            cv.notify_all();
        }
        if let Some(handle) = self.watchdog.lock().take() {
            let _ = handle.join();
        }
    }
}
