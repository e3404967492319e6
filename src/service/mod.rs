//! Service: the runtime record the registry owns, plus its immutable config,
//! status machine, container-naming and size/mount/env grammars.

mod config;
mod naming;
mod size;
mod status;

pub use config::{HealthCheckType, MountSpec, ServiceConfig};
pub use naming::{container_name, volume_name};
pub use size::parse_size;
pub use status::{AtomicStatus, Status};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::system::AtomicCounter;

/// The mutable runtime record for one configured service.
///
/// Owned exclusively by the Service Registry; the Lifecycle Controller and
/// Monitor Loop mutate it under the registry mutex, except for the hot
/// `connections`/`last_activity` pair which are lock-free (§5).
pub struct Service {
    pub config: ServiceConfig,
    pub container_name: String,

    pub container_id: parking_lot::RwLock<Option<String>>,
    pub pid: AtomicI64,
    pub host_port: AtomicU64,
    /// -1 = CPU, >=0 = GPU index.
    pub device: AtomicI64,

    pub status: AtomicStatus,

    pub ram: AtomicU64,
    pub vram: AtomicU64,
    pub peak_ram: AtomicU64,
    pub peak_vram: AtomicU64,
    pub peak_boot_time: parking_lot::RwLock<f64>,
    pub boot_time: parking_lot::RwLock<f64>,

    pub connections: AtomicCounter,
    last_activity: parking_lot::RwLock<Instant>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        let container_name = container_name(&config.name);
        Self {
            config,
            container_name,
            container_id: parking_lot::RwLock::new(None),
            pid: AtomicI64::new(-1),
            host_port: AtomicU64::new(0),
            device: AtomicI64::new(-1),
            status: AtomicStatus::new(Status::Stopped),
            ram: AtomicU64::new(0),
            vram: AtomicU64::new(0),
            peak_ram: AtomicU64::new(0),
            peak_vram: AtomicU64::new(0),
            peak_boot_time: parking_lot::RwLock::new(0.0),
            boot_time: parking_lot::RwLock::new(0.0),
            connections: AtomicCounter::new(0),
            last_activity: parking_lot::RwLock::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn pid(&self) -> Option<i64> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid < 0 {
            None
        } else {
            Some(pid)
        }
    }

    pub fn set_pid(&self, pid: Option<i64>) {
        self.pid.store(pid.unwrap_or(-1), Ordering::SeqCst);
    }

    pub fn host_port(&self) -> u16 {
        self.host_port.load(Ordering::SeqCst) as u16
    }

    pub fn set_host_port(&self, port: u16) {
        self.host_port.store(port as u64, Ordering::SeqCst);
    }

    pub fn device(&self) -> i64 {
        self.device.load(Ordering::SeqCst)
    }

    pub fn set_device(&self, device: i64) {
        self.device.store(device, Ordering::SeqCst);
    }

    /// Bump the connection counter and stamp `last_activity`, in that order
    /// relative to callers: `last_activity` is always written before the
    /// increment becomes visible, so a concurrent idle-reaper can never
    /// observe `connections == 0` together with a stale timestamp.
    pub fn begin_request(&self) {
        *self.last_activity.write() = Instant::now();
        self.connections.increment();
    }

    /// Guaranteed-on-exit decrement; call from a `scopeguard::guard` so it
    /// runs on every exit path (success, cancellation, panic).
    pub fn end_request(&self) {
        self.connections.decrement();
    }

    pub fn stamp_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().elapsed()
    }

    pub fn is_idle(&self) -> bool {
        self.connections.get() == 0
            && self.idle_for() >= std::time::Duration::from_secs(self.config.idle_timeout)
    }

    pub fn record_ram(&self, bytes: u64) {
        self.ram.store(bytes, Ordering::SeqCst);
        bump_peak(&self.peak_ram, bytes);
    }

    pub fn record_vram(&self, bytes: u64) {
        self.vram.store(bytes, Ordering::SeqCst);
        bump_peak(&self.peak_vram, bytes);
    }

    pub fn record_boot_time(&self, seconds: f64) {
        *self.boot_time.write() = seconds;
        let mut peak = self.peak_boot_time.write();
        if seconds > *peak {
            *peak = seconds;
        }
    }

    pub fn reserved_ram(&self) -> u64 {
        let current = self.ram.load(Ordering::SeqCst);
        let configured = self.config.max_ram_bytes().ok().flatten().unwrap_or(0);
        current.max(configured)
    }

    pub fn reserved_vram(&self) -> u64 {
        let current = self.vram.load(Ordering::SeqCst);
        let configured = self.config.max_vram_bytes().ok().flatten().unwrap_or(0);
        current.max(configured)
    }

    /// Current eviction cost, per §4.5's `shutdown_cost` formula.
    pub fn shutdown_cost(&self) -> f64 {
        crate::allocator::shutdown_cost(
            *self.boot_time.read(),
            self.ram.load(Ordering::SeqCst),
            self.vram.load(Ordering::SeqCst),
            self.idle_for().as_secs_f64(),
            self.config.idle_timeout as f64,
            self.connections.get(),
            self.config.use_gpu,
        )
    }
}

fn bump_peak(peak: &AtomicU64, value: u64) {
    let mut current = peak.load(Ordering::SeqCst);
    while value > current {
        match peak.compare_exchange_weak(current, value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}
