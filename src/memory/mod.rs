//! Memory Probe (§4.1): host/GPU memory and per-process RSS/VRAM, each
//! snapshot cached for a configurable TTL so a burst of allocator calls
//! costs one real read.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryInfo {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

struct Cached<T> {
    value: T,
    ttl: Duration,
    at: Instant,
}

impl<T: Clone + Default> Cached<T> {
    fn fresh(ttl: Duration) -> Self {
        Self {
            value: T::default(),
            ttl,
            at: Instant::now() - ttl - Duration::from_secs(1),
        }
    }

    fn get_or_refresh(&mut self, refresh: impl FnOnce() -> T) -> T {
        if self.at.elapsed() >= self.ttl {
            self.value = refresh();
            self.at = Instant::now();
        }
        self.value.clone()
    }
}

/// Polls host RAM, GPU VRAM (via NVML, when present) and per-process memory.
///
/// All reads are best-effort: a process that disappears mid-scan or a GPU
/// whose NVML handle errors is simply omitted from the result, never
/// propagated as an error (§4.1).
pub struct MemoryProbe {
    system: Mutex<System>,
    nvml: Option<nvml_wrapper::Nvml>,

    system_ram_cache: Mutex<Cached<MemoryInfo>>,
    system_vram_cache: Mutex<Cached<HashMap<u32, MemoryInfo>>>,
    process_ram_cache: Mutex<Cached<HashMap<i64, u64>>>,
    process_vram_cache: Mutex<Cached<HashMap<i64, u64>>>,
}

impl MemoryProbe {
    pub fn new(cache_ttl: Duration) -> Self {
        let nvml = match nvml_wrapper::Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                warn!("NVML unavailable, GPU services are disabled: {}", e);
                None
            }
        };

        Self {
            system: Mutex::new(System::new()),
            nvml,
            system_ram_cache: Mutex::new(Cached::fresh(cache_ttl)),
            system_vram_cache: Mutex::new(Cached::fresh(cache_ttl)),
            process_ram_cache: Mutex::new(Cached::fresh(cache_ttl)),
            process_vram_cache: Mutex::new(Cached::fresh(cache_ttl)),
        }
    }

    pub fn has_gpu(&self) -> bool {
        self.nvml.is_some()
    }

    pub fn system_ram(&self) -> MemoryInfo {
        self.system_ram_cache.lock().unwrap().get_or_refresh(|| {
            let mut system = self.system.lock().unwrap();
            system.refresh_memory();
            MemoryInfo {
                free: system.available_memory(),
                used: system.used_memory(),
                total: system.total_memory(),
            }
        })
    }

    pub fn system_vram(&self) -> HashMap<u32, MemoryInfo> {
        self.system_vram_cache
            .lock()
            .unwrap()
            .get_or_refresh(|| self.read_system_vram())
    }

    fn read_system_vram(&self) -> HashMap<u32, MemoryInfo> {
        let Some(nvml) = &self.nvml else {
            return HashMap::new();
        };
        let count = match nvml.device_count() {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to enumerate GPUs: {}", e);
                return HashMap::new();
            }
        };

        let mut devices = HashMap::new();
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            let Ok(info) = device.memory_info() else {
                continue;
            };
            devices.insert(
                index,
                MemoryInfo {
                    free: info.free,
                    used: info.used,
                    total: info.total,
                },
            );
        }
        devices
    }

    pub fn process_ram(&self) -> HashMap<i64, u64> {
        self.process_ram_cache.lock().unwrap().get_or_refresh(|| {
            let mut system = self.system.lock().unwrap();
            system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
            system
                .processes()
                .iter()
                .map(|(pid, process)| (pid.as_u32() as i64, process.memory()))
                .collect()
        })
    }

    pub fn process_vram(&self) -> HashMap<i64, u64> {
        self.process_vram_cache
            .lock()
            .unwrap()
            .get_or_refresh(|| self.read_process_vram())
    }

    fn read_process_vram(&self) -> HashMap<i64, u64> {
        let Some(nvml) = &self.nvml else {
            return HashMap::new();
        };
        let count = match nvml.device_count() {
            Ok(c) => c,
            Err(_) => return HashMap::new(),
        };

        let mut usage = HashMap::new();
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            if let Ok(procs) = device.running_compute_processes() {
                for proc in procs {
                    if let nvml_wrapper::enums::device::UsedGpuMemory::Used(bytes) =
                        proc.used_gpu_memory
                    {
                        usage.insert(proc.pid as i64, bytes);
                    }
                }
            }
        }
        usage
    }

    /// All descendant pids of `pid`, recursively.
    pub fn children_of(&self, pid: i64) -> Vec<i64> {
        if pid < 0 {
            return Vec::new();
        }
        let mut system = self.system.lock().unwrap();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid as u32);
        let mut children = Vec::new();
        let mut frontier = vec![root];
        while let Some(current) = frontier.pop() {
            for (candidate_pid, process) in system.processes() {
                if process.parent() == Some(current) {
                    children.push(candidate_pid.as_u32() as i64);
                    frontier.push(*candidate_pid);
                }
            }
        }
        children
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
