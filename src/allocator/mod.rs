//! Allocator (§4.5): pure placement and eviction-selection logic.
//!
//! Takes a snapshot of system/service memory state and decides which device
//! a new service should run on, and which already-running services must be
//! stopped first to make room. No I/O, no locking — the Lifecycle Controller
//! owns the registry mutex and actually calls `stop` on the returned names.

use std::collections::HashMap;

use crate::error::OrchestratorError;

/// CPU pseudo-device id used throughout the core.
pub const CPU_DEVICE: i64 = -1;

/// A currently live (non-stopped) service, reduced to what the allocator
/// needs to rank and cost it for eviction.
#[derive(Debug, Clone)]
pub struct LiveService {
    pub name: String,
    pub device: i64,
    /// Current instantaneous RAM/VRAM usage, used to compute `system_usage`
    /// (memory on the device not attributable to any known service).
    pub ram: u64,
    pub vram: u64,
    /// `max(current, configured max)` — what the device must hold aside for
    /// this service, and what's returned to the free budget if it's evicted.
    pub reserved_ram: u64,
    pub reserved_vram: u64,
    pub shutdown_cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub use_cpu: bool,
    pub use_gpu: bool,
    pub required_ram: u64,
    pub required_vram: u64,
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub device: i64,
    /// Names of services to stop, in the order they should be stopped.
    pub evict: Vec<String>,
}

/// The instantaneous cost of evicting a live service, smallest-cost-first.
///
/// The numerator favors evicting fast-to-restart services; the denominator
/// (with a 100MB floor) penalizes evicting memory-heavy ones; the idle
/// factor tapers to zero as a service nears its idle deadline; an active
/// connection imposes a hard 10x multiplier; GPU-only services cost twice
/// as much to evict as CPU-capable ones. `allocate`'s own CPU-device bias
/// (`eviction_cpu_penalty`, configurable) is layered on top of this per-device.
pub fn shutdown_cost(
    boot_time: f64,
    ram: u64,
    vram: u64,
    idle_time: f64,
    idle_timeout: f64,
    connections: u64,
    use_gpu: bool,
) -> f64 {
    let idle_timeout = idle_timeout.max(f64::EPSILON);
    let idle_factor = (1.0 - idle_time / idle_timeout).max(0.0).powi(2);
    let connection_factor = if connections > 0 { 10.0 } else { 1.0 };
    let gpu_factor = if use_gpu { 1.0 } else { 0.5 };

    boot_time.max(1.0) / (vram as f64 + ram as f64 * 0.25 + 1e8) * idle_factor * connection_factor
        * gpu_factor
}

/// Usage on a device not attributable to any known live service.
fn system_usage(total_used: u64, current_usage_by_services: u64) -> u64 {
    total_used.saturating_sub(current_usage_by_services)
}

pub fn allocate(
    system_ram_used: u64,
    system_ram_total: u64,
    gpu_used: &HashMap<i64, u64>,
    gpu_total: &HashMap<i64, u64>,
    live: &[LiveService],
    request: &AllocationRequest,
    eviction_cpu_penalty: f64,
) -> Result<Allocation, OrchestratorError> {
    let cpu_current: u64 = live
        .iter()
        .filter(|s| s.device == CPU_DEVICE)
        .map(|s| s.ram)
        .sum();
    let cpu_reserved: u64 = live
        .iter()
        .filter(|s| s.device == CPU_DEVICE)
        .map(|s| s.reserved_ram)
        .sum();
    let cpu_usage = system_usage(system_ram_used, cpu_current);

    let mut gpu_usage = HashMap::new();
    let mut gpu_reserved: HashMap<i64, u64> = HashMap::new();
    for (&gpu, &used) in gpu_used {
        let vram_current: u64 = live
            .iter()
            .filter(|s| s.device == gpu)
            .map(|s| s.vram)
            .sum();
        gpu_usage.insert(gpu, system_usage(used, vram_current));
        gpu_reserved.insert(
            gpu,
            live.iter()
                .filter(|s| s.device == gpu)
                .map(|s| s.reserved_vram)
                .sum(),
        );
    }

    let mut valid_devices: Vec<i64> = Vec::new();
    if request.use_gpu {
        for (&gpu, &total) in gpu_total {
            let usage = gpu_usage.get(&gpu).copied().unwrap_or(0);
            if total.saturating_sub(usage) >= request.required_vram {
                valid_devices.push(gpu);
            }
        }
    }
    if request.use_cpu && system_ram_total.saturating_sub(cpu_usage) >= request.required_ram {
        valid_devices.push(CPU_DEVICE);
    }

    if valid_devices.is_empty() {
        return Err(OrchestratorError::ResourceExhausted(
            "no device has sufficient free capacity".to_string(),
        ));
    }

    let mut costs: HashMap<i64, f64> = HashMap::new();
    let mut eviction_sets: HashMap<i64, Vec<String>> = HashMap::new();

    for &device in &valid_devices {
        // free budget = total - system_usage - allocated_memory, where
        // allocated_memory is what's already reserved by this device's live
        // services; evicting a candidate returns its reserved share to it.
        let free_ram = system_ram_total
            .saturating_sub(cpu_usage)
            .saturating_sub(cpu_reserved);
        let free_vram = if device == CPU_DEVICE {
            0
        } else {
            gpu_total
                .get(&device)
                .copied()
                .unwrap_or(0)
                .saturating_sub(gpu_usage.get(&device).copied().unwrap_or(0))
                .saturating_sub(gpu_reserved.get(&device).copied().unwrap_or(0))
        };

        let mut candidates: Vec<&LiveService> =
            live.iter().filter(|s| s.device == device).collect();
        candidates.sort_by(|a, b| {
            a.shutdown_cost
                .partial_cmp(&b.shutdown_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut acc_ram = 0u64;
        let mut acc_vram = 0u64;
        let mut cost = 0.0;
        let mut evict = Vec::new();

        for service in candidates {
            let ram_satisfied = free_ram + acc_ram >= request.required_ram;
            let vram_satisfied = free_vram + acc_vram >= request.required_vram;
            if ram_satisfied && vram_satisfied {
                break;
            }
            acc_ram += service.reserved_ram;
            acc_vram += service.reserved_vram;
            cost += service.shutdown_cost;
            evict.push(service.name.clone());
        }

        costs.insert(device, cost);
        eviction_sets.insert(device, evict);
    }

    if let Some(cpu_cost) = costs.get_mut(&CPU_DEVICE) {
        *cpu_cost += eviction_cpu_penalty;
    }

    let smallest = valid_devices
        .iter()
        .map(|d| costs[d])
        .fold(f64::INFINITY, f64::min);

    let chosen = valid_devices
        .into_iter()
        .find(|d| costs[d] == smallest)
        .expect("valid_devices is non-empty");

    Ok(Allocation {
        device: chosen,
        evict: eviction_sets.remove(&chosen).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(name: &str, device: i64, reserved_ram: u64, reserved_vram: u64, cost: f64) -> LiveService {
        LiveService {
            name: name.to_string(),
            device,
            ram: reserved_ram,
            vram: reserved_vram,
            reserved_ram,
            reserved_vram,
            shutdown_cost: cost,
        }
    }

    #[test]
    fn picks_cpu_when_enough_free_ram_and_no_gpu_requested() {
        let request = AllocationRequest {
            use_cpu: true,
            use_gpu: false,
            required_ram: 1_000,
            required_vram: 0,
        };
        let allocation =
            allocate(0, 10_000, &HashMap::new(), &HashMap::new(), &[], &request, 1_000_000.0).unwrap();
        assert_eq!(allocation.device, CPU_DEVICE);
        assert!(allocation.evict.is_empty());
    }

    #[test]
    fn fails_with_resource_exhausted_when_nothing_fits() {
        let request = AllocationRequest {
            use_cpu: true,
            use_gpu: false,
            required_ram: 1_000_000,
            required_vram: 0,
        };
        let err = allocate(900, 1_000, &HashMap::new(), &HashMap::new(), &[], &request, 1_000_000.0)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted(_)));
    }

    #[test]
    fn gpu_is_preferred_over_cpu_at_equal_cost() {
        let mut gpu_total = HashMap::new();
        gpu_total.insert(0, 10_000);
        let mut gpu_used = HashMap::new();
        gpu_used.insert(0, 0);

        let request = AllocationRequest {
            use_cpu: true,
            use_gpu: true,
            required_ram: 100,
            required_vram: 100,
        };
        let allocation = allocate(0, 10_000, &gpu_used, &gpu_total, &[], &request, 1_000_000.0).unwrap();
        assert_eq!(allocation.device, 0);
    }

    #[test]
    fn evicts_cheapest_service_first_to_free_required_ram() {
        let live_services = vec![
            live("expensive", CPU_DEVICE, 500, 0, 50.0),
            live("cheap", CPU_DEVICE, 500, 0, 1.0),
        ];
        let request = AllocationRequest {
            use_cpu: true,
            use_gpu: false,
            required_ram: 1_700,
            required_vram: 0,
        };
        // total 2000, used 1200 (1000 of it the two services' own current ram,
        // 200 a non-service baseline) -> system_usage 200, allocated_memory
        // 1000, free 800. Evicting "cheap" alone only returns to 1300; both
        // are needed to clear 1700.
        let allocation = allocate(
            1_200,
            2_000,
            &HashMap::new(),
            &HashMap::new(),
            &live_services,
            &request,
            1_000_000.0,
        )
        .unwrap();
        assert_eq!(allocation.evict, vec!["cheap", "expensive"]);
    }
}
