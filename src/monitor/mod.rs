//! Monitor Loop (§4.7): the single background worker that keeps the
//! registry in sync with the container engine and reaps idle services.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::lifecycle::LifecycleController;
use crate::memory::MemoryProbe;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;
use crate::service::{Service, Status};

pub struct MonitorLoop {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: Arc<LifecycleController>,
    memory: Arc<MemoryProbe>,
    tick_interval: Duration,
}

impl MonitorLoop {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: Arc<LifecycleController>,
        memory: Arc<MemoryProbe>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            registry,
            runtime,
            lifecycle,
            memory,
            tick_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("monitor loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        if let Err(e) = self.registry.refresh().await {
            error!("registry refresh failed, skipping the rest of this tick: {}", e);
            return;
        }

        self.reconcile_containers().await;
        self.attribute_memory().await;
        self.reap_idle().await;
    }

    async fn reconcile_containers(&self) {
        let containers = match self.runtime.list_all().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("failed to list containers this tick: {}", e);
                return;
            }
        };

        let services = self.registry.iter();
        let mut known_names = std::collections::HashSet::new();
        for service in &services {
            known_names.insert(service.container_name.clone());

            let found = containers.iter().find(|c| c.name == service.container_name);

            if let Some(container) = found {
                *service.container_id.write() = Some(container.id.clone());
                service.set_pid(container.root_pid);
            }

            match service.status.get() {
                Status::Starting
                    if found.map_or(true, |c| !c.state.is_starting_compatible()) =>
                {
                    warn!(
                        "service {} drifted out of a starting-compatible state, stopping",
                        service.name()
                    );
                    self.force_stop(service).await;
                }
                Status::Running
                    if found.map_or(true, |c| c.state != crate::runtime::ContainerState::Running) =>
                {
                    warn!(
                        "service {} is RUNNING but its container is {:?}, stopping",
                        service.name(),
                        found.map(|c| c.state)
                    );
                    self.force_stop(service).await;
                }
                Status::Stopped if found.is_some() => {
                    warn!(
                        "service {} is STOPPED but its container is still present, cleaning up",
                        service.name()
                    );
                    service.status.set(Status::Running);
                    self.lifecycle.stop(service).await;
                }
                _ => {}
            }
        }

        for container in &containers {
            if container.name.starts_with("ca_") && !known_names.contains(&container.name) {
                debug!("garbage-collecting orphaned container {}", container.name);
                let _ = self.runtime.remove(&container.name, true).await;
            }
        }
    }

    /// Unconditionally tears a service down regardless of its current status
    /// (§4.7's drift rules can observe a service stuck in STARTING or
    /// RUNNING whose container already vanished; `LifecycleController::stop`
    /// only knows how to wait out a STARTING service, not break it out of
    /// one, so reconciliation drives the container-stop and status reset
    /// itself).
    async fn force_stop(&self, service: &Arc<Service>) {
        if let Some(id) = service.container_id.read().clone() {
            if let Err(e) = self.runtime.stop(&id).await {
                warn!("failed to stop drifted container for service {}: {}", service.name(), e);
            }
        }
        service.set_pid(None);
        service.status.set(Status::Stopped);
    }

    async fn attribute_memory(&self) {
        for service in self.registry.iter() {
            let Some(pid) = service.pid() else { continue };

            let mut pids = self.memory.children_of(pid);
            pids.push(pid);

            let process_ram = self.memory.process_ram();
            let process_vram = self.memory.process_vram();

            let ram = pids
                .iter()
                .filter_map(|p| process_ram.get(p))
                .copied()
                .max()
                .unwrap_or(0);
            let vram: u64 = pids.iter().filter_map(|p| process_vram.get(p)).sum();

            service.record_ram(ram);
            service.record_vram(vram);

            if let Some(max_ram) = service.config.max_ram_bytes().ok().flatten() {
                if ram > max_ram {
                    warn!(
                        "service {} is using {} bytes of RAM, exceeding its {} byte budget",
                        service.name(),
                        ram,
                        max_ram
                    );
                }
            }
            if let Some(max_vram) = service.config.max_vram_bytes().ok().flatten() {
                if vram > max_vram {
                    warn!(
                        "service {} is using {} bytes of VRAM, exceeding its {} byte budget",
                        service.name(),
                        vram,
                        max_vram
                    );
                }
            }
        }
    }

    async fn reap_idle(&self) {
        for service in self.registry.iter() {
            if service.status.get() == Status::Running && service.is_idle() {
                debug!("reaping idle service {}", service.name());
                self.lifecycle.stop(&service).await;
            }
        }
    }
}
