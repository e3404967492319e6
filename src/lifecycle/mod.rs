//! Lifecycle Controller (§4.6): drives a Service between STOPPED, STARTING,
//! RUNNING and STOPPING, invoking the Allocator and Container Runtime
//! Adapter along the way.

mod port;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::allocator::{self, AllocationRequest, LiveService};
use crate::config::{Configuration, DockerConfiguration};
use crate::error::{OrchestratorError, Result};
use crate::health::HealthProber;
use crate::memory::MemoryProbe;
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, ContainerSpec, MountBinding};
use crate::service::{volume_name, MountSpec, Service, Status};

pub struct LifecycleController {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    health: Arc<HealthProber>,
    memory: Arc<MemoryProbe>,
    docker: DockerConfiguration,
    health_poll_interval: Duration,
    eviction_cpu_penalty: f64,
    /// Serializes port-choice-to-container-create across concurrently
    /// starting services: `find_unused_port` releases its bind-test
    /// immediately, so two starts racing without this would be free to
    /// pick the same "free" host port (§5).
    port_selection: AsyncMutex<()>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        health: Arc<HealthProber>,
        memory: Arc<MemoryProbe>,
        config: &Configuration,
    ) -> Self {
        Self {
            registry,
            runtime,
            health,
            memory,
            docker: config.docker.clone(),
            health_poll_interval: Duration::from_millis(config.scheduler.health_poll_interval_ms),
            eviction_cpu_penalty: config.scheduler.eviction_cpu_penalty,
            port_selection: AsyncMutex::new(()),
        }
    }

    pub async fn ensure_running(&self, name: &str) -> Result<()> {
        let service = self
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;

        loop {
            match service.status.get() {
                Status::Running => return Ok(()),
                Status::Starting => {
                    self.wait_for(&service, |s| s != Status::Starting, service.config.max_boot_time)
                        .await;
                    return Ok(());
                }
                Status::Stopping => {
                    self.wait_for_unbounded(&service, Status::Stopped).await;
                    continue;
                }
                Status::Stopped => {
                    if service.status.try_transition(Status::Stopped, Status::Starting) {
                        return self.start(&service).await;
                    }
                    // Lost the race; loop and observe whatever the winner left behind.
                }
            }
        }
    }

    async fn start(&self, service: &Arc<Service>) -> Result<()> {
        let required_ram = service
            .config
            .max_ram_bytes()?
            .unwrap_or_else(|| service.peak_ram.load(std::sync::atomic::Ordering::SeqCst).max(1));
        let required_vram = service
            .config
            .max_vram_bytes()?
            .unwrap_or_else(|| service.peak_vram.load(std::sync::atomic::Ordering::SeqCst));

        let allocation = match self.resolve_device(service, required_ram, required_vram).await {
            Ok(allocation) => allocation,
            Err(e) => {
                service.status.set(Status::Stopped);
                return Err(e);
            }
        };

        for victim_name in &allocation.evict {
            if victim_name == service.name() {
                continue;
            }
            if let Some(victim) = self.registry.get(victim_name) {
                self.stop(&victim).await;
            }
        }

        service.set_device(allocation.device);

        let started = Instant::now();
        if let Err(e) = self.create_and_start(service, allocation.device).await {
            service.status.set(Status::Stopped);
            return Err(e);
        }

        let healthy = self.poll_health(service).await;
        let boot_time = started.elapsed().as_secs_f64();

        if healthy {
            service.record_boot_time(boot_time);
            if boot_time > service.config.max_boot_time as f64 {
                warn!(
                    "service {} took {:.1}s to boot, exceeding its {}s budget",
                    service.name(),
                    boot_time,
                    service.config.max_boot_time
                );
            }
            service.status.set(Status::Running);
            info!("service {} is running", service.name());
            Ok(())
        } else {
            warn!(
                "service {} did not become healthy within {}s, leaving it for reconciliation",
                service.name(),
                service.config.max_boot_time
            );
            // Left as STARTING: the Monitor Loop reconciles on its next tick.
            Err(OrchestratorError::BootTimeout)
        }
    }

    async fn resolve_device(
        &self,
        service: &Arc<Service>,
        required_ram: u64,
        required_vram: u64,
    ) -> Result<allocator::Allocation> {
        let system_ram = self.memory.system_ram();
        let system_vram = self.memory.system_vram();

        let gpu_used: HashMap<i64, u64> = system_vram
            .iter()
            .map(|(&id, info)| (id as i64, info.used))
            .collect();
        let gpu_total: HashMap<i64, u64> = system_vram
            .iter()
            .map(|(&id, info)| (id as i64, info.total))
            .collect();

        let live: Vec<LiveService> = self
            .registry
            .iter()
            .into_iter()
            .filter(|s| s.name() != service.name() && s.status.get() != Status::Stopped)
            .map(|s| LiveService {
                name: s.name().to_string(),
                device: s.device(),
                ram: s.ram.load(std::sync::atomic::Ordering::SeqCst),
                vram: s.vram.load(std::sync::atomic::Ordering::SeqCst),
                reserved_ram: s.reserved_ram(),
                reserved_vram: s.reserved_vram(),
                shutdown_cost: s.shutdown_cost(),
            })
            .collect();

        let request = AllocationRequest {
            use_cpu: service.config.use_cpu,
            use_gpu: service.config.use_gpu,
            required_ram,
            required_vram,
        };

        allocator::allocate(
            system_ram.used,
            system_ram.total,
            &gpu_used,
            &gpu_total,
            &live,
            &request,
            self.eviction_cpu_penalty,
        )
    }

    async fn create_and_start(&self, service: &Arc<Service>, device: i64) -> Result<()> {
        let container_name = service.container_name.clone();

        // Force-remove any stale container left over from a prior crash.
        self.runtime.remove(&container_name, true).await.ok();

        // Held from port choice through container create: `find_unused_port`
        // bind-tests and releases immediately, so a second concurrent start
        // is otherwise free to pick the same host port before this one's
        // container actually claims it.
        let _port_guard = self.port_selection.lock().await;
        let host_port = port::find_unused_port().await?;

        let mut mounts = Vec::new();
        for spec in service.config.parsed_mounts() {
            match spec {
                MountSpec::Bind {
                    source,
                    target,
                    read_only,
                } => mounts.push(MountBinding {
                    source,
                    target,
                    read_only,
                    is_volume: false,
                }),
                MountSpec::Volume { target } => mounts.push(MountBinding {
                    source: volume_name(&container_name, &target),
                    target,
                    read_only: false,
                    is_volume: true,
                }),
            }
        }

        let mut environment: HashMap<String, String> =
            service.config.parsed_environment().into_iter().collect();
        environment.entry("PORT".to_string()).or_insert_with(|| service.config.port.to_string());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(service.config.port, host_port);

        let spec = ContainerSpec {
            name: container_name.clone(),
            image: service.config.image.clone(),
            invocation: None,
            memory_limit_bytes: service.config.max_ram_bytes()?,
            cpuset_cpus: service.config.cpuset_cpus.clone(),
            port_bindings,
            device_requests: if device >= 0 { vec![device] } else { vec![] },
            mounts,
            environment,
            network: self.docker.network.clone(),
            dns: self.docker.dns.clone(),
            pids_limit: Some(self.docker.container_pid_limit),
        };

        let id = self.runtime.create(&spec).await.map_err(OrchestratorError::from)?;
        self.runtime.start(&id).await.map_err(OrchestratorError::from)?;

        *service.container_id.write() = Some(id.clone());
        service.set_host_port(host_port);

        if let Ok(Some(record)) = self.runtime.get(&container_name).await {
            service.set_pid(record.root_pid);
        }

        info!(
            "created container {} for service {} on device {} (host port {})",
            container_name,
            service.name(),
            device,
            host_port
        );

        Ok(())
    }

    async fn poll_health(&self, service: &Arc<Service>) -> bool {
        let deadline = Instant::now() + Duration::from_secs(service.config.max_boot_time);
        loop {
            if self.health.probe(service, self.runtime.as_ref()).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.health_poll_interval).await;
        }
    }

    pub async fn stop(&self, service: &Arc<Service>) {
        loop {
            match service.status.get() {
                Status::Stopping => {
                    self.wait_for_unbounded(service, Status::Stopped).await;
                    return;
                }
                Status::Starting => {
                    self.wait_for(
                        service,
                        |s| s != Status::Starting,
                        service.config.max_boot_time,
                    )
                    .await;
                    continue;
                }
                Status::Stopped => return,
                Status::Running => {
                    if service.status.try_transition(Status::Running, Status::Stopping) {
                        break;
                    }
                }
            }
        }

        while service.connections.get() > 0 {
            sleep(Duration::from_secs(1)).await;
        }

        if let Some(id) = service.container_id.read().clone() {
            if let Err(e) = self.runtime.stop(&id).await {
                warn!("failed to stop container for service {}: {}", service.name(), e);
            }
        }

        service.set_pid(None);
        service.status.set(Status::Stopped);
        info!("service {} stopped", service.name());
    }

    async fn wait_for(&self, service: &Arc<Service>, until: impl Fn(Status) -> bool, timeout_secs: u64) {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        while !until(service.status.get()) {
            if Instant::now() >= deadline {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn wait_for_unbounded(&self, service: &Arc<Service>, target: Status) {
        while service.status.get() != target {
            sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Catalog, Registry};
    use crate::runtime::{ContainerRecord, RuntimeResult};
    use crate::service::{HealthCheckType, ServiceConfig};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct UnreachableRuntime;

    #[async_trait::async_trait]
    impl ContainerRuntime for UnreachableRuntime {
        async fn get(&self, _name: &str) -> RuntimeResult<Option<ContainerRecord>> {
            unreachable!("this test's service never creates a container")
        }
        async fn list_all(&self) -> RuntimeResult<Vec<ContainerRecord>> {
            Ok(vec![])
        }
        async fn create(&self, _spec: &ContainerSpec) -> RuntimeResult<String> {
            unreachable!("this test's service never creates a container")
        }
        async fn start(&self, _id: &str) -> RuntimeResult<()> {
            unreachable!("this test's service never creates a container")
        }
        async fn stop(&self, _id: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn remove(&self, _name: &str, _force: bool) -> RuntimeResult<()> {
            Ok(())
        }
        async fn logs(&self, _id: &str) -> RuntimeResult<Vec<u8>> {
            Ok(vec![])
        }
    }

    /// Counts how many `stop` calls actually reached the container engine.
    struct CountingRuntime(AtomicUsize);

    #[async_trait::async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn get(&self, _name: &str) -> RuntimeResult<Option<ContainerRecord>> {
            Ok(None)
        }
        async fn list_all(&self) -> RuntimeResult<Vec<ContainerRecord>> {
            Ok(vec![])
        }
        async fn create(&self, _spec: &ContainerSpec) -> RuntimeResult<String> {
            unreachable!()
        }
        async fn start(&self, _id: &str) -> RuntimeResult<()> {
            unreachable!()
        }
        async fn stop(&self, _id: &str) -> RuntimeResult<()> {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        async fn remove(&self, _name: &str, _force: bool) -> RuntimeResult<()> {
            Ok(())
        }
        async fn logs(&self, _id: &str) -> RuntimeResult<Vec<u8>> {
            Ok(vec![])
        }
    }

    struct StaticCatalog(Vec<ServiceConfig>);

    #[async_trait::async_trait]
    impl Catalog for StaticCatalog {
        async fn list(&self) -> Result<Vec<ServiceConfig>> {
            Ok(self.0.clone())
        }
    }

    fn config(name: &str, use_cpu: bool, use_gpu: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            image: "example/image".into(),
            max_ram: None,
            max_vram: None,
            use_cpu,
            use_gpu,
            max_boot_time: 1,
            idle_timeout: 60,
            health_check_type: HealthCheckType::None,
            health_check_url: String::new(),
            health_check_regex: None,
            port: 8000,
            mounts: vec![],
            environment: vec![],
            cpuset_cpus: None,
            permission_group: None,
        }
    }

    /// Builds a controller over a registry pre-populated (via a real
    /// `refresh`) with one service, and returns the registry-owned handle
    /// so tests can mutate it in place before driving the lifecycle.
    async fn controller_with_service(
        runtime: Arc<dyn ContainerRuntime>,
        service_config: ServiceConfig,
    ) -> (LifecycleController, Arc<Service>) {
        let catalog = Box::new(StaticCatalog(vec![service_config]));
        let registry = Arc::new(Registry::new(catalog, runtime.clone()));
        registry.refresh().await.unwrap();
        let service = registry.iter().into_iter().next().unwrap();

        let health = Arc::new(HealthProber::new());
        let memory = Arc::new(MemoryProbe::default());
        let config: Configuration = toml::from_str("").unwrap();
        let lifecycle = LifecycleController::new(registry, runtime, health, memory, &config);
        (lifecycle, service)
    }

    #[tokio::test]
    async fn ensure_running_is_a_no_op_when_already_running() {
        let (lifecycle, service) =
            controller_with_service(Arc::new(UnreachableRuntime), config("svc", true, false)).await;
        service.status.set(Status::Running);

        lifecycle.ensure_running(service.name()).await.unwrap();
        assert_eq!(service.status.get(), Status::Running);
    }

    #[tokio::test]
    async fn start_fails_with_resource_exhausted_when_no_device_requested() {
        // Neither use_cpu nor use_gpu: the allocator has no valid device to
        // place this on, so `start` must fail before touching the runtime.
        let (lifecycle, service) =
            controller_with_service(Arc::new(UnreachableRuntime), config("svc", false, false))
                .await;

        let err = lifecycle.ensure_running(service.name()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted(_)));
        assert_eq!(service.status.get(), Status::Stopped);
    }

    #[tokio::test]
    async fn stop_on_an_already_stopped_service_never_touches_the_runtime() {
        let (lifecycle, service) =
            controller_with_service(Arc::new(UnreachableRuntime), config("svc", true, false)).await;

        lifecycle.stop(&service).await;
        assert_eq!(service.status.get(), Status::Stopped);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_connections_before_stopping_the_container() {
        let counting = Arc::new(CountingRuntime(AtomicUsize::new(0)));
        let (lifecycle, service) =
            controller_with_service(counting.clone(), config("svc", true, false)).await;
        service.status.set(Status::Running);
        *service.container_id.write() = Some("container-1".to_string());
        service.begin_request();

        let lifecycle = Arc::new(lifecycle);
        let stopper = {
            let lifecycle = lifecycle.clone();
            let service = service.clone();
            tokio::spawn(async move {
                lifecycle.stop(&service).await;
            })
        };

        // `stop` must still be draining; the container must not be stopped yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counting.0.load(AtomicOrdering::SeqCst), 0);

        service.end_request();
        stopper.await.unwrap();

        assert_eq!(counting.0.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(service.status.get(), Status::Stopped);
    }

    #[tokio::test]
    async fn only_one_concurrent_caller_actually_starts_a_stopped_service() {
        // Both callers race the STOPPED -> STARTING CAS; since this service
        // requests no device, both attempts fail allocation, but only the
        // CAS winner ever runs the allocation path at a time — verified by
        // the service ending up STOPPED with no panics or double-starts.
        let (lifecycle, service) =
            controller_with_service(Arc::new(UnreachableRuntime), config("svc", false, false))
                .await;
        let name = service.name().to_string();

        let (a, b) = tokio::join!(
            lifecycle.ensure_running(&name),
            lifecycle.ensure_running(&name)
        );
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(service.status.get(), Status::Stopped);
    }
}

