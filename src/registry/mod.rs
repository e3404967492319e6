//! Service Registry (§4.4): the concurrent map of configured services, kept
//! in sync with an external Catalog.

mod catalog;

pub use catalog::{Catalog, FileCatalog};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::error::Result;
use crate::runtime::ContainerRuntime;
use crate::service::Service;

/// Concurrent `name -> Service` map. Reads (lookup) never block; structural
/// mutation (insert/remove during `refresh`) is serialized by `mutations`.
pub struct Registry {
    services: DashMap<String, Arc<Service>>,
    catalog: Box<dyn Catalog>,
    runtime: Arc<dyn ContainerRuntime>,
    mutations: AsyncMutex<()>,
}

impl Registry {
    pub fn new(catalog: Box<dyn Catalog>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            services: DashMap::new(),
            catalog,
            runtime,
            mutations: AsyncMutex::new(()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    pub fn iter(&self) -> Vec<Arc<Service>> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// Reconciles the registry against the Catalog (§4.4):
    /// 1. registered names absent from the catalog are stopped and dropped.
    /// 2. catalog names absent from the registry are instantiated STOPPED.
    pub async fn refresh(&self) -> Result<()> {
        let desired = self.catalog.list().await?;
        let _guard = self.mutations.lock().await;

        let desired_names: std::collections::HashSet<String> =
            desired.iter().map(|c| c.name.clone()).collect();

        let stale: Vec<String> = self
            .services
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !desired_names.contains(name))
            .collect();

        for name in stale {
            if let Some((_, service)) = self.services.remove(&name) {
                info!("service {} removed from catalog, stopping", name);
                if let Some(id) = service.container_id.read().clone() {
                    let _ = self.runtime.stop(&id).await;
                    let _ = self.runtime.remove(&service.container_name, true).await;
                }
            }
        }

        for config in desired {
            if !self.services.contains_key(&config.name) {
                let name = config.name.clone();
                self.services.insert(name.clone(), Arc::new(Service::new(config)));
                info!("service {} registered", name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRecord, ContainerSpec, RuntimeResult};
    use async_trait::async_trait;

    struct NoopRuntime;

    #[async_trait]
    impl ContainerRuntime for NoopRuntime {
        async fn get(&self, _name: &str) -> RuntimeResult<Option<ContainerRecord>> {
            Ok(None)
        }
        async fn list_all(&self) -> RuntimeResult<Vec<ContainerRecord>> {
            Ok(vec![])
        }
        async fn create(&self, _spec: &ContainerSpec) -> RuntimeResult<String> {
            Ok("fake-id".to_string())
        }
        async fn start(&self, _id: &str) -> RuntimeResult<()> {
            Ok(())
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

    struct StaticCatalog(Vec<crate::service::ServiceConfig>);

    #[async_trait]
    impl Catalog for StaticCatalog {
        async fn list(&self) -> Result<Vec<crate::service::ServiceConfig>> {
            Ok(self.0.clone())
        }
    }

    fn config(name: &str) -> crate::service::ServiceConfig {
        crate::service::ServiceConfig {
            name: name.to_string(),
            image: "example/image".into(),
            max_ram: None,
            max_vram: None,
            use_cpu: true,
            use_gpu: false,
            max_boot_time: 60,
            idle_timeout: 60,
            health_check_type: crate::service::HealthCheckType::None,
            health_check_url: String::new(),
            health_check_regex: None,
            port: 8000,
            mounts: vec![],
            environment: vec![],
            cpuset_cpus: None,
            permission_group: None,
        }
    }

    #[tokio::test]
    async fn refresh_adds_new_catalog_entries() {
        let catalog = Box::new(StaticCatalog(vec![config("svc-a")]));
        let registry = Registry::new(catalog, Arc::new(NoopRuntime));
        registry.refresh().await.unwrap();
        assert!(registry.get("svc-a").is_some());
    }

    #[tokio::test]
    async fn refresh_drops_services_no_longer_in_the_catalog() {
        let catalog = Box::new(StaticCatalog(vec![config("svc-a")]));
        let registry = Registry::new(catalog, Arc::new(NoopRuntime));
        registry.refresh().await.unwrap();

        let catalog = Box::new(StaticCatalog(vec![]));
        let registry = Registry {
            services: registry.services,
            catalog,
            runtime: registry.runtime,
            mutations: AsyncMutex::new(()),
        };
        registry.refresh().await.unwrap();
        assert!(registry.get("svc-a").is_none());
    }
}
