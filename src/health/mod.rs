//! Health Prober (§4.3): idempotent, side-effect-free liveness check
//! dispatched by a service's configured `health_check_type`.

use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::runtime::ContainerRuntime;
use crate::service::{HealthCheckType, Service};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HealthProber {
    http: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("building the health-check http client never fails"),
        }
    }

    pub async fn probe(&self, service: &Service, runtime: &dyn ContainerRuntime) -> bool {
        match service.config.health_check_type {
            HealthCheckType::None => true,
            HealthCheckType::Http => self.probe_http(service).await,
            HealthCheckType::Log => self.probe_log(service, runtime).await,
        }
    }

    async fn probe_http(&self, service: &Service) -> bool {
        let url = format!(
            "http://127.0.0.1:{}/{}",
            service.host_port(),
            service.config.health_check_url.trim_start_matches('/')
        );

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("health check request to {} failed: {}", url, e);
                return false;
            }
        };

        let Some(pattern) = &service.config.health_check_regex else {
            // Reaching the service at all, regardless of status code, counts
            // as healthy when no regex is configured.
            return true;
        };

        let Ok(regex) = Regex::new(pattern) else {
            return false;
        };
        let body = match response.text().await {
            Ok(body) => body,
            Err(_) => return false,
        };
        regex.is_match(&body)
    }

    async fn probe_log(&self, service: &Service, runtime: &dyn ContainerRuntime) -> bool {
        let Some(id) = service.container_id.read().clone() else {
            return false;
        };
        let logs = match runtime.logs(&id).await {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let text = String::from_utf8_lossy(&logs);

        match &service.config.health_check_regex {
            None => !text.is_empty(),
            Some(pattern) => match Regex::new(pattern) {
                Ok(regex) => regex.is_match(&text),
                Err(_) => false,
            },
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceConfig;

    fn config(health_check_type: HealthCheckType) -> ServiceConfig {
        ServiceConfig {
            name: "svc".into(),
            image: "example/image".into(),
            max_ram: None,
            max_vram: None,
            use_cpu: true,
            use_gpu: false,
            max_boot_time: 60,
            idle_timeout: 60,
            health_check_type,
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
    async fn none_check_type_is_always_healthy() {
        let prober = HealthProber::new();
        let service = Service::new(config(HealthCheckType::None));
        struct Unused;
        #[async_trait::async_trait]
        impl ContainerRuntime for Unused {
            async fn get(
                &self,
                _name: &str,
            ) -> crate::runtime::RuntimeResult<Option<crate::runtime::ContainerRecord>> {
                unreachable!()
            }
            async fn list_all(
                &self,
            ) -> crate::runtime::RuntimeResult<Vec<crate::runtime::ContainerRecord>> {
                unreachable!()
            }
            async fn create(
                &self,
                _spec: &crate::runtime::ContainerSpec,
            ) -> crate::runtime::RuntimeResult<String> {
                unreachable!()
            }
            async fn start(&self, _id: &str) -> crate::runtime::RuntimeResult<()> {
                unreachable!()
            }
            async fn stop(&self, _id: &str) -> crate::runtime::RuntimeResult<()> {
                unreachable!()
            }
            async fn remove(&self, _name: &str, _force: bool) -> crate::runtime::RuntimeResult<()> {
                unreachable!()
            }
            async fn logs(&self, _id: &str) -> crate::runtime::RuntimeResult<Vec<u8>> {
                unreachable!()
            }
        }
        assert!(prober.probe(&service, &Unused).await);
    }

    #[tokio::test]
    async fn http_check_with_unreachable_port_is_unhealthy() {
        let prober = HealthProber::new();
        let service = Service::new(config(HealthCheckType::Http));
        service.set_host_port(1); // reserved, nothing listens here
        struct Unused;
        #[async_trait::async_trait]
        impl ContainerRuntime for Unused {
            async fn get(
                &self,
                _name: &str,
            ) -> crate::runtime::RuntimeResult<Option<crate::runtime::ContainerRecord>> {
                unreachable!()
            }
            async fn list_all(
                &self,
            ) -> crate::runtime::RuntimeResult<Vec<crate::runtime::ContainerRecord>> {
                unreachable!()
            }
            async fn create(
                &self,
                _spec: &crate::runtime::ContainerSpec,
            ) -> crate::runtime::RuntimeResult<String> {
                unreachable!()
            }
            async fn start(&self, _id: &str) -> crate::runtime::RuntimeResult<()> {
                unreachable!()
            }
            async fn stop(&self, _id: &str) -> crate::runtime::RuntimeResult<()> {
                unreachable!()
            }
            async fn remove(&self, _name: &str, _force: bool) -> crate::runtime::RuntimeResult<()> {
                unreachable!()
            }
            async fn logs(&self, _id: &str) -> crate::runtime::RuntimeResult<Vec<u8>> {
                unreachable!()
            }
        }
        assert!(!prober.probe(&service, &Unused).await);
    }
}
