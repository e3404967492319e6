//! `bollard`-backed `ContainerRuntime`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{DeviceRequest, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{
    ContainerRecord, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError, RuntimeResult,
};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(socket: &str) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }

    fn container_to_record(
        name_hint: &str,
        container: &bollard::models::ContainerSummary,
    ) -> ContainerRecord {
        let id = container.id.clone().unwrap_or_default();
        let name = container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name_hint.to_string());
        let state = container
            .state
            .as_deref()
            .map(ContainerState::from_status_string)
            .unwrap_or(ContainerState::Other);
        ContainerRecord {
            id,
            name,
            state,
            root_pid: None,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn get(&self, name: &str) -> RuntimeResult<Option<ContainerRecord>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        let found = containers
            .iter()
            .find(|c| {
                c.names
                    .as_ref()
                    .map(|names| names.iter().any(|n| n.trim_start_matches('/') == name))
                    .unwrap_or(false)
            })
            .map(|c| Self::container_to_record(name, c));

        if let Some(mut record) = found {
            if let Ok(inspect) = self.docker.inspect_container(&record.id, None).await {
                record.root_pid = inspect.state.and_then(|s| s.pid).map(|p| p as i64);
            }
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    async fn list_all(&self) -> RuntimeResult<Vec<ContainerRecord>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .iter()
            .map(|c| Self::container_to_record("", c))
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let env_vars: Vec<String> = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for (container_port, host_port) in &spec.port_bindings {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(if m.is_volume {
                    MountTypeEnum::VOLUME
                } else {
                    MountTypeEnum::BIND
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let device_requests = if spec.device_requests.is_empty() {
            None
        } else {
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(
                    spec.device_requests
                        .iter()
                        .map(|d| d.to_string())
                        .collect(),
                ),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        };

        let mut labels = HashMap::new();
        labels.insert("ServiceOrchestrator".to_string(), "true".to_string());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            memory: spec.memory_limit_bytes.map(|m| m as i64),
            cpuset_cpus: spec.cpuset_cpus.clone(),
            device_requests,
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: Some(spec.network.clone()),
            dns: Some(spec.dns.clone()),
            pids_limit: spec.pids_limit,
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(bollard::models::RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec
                .invocation
                .as_deref()
                .map(|inv| shell_words::split(inv))
                .transpose()
                .map_err(|e| RuntimeError::Engine(bollard::errors::Error::IOError {
                    err: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
                }))?,
            env: Some(env_vars),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let result = self.docker.create_container(Some(options), config).await?;
        info!("created container {} ({})", spec.name, result.id);
        Ok(result.id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 30 }))
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(_) => {
                debug!("removed container {}", name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => {
                warn!("failed to remove container {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    async fn logs(&self, id: &str) -> RuntimeResult<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "1000".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => buf.extend_from_slice(&output.into_bytes()),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(RuntimeError::NotFound(id.to_string())),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }
}
