//! Container Runtime Adapter: a thin, typed wrapper over the container
//! engine. The rest of the daemon never talks to `bollard` directly.

mod docker;

pub use docker::DockerRuntime;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Normalized container status, independent of the engine's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Restarting,
    Created,
    Exited,
    Other,
}

impl ContainerState {
    pub fn from_status_string(status: &str) -> Self {
        match status {
            "running" => ContainerState::Running,
            "restarting" => ContainerState::Restarting,
            "created" => ContainerState::Created,
            "exited" | "dead" => ContainerState::Exited,
            _ => ContainerState::Other,
        }
    }

    /// States the Monitor Loop accepts as "still legitimately starting".
    pub fn is_starting_compatible(self) -> bool {
        matches!(
            self,
            ContainerState::Running | ContainerState::Restarting | ContainerState::Created
        )
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub root_pid: Option<i64>,
}

/// A mount to bind or create as a named volume inside the container.
#[derive(Debug, Clone)]
pub struct MountBinding {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub is_volume: bool,
}

/// Everything needed to create a container for one service start attempt.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub invocation: Option<String>,
    pub memory_limit_bytes: Option<u64>,
    pub cpuset_cpus: Option<String>,
    /// container_port -> host_port
    pub port_bindings: HashMap<u16, u16>,
    /// GPU device indices to request, empty for CPU-only.
    pub device_requests: Vec<i64>,
    pub mounts: Vec<MountBinding>,
    pub environment: HashMap<String, String>,
    pub network: String,
    pub dns: Vec<String>,
    pub pids_limit: Option<i64>,
}

/// The capabilities the core consumes from the container engine (§4.2).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn get(&self, name: &str) -> RuntimeResult<Option<ContainerRecord>>;
    async fn list_all(&self) -> RuntimeResult<Vec<ContainerRecord>>;
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;
    async fn start(&self, id: &str) -> RuntimeResult<()>;
    async fn stop(&self, id: &str) -> RuntimeResult<()>;
    async fn remove(&self, name: &str, force: bool) -> RuntimeResult<()>;
    async fn logs(&self, id: &str) -> RuntimeResult<Vec<u8>>;
}
