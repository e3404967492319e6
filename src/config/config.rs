//! Configuration structures and loading

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// Docker configuration
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Monitor Loop and probe tuning
    #[serde(default)]
    pub scheduler: SchedulerConfiguration,

    /// File-backed service catalog
    #[serde(default)]
    pub catalog: CatalogConfiguration,

    /// Development-mode bearer-token auth stub
    #[serde(default)]
    pub auth: AuthConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, resolving any relative paths
    /// (catalog path) against the config file's own parent directory.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;

        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        if config.catalog.path.is_relative() {
            config.catalog.path = base_dir.join(&config.catalog.path);
        }

        Ok(config)
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: SslConfiguration,

    /// Proxy IPs allowed to set forwarded-for style headers.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            ssl: SslConfiguration::default(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

/// Docker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    #[serde(default = "default_network_name")]
    pub network: String,

    #[serde(default)]
    pub dns: Vec<String>,

    #[serde(default = "default_container_pid_limit")]
    pub container_pid_limit: i64,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            network: default_network_name(),
            dns: Vec::new(),
            container_pid_limit: default_container_pid_limit(),
        }
    }
}

fn default_docker_socket() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let colima_socket = std::path::Path::new(&home).join(".colima/default/docker.sock");
            if colima_socket.exists() {
                return format!("unix://{}", colima_socket.display());
            }

            let docker_desktop = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if docker_desktop.exists() {
                return format!("unix://{}", docker_desktop.display());
            }
        }

        "/var/run/docker.sock".into()
    }
}

fn default_network_name() -> String {
    "bridge".into()
}

fn default_container_pid_limit() -> i64 {
    512
}

/// Monitor Loop, health-probe and memory-probe tuning (§4.7, §4.3, §4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfiguration {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,

    #[serde(default = "default_eviction_cpu_penalty")]
    pub eviction_cpu_penalty: f64,

    #[serde(default = "default_memory_cache_ttl_secs")]
    pub memory_cache_ttl_secs: u64,
}

impl Default for SchedulerConfiguration {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            health_poll_interval_ms: default_health_poll_interval_ms(),
            eviction_cpu_penalty: default_eviction_cpu_penalty(),
            memory_cache_ttl_secs: default_memory_cache_ttl_secs(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_health_poll_interval_ms() -> u64 {
    100
}

fn default_eviction_cpu_penalty() -> f64 {
    1_000_000.0
}

fn default_memory_cache_ttl_secs() -> u64 {
    1
}

/// File-backed Service Catalog (§4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfiguration {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfiguration {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("services.toml")
}

/// Development-mode bearer-token auth stub (§6, §10.1).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfiguration {
    /// token -> groups
    #[serde(default)]
    pub tokens: HashMap<String, Vec<String>>,

    #[serde(default = "default_admin_group")]
    pub admin_group: String,
}

impl Default for AuthConfiguration {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            admin_group: default_admin_group(),
        }
    }
}

fn default_admin_group() -> String {
    "admin".into()
}
