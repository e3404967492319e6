//! ServiceConfig: the immutable, per-revision configuration for a Service.
//!
//! Mirrors the Catalog row shape (§6): these are the fields an external
//! persistence layer hands the Registry, decoded explicitly rather than via
//! reflection.

use serde::{Deserialize, Serialize};

use super::size::parse_size;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealthCheckType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "log")]
    Log,
}

impl Default for HealthCheckType {
    fn default() -> Self {
        HealthCheckType::None
    }
}

/// A single mount descriptor line, already parsed per the grammar in §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// `source:target[:ro]`
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    /// bare `target` ⇒ named volume, name computed by the caller via
    /// `ca_{container_name}_{md5(target)}`.
    Volume { target: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,

    #[serde(default)]
    pub max_ram: Option<String>,
    #[serde(default)]
    pub max_vram: Option<String>,

    #[serde(default = "default_true")]
    pub use_cpu: bool,
    #[serde(default)]
    pub use_gpu: bool,

    #[serde(default = "default_max_boot_time")]
    pub max_boot_time: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default)]
    pub health_check_type: HealthCheckType,
    #[serde(default)]
    pub health_check_url: String,
    #[serde(default)]
    pub health_check_regex: Option<String>,

    pub port: u16,

    /// Raw mount lines, one per entry (§6 grammar); parsed on demand via `mounts()`.
    #[serde(default)]
    pub mounts: Vec<String>,

    /// Raw `KEY=VALUE` lines (§6 grammar); parsed on demand via `environment()`.
    #[serde(default)]
    pub environment: Vec<String>,

    #[serde(default)]
    pub cpuset_cpus: Option<String>,

    #[serde(default)]
    pub permission_group: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_boot_time() -> u64 {
    120
}

fn default_idle_timeout() -> u64 {
    600
}

impl ServiceConfig {
    pub fn max_ram_bytes(&self) -> Result<Option<u64>> {
        self.max_ram.as_deref().map(parse_size).transpose()
    }

    pub fn max_vram_bytes(&self) -> Result<Option<u64>> {
        self.max_vram.as_deref().map(parse_size).transpose()
    }

    /// Parse `mounts` per the grammar: lines containing `:` are bind mounts
    /// (`source:target[:ro]`), bare lines are named-volume targets.
    pub fn parsed_mounts(&self) -> Vec<MountSpec> {
        self.mounts
            .iter()
            .filter_map(|line| parse_mount_line(line))
            .collect()
    }

    /// Parse `environment` per the grammar: `KEY=VALUE`, trimmed, malformed
    /// or empty lines ignored.
    pub fn parsed_environment(&self) -> Vec<(String, String)> {
        self.environment
            .iter()
            .filter_map(|line| parse_env_line(line))
            .collect()
    }
}

fn parse_mount_line(line: &str) -> Option<MountSpec> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.contains(':') {
        let mut parts = line.splitn(3, ':');
        let source = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        let read_only = parts.next() == Some("ro");
        if source.is_empty() || target.is_empty() {
            return None;
        }
        Some(MountSpec::Bind {
            source,
            target,
            read_only,
        })
    } else {
        Some(MountSpec::Volume {
            target: line.to_string(),
        })
    }
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_mount_with_ro() {
        match parse_mount_line("/host/data:/data:ro").unwrap() {
            MountSpec::Bind {
                source,
                target,
                read_only,
            } => {
                assert_eq!(source, "/host/data");
                assert_eq!(target, "/data");
                assert!(read_only);
            }
            _ => panic!("expected bind mount"),
        }
    }

    #[test]
    fn parses_bare_target_as_volume() {
        match parse_mount_line("/data/models").unwrap() {
            MountSpec::Volume { target } => assert_eq!(target, "/data/models"),
            _ => panic!("expected volume mount"),
        }
    }

    #[test]
    fn ignores_empty_mount_lines() {
        assert!(parse_mount_line("").is_none());
        assert!(parse_mount_line("   ").is_none());
    }

    #[test]
    fn parses_environment_lines() {
        assert_eq!(
            parse_env_line("KEY=VALUE"),
            Some(("KEY".to_string(), "VALUE".to_string()))
        );
        assert_eq!(
            parse_env_line("  SPACED = value with spaces "),
            Some(("SPACED".to_string(), "value with spaces".to_string()))
        );
    }

    #[test]
    fn ignores_malformed_environment_lines() {
        assert_eq!(parse_env_line(""), None);
        assert_eq!(parse_env_line("no-equals-sign"), None);
        assert_eq!(parse_env_line("=no-key"), None);
    }
}
