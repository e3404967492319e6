//! Catalog: the external collaborator the Registry polls for desired state
//! (§4.4, §6). The trait names the boundary; the file-backed implementation
//! makes the daemon buildable and runnable standalone.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{OrchestratorError, Result};
use crate::service::ServiceConfig;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Current desired set of services, keyed by name.
    async fn list(&self) -> Result<Vec<ServiceConfig>>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    services: Vec<ServiceConfig>,
}

/// Reads a flat `services.toml` listing of `ServiceConfig` entries on every
/// poll; no caching of its own, since the Registry already only polls it
/// once per Monitor Loop tick.
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn list(&self) -> Result<Vec<ServiceConfig>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(OrchestratorError::Io)?;

        let parsed = toml::from_str::<CatalogFile>(&content)
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        Ok(parsed.services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_toml_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.toml");
        tokio::fs::write(
            &path,
            r#"
            [[services]]
            name = "svc-a"
            image = "example/image:latest"
            port = 8000
            "#,
        )
        .await
        .unwrap();

        let catalog = FileCatalog::new(path);
        let services = catalog.list().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "svc-a");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let catalog = FileCatalog::new(PathBuf::from("/nonexistent/services.toml"));
        assert!(catalog.list().await.is_err());
    }
}
