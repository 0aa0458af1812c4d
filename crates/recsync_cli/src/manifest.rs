//! Model manifest: which server to talk to and which models to sync.

use recsync_engine::{ModelDescriptor, ModelRegistry, SyncConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Contents of the manifest file.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Base URL of the record server.
    pub server: String,
    /// Synchronized models.
    pub models: Vec<ModelDescriptor>,
    /// Lease duration in seconds.
    #[serde(default)]
    pub lease_secs: Option<u64>,
    /// HTTP request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Manifest {
    /// Reads a manifest file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read manifest {}: {e}", path.display()))?;
        Self::parse(&text)
    }

    /// Parses manifest JSON.
    pub fn parse(text: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let manifest: Manifest = serde_json::from_str(text)?;
        if manifest.models.is_empty() {
            return Err("manifest declares no models".into());
        }
        Ok(manifest)
    }

    /// Builds the model registry.
    pub fn registry(&self) -> ModelRegistry {
        self.models.iter().cloned().collect()
    }

    /// Builds the engine configuration.
    pub fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        if let Some(secs) = self.lease_secs {
            config = config.with_lease_duration(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        config
    }
}
