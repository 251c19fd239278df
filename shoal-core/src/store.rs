//! Server list persistence.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::session::ServerConfig;

/// Where the configured server list lives. Swappable so the UI layer and
/// tests can supply their own backing.
pub trait ServerStore {
    fn get(&self) -> anyhow::Result<Vec<ServerConfig>>;
    fn save(&self, servers: &[ServerConfig]) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// TOML file store, defaulting to `servers.toml` under the platform config
/// directory.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new() -> Self {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        Self { path: base.join("shoal").join("servers.toml") }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStore for FileStore {
    /// A missing file is an empty list, not an error.
    fn get(&self) -> anyhow::Result<Vec<ServerConfig>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let file: StoreFile = toml::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(file.servers)
    }

    fn save(&self, servers: &[ServerConfig]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = StoreFile { servers: servers.to_vec() };
        let raw = toml::to_string_pretty(&file).context("serializing server list")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}
