//! Runtime configuration (breaker.toml)
//!
//! Every section is optional; an empty file yields the defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::Level;

use crate::capabilities::Permissions;

pub const DEFAULT_APP_NAME: &str = "AntiDebug Breaker";
pub const DEFAULT_APP_IDENTIFIER: &str = "com.antidebug.breaker";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub badge: Badge,
    #[serde(default)]
    pub log: Log,
    /// Accepts both `permissions` and `capabilities` keys
    #[serde(alias = "capabilities")]
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct App {
    pub name: String,
    /// Reverse-DNS identifier, also names the default storage directory
    pub identifier: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            name: DEFAULT_APP_NAME.to_string(),
            identifier: DEFAULT_APP_IDENTIFIER.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Storage {
    /// Explicit database path; defaults under the user data directory
    pub path: Option<PathBuf>,
}

/// Applied by [`crate::Background::from_config`]
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Badge {
    pub color: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Log {
    pub level: Option<String>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing breaker config")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config at {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Load `path` when given, defaults otherwise
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| ext_storage::default_db_path(&self.app.identifier))
    }

    pub fn badge_color(&self) -> &str {
        self.badge
            .color
            .as_deref()
            .unwrap_or(ext_badge::DEFAULT_BADGE_COLOR)
    }

    pub fn log_level(&self) -> Result<Level> {
        match &self.log.level {
            Some(level) => Ok(ext_log::parse_level(level)?),
            None => Ok(Level::INFO),
        }
    }
}
