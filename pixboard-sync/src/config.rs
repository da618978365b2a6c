//! Server configuration.
//!
//! Loaded from an optional JSON file, then overridden from the environment:
//! ```text
//! defaults ─► config.json (partial is fine) ─► PIXBOARD_BIND / PORT
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use pixboard_core::{Color, GridError, GridStore, Region};

use crate::protocol::{INIT_BYTES_PER_CELL, MAX_SERVER_FRAME_BYTES};

/// Largest canvas whose `init` still decodes on a client.
pub const MAX_CANVAS_CELLS: u64 = (MAX_SERVER_FRAME_BYTES / INIT_BYTES_PER_CELL) as u64;

/// Full listen address override, e.g. `0.0.0.0:8080`.
pub const ENV_BIND: &str = "PIXBOARD_BIND";
/// Port-only override; keeps the configured host.
pub const ENV_PORT: &str = "PORT";

/// What the authority does with a `cellChange` it refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionPolicy {
    /// Log and drop. The sender stays diverged until its next `init`.
    Silent,
    /// Tell the originator with a `rejected` message.
    #[default]
    Acknowledge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
    pub background: Color,
    pub editable_region: Option<Region>,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 80,
            height: 80,
            background: Color::WHITE,
            editable_region: None,
        }
    }
}

impl CanvasConfig {
    /// Build the authoritative grid this config describes.
    pub fn build_grid(&self) -> Result<GridStore, ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "canvas must be at least 1x1, got {}x{}",
                self.width, self.height
            )));
        }
        let cells = u64::from(self.width) * u64::from(self.height);
        if cells > MAX_CANVAS_CELLS {
            return Err(ConfigError::Invalid(format!(
                "canvas {}x{} exceeds {MAX_CANVAS_CELLS} cells",
                self.width, self.height
            )));
        }
        let grid = GridStore::new(self.width, self.height, self.background);
        match self.editable_region {
            Some(region) => Ok(grid.with_editable_region(region)?),
            None => Ok(grid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind_addr: String,
    pub canvas: CanvasConfig,
    /// Player attribution, roster and leaderboard.
    pub presence: bool,
    pub rejection: RejectionPolicy,
    /// Per-receiver fan-out buffer, in messages.
    pub broadcast_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            canvas: CanvasConfig::default(),
            presence: true,
            rejection: RejectionPolicy::default(),
            broadcast_capacity: 1024,
            heartbeat_interval_secs: 30,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `PIXBOARD_BIND` / `PORT` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. `PIXBOARD_BIND` wins over
    /// `PORT` when both are set.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND).filter(|v| !v.trim().is_empty()) {
            self.bind_addr = bind.trim().to_string();
            return Ok(());
        }
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_PORT} is not a port: {port:?}")))?;
            let host = self
                .bind_addr
                .rsplit_once(':')
                .map_or(self.bind_addr.as_str(), |(host, _)| host);
            self.bind_addr = format!("{host}:{port}");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcastCapacity must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeatIntervalSecs must be > 0".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("maxConnections must be > 0".into()));
        }
        self.canvas.build_grid().map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Grid(#[from] GridError),
}
