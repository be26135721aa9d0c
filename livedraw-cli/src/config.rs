use anyhow::{bail, Context, Result};
use livedraw_core::{EngineConfig, ScheduleConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ADMIN_TOKEN: &str = "token123";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub admin_token: String,
    pub public_dir: PathBuf,
    pub heartbeat_secs: u64,
    pub observer_buffer: usize,
    pub schedule: ScheduleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            admin_token: DEFAULT_ADMIN_TOKEN.to_string(),
            public_dir: PathBuf::from("public"),
            heartbeat_secs: 30,
            observer_buffer: 64,
            schedule: ScheduleConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `<config_dir>/livedraw/server.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("livedraw").join("server.json"))
    }

    /// Load from `path`, or from the default location when it exists.
    ///
    /// An explicitly given path must exist; a missing default file yields the
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.admin_token.is_empty() {
            bail!("Admin token cannot be empty");
        }

        if self.heartbeat_secs == 0 {
            bail!("Heartbeat interval must be greater than 0");
        }

        self.engine_config().validate()?;
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            schedule: self.schedule,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            observer_buffer: self.observer_buffer,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
