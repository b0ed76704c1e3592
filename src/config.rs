//! Server configuration
//!
//! JSON file with camelCase keys; every field has a default, so an empty
//! object is a valid config. Environment variables override file values.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

pub const CONFIG_ENV: &str = "MIDIMCP_CONFIG";
const APP_DIR: &str = "midimcp";

/// Which MIDI backend provides output ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Platform MIDI through midir
    Midir,
    /// In-memory recorder, no hardware
    Memory,
}

impl FromStr for BackendKind {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "midir" => Ok(Self::Midir),
            "memory" => Ok(Self::Memory),
            other => Err(ServerError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub backend: BackendKind,
    /// Client name announced to the platform MIDI system
    pub client_name: String,
    /// Port id or name connected at startup
    pub default_port: Option<String>,
    /// TCP address for the socket transport
    pub listen: Option<String>,
    /// Serve JSON-RPC on stdin/stdout
    pub stdio: bool,
    pub jitter_tolerance_ms: u64,
    pub feed_capacity: usize,
    pub max_file_bytes: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_to_file: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Midir,
            client_name: APP_DIR.to_string(),
            default_port: None,
            listen: None,
            stdio: true,
            jitter_tolerance_ms: 3,
            feed_capacity: 1024,
            max_file_bytes: 4 * 1024 * 1024,
            log_level: "info".to_string(),
            log_file: None,
            log_to_file: true,
        }
    }
}

impl ServerConfig {
    /// `<config dir>/midimcp/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.json"))
    }

    /// Load from, in order: `cli_path`, `$MIDIMCP_CONFIG`, the default path
    /// if present, built-in defaults. Environment overrides apply last.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, ServerError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = cli_path
            .map(Path::to_path_buf)
            .or(env_path)
            .or_else(|| Self::default_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ServerError::Config(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Apply `MIDIMCP_*` overrides using `lookup` to read variables
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ServerError> {
        if let Some(backend) = lookup("MIDIMCP_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(port) = lookup("MIDIMCP_PORT") {
            self.default_port = Some(port).filter(|p| !p.is_empty());
        }
        if let Some(listen) = lookup("MIDIMCP_LISTEN") {
            self.listen = Some(listen).filter(|l| !l.is_empty());
        }
        if let Some(level) = lookup("MIDIMCP_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.jitter_tolerance_ms == 0 {
            return Err(ServerError::Config("jitterToleranceMs must be positive".into()));
        }
        if self.feed_capacity == 0 {
            return Err(ServerError::Config("feedCapacity must be positive".into()));
        }
        if self.max_file_bytes == 0 {
            return Err(ServerError::Config("maxFileBytes must be positive".into()));
        }
        if !self.stdio && self.listen.is_none() {
            return Err(ServerError::Config(
                "no transport enabled: set stdio or listen".into(),
            ));
        }
        Ok(())
    }

    pub fn jitter_tolerance(&self) -> Duration {
        Duration::from_millis(self.jitter_tolerance_ms)
    }

    /// Log file in use, if file logging is on
    pub fn log_path(&self) -> Option<PathBuf> {
        if !self.log_to_file {
            return None;
        }
        self.log_file.clone().or_else(|| {
            dirs::data_local_dir().map(|d| d.join(APP_DIR).join("logs").join("midimcp.log"))
        })
    }
}
