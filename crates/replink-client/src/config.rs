//! Client configuration.
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! TOML file, and environment variables. The command-line front end applies
//! its own flags last.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Default REPL host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default REPL / agent port.
pub const DEFAULT_PORT: u16 = 5557;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "REPLINK_CONFIG";

/// Environment variable overriding the host.
pub const HOST_ENV: &str = "REPLINK_HOST";

/// Environment variable overriding the port.
pub const PORT_ENV: &str = "REPLINK_PORT";

/// Connection and agent settings.
///
/// # Example
///
/// ```rust
/// use replink_client::config::ClientConfig;
///
/// let config = ClientConfig::from_toml_str("port = 6000").unwrap();
/// assert_eq!(config.port, 6000);
/// assert_eq!(config.host, "127.0.0.1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host the REPL server listens on.
    pub host: String,

    /// Port the REPL server listens on.
    pub port: u16,

    /// Connect as soon as the front end starts.
    pub auto_connect: bool,

    /// Preferred port handed to the agent on injection.
    pub agent_port: u16,

    /// Explicit agent artifact; must exist to be used.
    pub agent_jar_path: Option<PathBuf>,

    /// Version used when looking the agent up in the local Maven repository;
    /// unset means the attach crate's default.
    pub agent_maven_version: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            auto_connect: true,
            agent_port: DEFAULT_PORT,
            agent_jar_path: None,
            agent_maven_version: None,
        }
    }
}

impl ClientConfig {
    /// `$XDG_CONFIG_HOME/replink/config.toml` (or the platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("replink").join("config.toml"))
    }

    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Reads and parses a TOML file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Loads the config file (if any) and applies environment overrides.
    ///
    /// An explicitly named file that cannot be read is an error; a missing
    /// default file is not.
    pub fn load() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_ENV).map(PathBuf::from) {
            Some(path) => Self::load_file(&path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        debug!(host = %config.host, port = config.port, "Client configuration loaded");
        Ok(config)
    }

    /// Applies `REPLINK_HOST` / `REPLINK_PORT` style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ClientError::Config(format!("{PORT_ENV}={port} is not a port")))?;
        }
        Ok(())
    }

    /// `host:port` of the REPL server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
