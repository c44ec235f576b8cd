// Runtime configuration for reaching the container engine
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_NAME_PREFIX: &str = "stevedore";

pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";
pub const ENV_REQUEST_TIMEOUT: &str = "STEVEDORE_REQUEST_TIMEOUT_SECS";
pub const ENV_NAME_PREFIX: &str = "STEVEDORE_NAME_PREFIX";

/// Address of the engine's control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Default for RuntimeEndpoint {
    fn default() -> Self {
        RuntimeEndpoint::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}

impl fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            RuntimeEndpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

impl FromStr for RuntimeEndpoint {
    type Err = anyhow::Error;

    /// Accepts `unix:///path`, `tcp://host:port`, `http://host:port`
    /// or a bare absolute socket path.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("unix endpoint is missing a socket path");
            }
            return Ok(RuntimeEndpoint::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(RuntimeEndpoint::Unix(PathBuf::from(s)));
        }

        let authority = s
            .strip_prefix("tcp://")
            .or_else(|| s.strip_prefix("http://"))
            .with_context(|| format!("Unsupported engine endpoint: {}", s))?
            .trim_end_matches('/');

        let (host, port) = authority
            .rsplit_once(':')
            .with_context(|| format!("Endpoint is missing a port: {}", s))?;
        if host.is_empty() {
            bail!("Endpoint is missing a host: {}", s);
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in endpoint: {}", s))?;

        Ok(RuntimeEndpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// Process-wide engine settings, read once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub endpoint: RuntimeEndpoint,
    pub request_timeout_secs: u64,
    pub name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: RuntimeEndpoint::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from the process environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_DOCKER_HOST).filter(|v| !v.trim().is_empty()) {
            config.endpoint = host
                .parse()
                .with_context(|| format!("Invalid {}", ENV_DOCKER_HOST))?;
        }

        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            config.request_timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_REQUEST_TIMEOUT, timeout))?;
        }

        if let Some(prefix) = lookup(ENV_NAME_PREFIX).filter(|v| !v.trim().is_empty()) {
            config.name_prefix = prefix.trim().to_string();
        }

        Ok(config)
    }
}
