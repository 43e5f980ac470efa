// Configuration Management Module
// Handles txn.toml loading, defaults, and validation

pub mod charset;

pub use charset::Charset;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use anyhow::{Result, Context};
use crate::buffer::PREALLOCATED_OPS_PER_CONNECTION;
use tracing::{info, warn};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Charset used to turn frames into text and back
    #[serde(default)]
    pub charset: Charset,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listening port (0 picks an ephemeral port)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Pending connection backlog for the listener
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Skip persistence and provider forwarding
    #[serde(default)]
    pub test_mode: bool,

    /// Forward successful requests to a provider
    #[serde(default)]
    pub router_mode: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Concurrently connected clients (also the client state pool size)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Concurrently outstanding provider calls (also the provider state pool size)
    #[serde(default = "default_max_provider_calls")]
    pub max_provider_calls: usize,

    /// Bytes per buffer slice; bounds every frame in either direction
    #[serde(default = "default_slice_size")]
    pub slice_size: usize,

    /// Per-client budget for a full request/response cycle
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

// Default value functions
fn default_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_listen_port() -> u16 { 7000 }
fn default_backlog() -> i32 { 1024 }
fn default_max_connections() -> usize { 1024 }
fn default_max_provider_calls() -> usize { 1024 }
fn default_slice_size() -> usize { 4096 }
fn default_client_timeout() -> u64 { 30 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            listen_port: default_listen_port(),
            backlog: default_backlog(),
            test_mode: false,
            router_mode: false,
        }
    }
}

impl LimitsConfig {
    /// Sockets held at full load, one per client and one per provider call
    pub fn socket_demand(&self) -> Option<usize> {
        self.max_connections.checked_add(self.max_provider_calls)
    }

    /// Arena size in bytes; `None` when it does not fit in `usize`
    pub fn arena_bytes(&self) -> Option<usize> {
        self.slice_size
            .checked_mul(self.max_connections)?
            .checked_mul(PREALLOCATED_OPS_PER_CONNECTION)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_provider_calls: default_max_provider_calls(),
            slice_size: default_slice_size(),
            client_timeout_secs: default_client_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            charset: Charset::default(),
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file or use defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let contents = std::fs::read_to_string(path)
                .context("Failed to read configuration file")?;

            let config: EngineConfig = toml::from_str(&contents)
                .context("Failed to parse configuration file")?;

            config.validate()?;
            Ok(config)
        } else {
            warn!("Configuration file not found, using defaults");
            info!("Create txn.toml to customize configuration");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.backlog <= 0 {
            anyhow::bail!("Listen backlog must be positive");
        }

        if self.bind_socket_addr().is_err() {
            anyhow::bail!("Bind address '{}' is not a valid IP address", self.server.bind_addr);
        }

        if self.limits.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }

        if self.limits.max_provider_calls == 0 {
            anyhow::bail!("max_provider_calls must be at least 1");
        }

        if self.limits.slice_size == 0 {
            anyhow::bail!("slice_size must be at least 1 byte");
        }

        if self.limits.socket_demand().is_none() {
            anyhow::bail!("max_connections + max_provider_calls does not fit in a usize");
        }

        if self.limits.arena_bytes().is_none() {
            anyhow::bail!(
                "buffer arena of {} connections x {} byte slices is too large",
                self.limits.max_connections,
                self.limits.slice_size
            );
        }

        if self.limits.client_timeout_secs == 0 {
            anyhow::bail!("client_timeout_secs must be at least 1");
        }

        if self.server.router_mode {
            let ip_ok = self
                .provider
                .ip
                .as_deref()
                .map(|ip| ip.parse::<IpAddr>().is_ok())
                .unwrap_or(false);
            if !ip_ok {
                anyhow::bail!("router_mode requires a valid provider.ip");
            }
            if self.provider.ports.is_empty() {
                anyhow::bail!("router_mode requires at least one provider port");
            }
        }

        Ok(())
    }

    /// Socket address the listener binds to
    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address {}", self.server.bind_addr))?;
        Ok(SocketAddr::new(ip, self.server.listen_port))
    }

    /// Per-client timeout budget
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.client_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.server.listen_port, 7000);
        assert_eq!(config.limits.max_connections, 1024);
        assert_eq!(config.charset, Charset::Ascii);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_router_mode_requires_provider() {
        let mut config = EngineConfig::default();
        config.server.router_mode = true;
        assert!(config.validate().is_err());

        config.provider.ip = Some("not-an-ip".to_string());
        config.provider.ports = vec![7100];
        assert!(config.validate().is_err());

        config.provider.ip = Some("10.0.0.5".to_string());
        assert!(config.validate().is_ok());

        config.provider.ports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overflowing_limits_rejected() {
        let mut config = EngineConfig::default();
        config.limits.max_connections = usize::MAX;
        config.limits.max_provider_calls = 1;
        assert!(config.limits.socket_demand().is_none());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.limits.max_connections = usize::MAX / 1024;
        config.limits.slice_size = 4096;
        assert!(config.limits.socket_demand().is_some());
        assert!(config.limits.arena_bytes().is_none());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
charset = "utf8"

[server]
listen_port = 9100
router_mode = true

[provider]
ip = "127.0.0.1"
ports = [9200, 9201]

[limits]
max_connections = 16
max_provider_calls = 8
slice_size = 512
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.charset, Charset::Utf8);
        assert_eq!(config.server.listen_port, 9100);
        assert!(config.server.router_mode);
        assert_eq!(config.provider.ports, vec![9200, 9201]);
        assert_eq!(config.limits.slice_size, 512);
        assert_eq!(config.limits.client_timeout_secs, 30);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0");
    }
}
