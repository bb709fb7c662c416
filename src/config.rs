use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::transport::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Top-level configuration shared by the agent and server commands.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Agent (program output -> server) configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Ingestion server configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Server address. Default: "127.0.0.1".
    #[serde(default = "default_agent_address")]
    pub address: String,

    /// Server port. Default: 5267.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Give up connecting after this long. Default: 2s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Delay between connection attempts. Default: 10ms.
    #[serde(default = "default_connect_poll_interval", with = "humantime_serde")]
    pub connect_poll_interval: Duration,

    /// Batching window; zero sends every record on its own. Default: 10ms.
    #[serde(default = "default_buffer_timeout", with = "humantime_serde")]
    pub buffer_timeout: Duration,

    /// Capacity of the outbound message queue. Default: 4096.
    #[serde(default = "default_agent_queue_size")]
    pub queue_size: usize,

    /// Forward program output (not telemetry) to the server.
    #[serde(default)]
    pub send_stdout: bool,

    /// Keep telemetry lines in the echoed and forwarded output.
    #[serde(default)]
    pub send_all_stdout: bool,

    /// Echo program output to the console.
    #[serde(default)]
    pub print_out: bool,

    /// Copy program output to this file.
    #[serde(default)]
    pub out_file: Option<PathBuf>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: "0.0.0.0".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Listen port. Default: 5267.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Capacity of the ingestion queue. Default: 8192.
    #[serde(default = "default_server_queue_size")]
    pub queue_size: usize,

    /// Largest accepted frame in bytes. Default: 64MiB.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Session persistence.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Prometheus health metrics and read API server.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Session persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Save every finalized run. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory the `session.<epoch>` directory is created in. Default: ".".
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,

    /// Session directory to import at startup; new runs are added to it.
    #[serde(default)]
    pub import_path: Option<PathBuf>,
}

/// Health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and /api. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_agent_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5267
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_connect_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_buffer_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_agent_queue_size() -> usize {
    4096
}

fn default_server_queue_size() -> usize {
    8192
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_save_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_true() -> bool {
    true
}

// --- Default impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            agent: AgentConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_agent_address(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            connect_poll_interval: default_connect_poll_interval(),
            buffer_timeout: default_buffer_timeout(),
            queue_size: default_agent_queue_size(),
            send_stdout: false,
            send_all_stdout: false,
            print_out: false,
            out_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            queue_size: default_server_queue_size(),
            max_frame_length: default_max_frame_length(),
            persistence: PersistenceConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_path: default_save_path(),
            import_path: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.agent.address.is_empty() {
            bail!("agent.address is required");
        }

        if self.agent.port == 0 {
            bail!("agent.port must be positive");
        }

        if self.agent.connect_timeout.is_zero() {
            bail!("agent.connect_timeout must be positive");
        }

        if self.agent.connect_poll_interval > self.agent.connect_timeout {
            bail!("agent.connect_poll_interval must not exceed agent.connect_timeout");
        }

        if self.agent.queue_size == 0 {
            bail!("agent.queue_size must be positive");
        }

        if self.server.port == 0 {
            bail!("server.port must be positive");
        }

        if self.server.queue_size == 0 {
            bail!("server.queue_size must be positive");
        }

        if self.server.max_frame_length == 0 {
            bail!("server.max_frame_length must be positive");
        }

        if self.server.health.enabled && self.server.health.addr.is_empty() {
            bail!("server.health.addr is required when enabled");
        }

        Ok(())
    }
}

impl AgentConfig {
    /// `address:port` of the server.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl ServerConfig {
    /// `listen_addr:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.agent.server_addr(), "127.0.0.1:5267");
        assert_eq!(cfg.agent.connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.agent.connect_poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.agent.buffer_timeout, Duration::from_millis(10));
        assert_eq!(cfg.server.bind_addr(), "0.0.0.0:5267");
        assert_eq!(cfg.server.queue_size, 8192);
        assert!(cfg.server.persistence.enabled);
        assert_eq!(cfg.server.persistence.save_path, PathBuf::from("."));
        assert_eq!(cfg.server.health.addr, ":9090");
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
log_level: debug
agent:
  port: 6000
  connect_timeout: 5s
  buffer_timeout: 0s
  send_stdout: true
server:
  queue_size: 16
  persistence:
    enabled: false
    import_path: /data/session.1
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.agent.port, 6000);
        assert_eq!(cfg.agent.connect_timeout, Duration::from_secs(5));
        assert!(cfg.agent.buffer_timeout.is_zero());
        assert!(cfg.agent.send_stdout);
        assert_eq!(cfg.agent.address, "127.0.0.1");
        assert_eq!(cfg.server.queue_size, 16);
        assert!(!cfg.server.persistence.enabled);
        assert_eq!(
            cfg.server.persistence.import_path,
            Some(PathBuf::from("/data/session.1"))
        );
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hpxdash.yaml");
        std::fs::write(&path, "server:\n  port: 7000\n").expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.server.port, 7000);

        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn test_validation_zero_queue_size() {
        let cfg = Config {
            server: ServerConfig {
                queue_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server.queue_size"));

        let cfg = Config {
            agent: AgentConfig {
                queue_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent.queue_size"));
    }

    #[test]
    fn test_validation_zero_port() {
        let cfg = Config {
            agent: AgentConfig {
                port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent.port"));
    }

    #[test]
    fn test_validation_connect_timeout() {
        let cfg = Config {
            agent: AgentConfig {
                connect_timeout: Duration::ZERO,
                connect_poll_interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent.connect_timeout"));

        let cfg = Config {
            agent: AgentConfig {
                connect_timeout: Duration::from_millis(5),
                connect_poll_interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("agent.connect_poll_interval"));
    }
}
