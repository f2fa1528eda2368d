use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and upstream settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime connection settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// Idle-detection and wake-up settings
    #[serde(default)]
    pub sleep: SleepConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Fixed upstream every request is forwarded to (default: 127.0.0.1:8080).
    /// Host-based routing only decides whether to wake a container, never
    /// the forwarding destination.
    #[serde(default = "default_upstream")]
    pub upstream: SocketAddr,

    /// Read/write timeout in seconds applied to each forwarded request (default: 10)
    #[serde(default = "default_read_write_timeout")]
    pub read_write_timeout_secs: u64,

    /// Maximum idle upstream connections kept pooled (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled-connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            upstream: default_upstream(),
            read_write_timeout_secs: default_read_write_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker daemon endpoint, e.g. "unix:///var/run/docker.sock" or
    /// "tcp://host:2375". Falls back to DOCKER_HOST and then to common
    /// socket paths when unset.
    pub host: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SleepConfig {
    /// Seconds of inactivity before a running container is stopped (default: 1800)
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,

    /// Grace period in seconds given to a container on stop before the
    /// runtime kills it (default: 5)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Upper bound in seconds on the wait for a freshly started container to
    /// accept connections (default: 5)
    #[serde(default = "default_settle_wait")]
    pub settle_wait_secs: u64,

    /// Seconds between reconnection attempts to the container runtime (default: 10)
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            stop_grace_secs: default_stop_grace(),
            settle_wait_secs: default_settle_wait(),
            reconnect_backoff_secs: default_reconnect_backoff(),
        }
    }
}

impl ServerConfig {
    pub fn read_write_timeout(&self) -> Duration {
        Duration::from_secs(self.read_write_timeout_secs)
    }
}

impl SleepConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    /// The reaper ticks at one-third of the idle threshold so no backend
    /// overshoots its deadline by more than a third of it. Floored at one
    /// second to keep tiny thresholds from busy-looping.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs((self.idle_threshold_secs / 3).max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn settle_wait(&self) -> Duration {
        Duration::from_secs(self.settle_wait_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_upstream() -> SocketAddr {
    "127.0.0.1:8080".parse().expect("valid default upstream address")
}

fn default_read_write_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_idle_threshold() -> u64 {
    60 * 30
}

fn default_stop_grace() -> u64 {
    5
}

fn default_settle_wait() -> u64 {
    5
}

fn default_reconnect_backoff() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file. A missing file is not an error:
    /// the proxy runs fine on defaults alone.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sleep.idle_threshold_secs == 0 {
            anyhow::bail!("sleep.idle_threshold_secs must be greater than zero");
        }
        if self.server.read_write_timeout_secs == 0 {
            anyhow::bail!("server.read_write_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}
