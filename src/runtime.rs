//! Container runtime client: the trait the rest of the proxy talks to, and
//! the Docker implementation over bollard.

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StartContainerOptions, StopContainerOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from the container runtime client
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon cannot be reached (transient, retried with backoff)
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    /// A specific container could not be found
    #[error("container not found: {0}")]
    NotFound(String),

    /// Any other runtime API failure
    #[error("container runtime API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// One `container-port/proto -> host bindings` mapping, as published when the
/// container was created. Recorded at scan time so a stopped container can be
/// restarted with its original ports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

pub type PortMap = HashMap<String, Vec<PortBinding>>;

/// Point-in-time view of a single container, as reported by the runtime
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    /// Opaque identifier assigned by the runtime
    pub id: String,
    /// Human-readable name, also valid for runtime lookups
    pub name: String,
    /// Raw `KEY=VALUE` environment entries from the container config
    pub env: Vec<String>,
    /// Published port bindings from the container's host config
    pub port_bindings: PortMap,
    pub running: bool,
    /// Start timestamp from the runtime; used only to break virtual-host ties
    pub started_at: DateTime<Utc>,
}

/// Lifecycle status carried by a runtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Start,
    Stop,
    Die,
}

impl EventStatus {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(EventStatus::Start),
            "stop" => Some(EventStatus::Stop),
            "die" => Some(EventStatus::Die),
            _ => None,
        }
    }
}

/// A lifecycle event for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub id: String,
    pub status: EventStatus,
}

/// Interface to the container runtime.
///
/// The proxy core only ever talks to this trait; `DockerRuntime` is the real
/// implementation and tests substitute their own.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness probe against the runtime daemon
    async fn ping(&self) -> Result<()>;

    /// Identifiers of every container the runtime knows, including stopped ones
    async fn list_all(&self) -> Result<Vec<String>>;

    /// Inspect a container by identifier or name
    async fn inspect(&self, name_or_id: &str) -> Result<ContainerSnapshot>;

    /// Start a container, reproducing its originally published port bindings
    async fn start(&self, id: &str, bindings: &PortMap) -> Result<()>;

    /// Stop a container, allowing `grace` for graceful shutdown before the
    /// runtime kills it
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Subscribe to the runtime's lifecycle event stream. The stream ending
    /// or yielding an error means the subscription is gone and the caller
    /// must re-probe and re-subscribe.
    async fn events(&self) -> Result<BoxStream<'static, Result<RuntimeEvent>>>;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Docker implementation of [`ContainerRuntime`]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults()?
        };

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults() -> anyhow::Result<Docker> {
        // Try common socket paths. Client construction is lazy: reachability
        // is the synchronizer's job, an unresponsive daemon must not abort
        // boot.
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot construct a Docker client. No Docker socket found at \
                 common locations.\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\
                 - Or set docker.host in the configuration\n\n\
                 Underlying error: {}",
                e
            )
        })
    }
}

/// Docker reports never-started containers with a zero timestamp; anything
/// unparseable gets the same floor so tie-breaking stays total.
fn parse_started_at(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let summaries = self.client.list_containers(Some(options)).await?;
        Ok(summaries.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, name_or_id: &str) -> Result<ContainerSnapshot> {
        let info = self
            .client
            .inspect_container(name_or_id, None)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::NotFound(name_or_id.to_string())
                } else {
                    RuntimeError::Api(e)
                }
            })?;

        let state = info.state.unwrap_or_default();

        let port_bindings: PortMap = info
            .host_config
            .and_then(|hc| hc.port_bindings)
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| PortBinding {
                        host_ip: b.host_ip,
                        host_port: b.host_port,
                    })
                    .collect();
                (port, bindings)
            })
            .collect();

        Ok(ContainerSnapshot {
            id: info.id.unwrap_or_else(|| name_or_id.to_string()),
            // Docker reports names with a leading slash
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            env: info.config.and_then(|c| c.env).unwrap_or_default(),
            port_bindings,
            running: state.running.unwrap_or(false),
            started_at: parse_started_at(state.started_at.as_deref()),
        })
    }

    async fn start(&self, id: &str, _bindings: &PortMap) -> Result<()> {
        // Docker keeps the published ports in the container's HostConfig, so
        // restarting an existing container reproduces them without resending.
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::Api(e)
                }
            })?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                // Already stopped
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(RuntimeError::Api(e)),
        }
    }

    async fn events(&self) -> Result<BoxStream<'static, Result<RuntimeEvent>>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self
            .client
            .events(Some(options))
            .filter_map(|msg| async move {
                match msg {
                    Ok(event) => {
                        let id = event.actor.and_then(|a| a.id)?;
                        let status = event.action.as_deref().and_then(EventStatus::parse)?;
                        Some(Ok(RuntimeEvent { id, status }))
                    }
                    Err(e) => Some(Err(RuntimeError::Api(e))),
                }
            })
            .boxed();

        Ok(stream)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_status() {
        assert_eq!(EventStatus::parse("start"), Some(EventStatus::Start));
        assert_eq!(EventStatus::parse("stop"), Some(EventStatus::Stop));
        assert_eq!(EventStatus::parse("die"), Some(EventStatus::Die));
        assert_eq!(EventStatus::parse("pause"), None);
        assert_eq!(EventStatus::parse(""), None);
    }

    #[tokio::test]
    async fn test_connect_is_lazy_without_a_reachable_daemon() {
        // A socket path that exists but where nothing serves the Docker API;
        // client construction must still succeed, reachability is probed
        // later by the synchronizer
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("no-such-daemon.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        let host = format!("unix://{}", socket_path.display());
        let runtime = DockerRuntime::connect(Some(&host)).await;
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_parse_started_at() {
        let ts = parse_started_at(Some("2024-03-01T12:30:00.000000000Z"));
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:30:00+00:00");

        // Docker's zero value for never-started containers
        let zero = parse_started_at(Some("0001-01-01T00:00:00Z"));
        assert!(zero < ts);

        assert_eq!(parse_started_at(None), DateTime::<Utc>::MIN_UTC);
        assert_eq!(parse_started_at(Some("garbage")), DateTime::<Utc>::MIN_UTC);
    }
}
