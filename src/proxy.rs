//! Activation gateway and HTTP entry point.
//!
//! Every inbound request is forwarded to the one fixed upstream address; the
//! Host header only decides whether a sleeping container must be woken
//! first. Hosts without a registry entry pass straight through (the
//! catch-all path for services not under idle management).

use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use crate::runtime::SharedRuntime;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Interval between readiness probes while waiting for a woken container
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wakes sleeping containers on the request path
pub struct Gateway {
    registry: Arc<Registry>,
    runtime: SharedRuntime,
    upstream: SocketAddr,
    settle_wait: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<Registry>,
        runtime: SharedRuntime,
        upstream: SocketAddr,
        settle_wait: Duration,
    ) -> Self {
        Self {
            registry,
            runtime,
            upstream,
            settle_wait,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Touch the idle clock for `hostname` and lazily start its container.
    ///
    /// `last_access` is updated before any start decision so a burst of
    /// requests arriving during a slow start is not re-detected as idle.
    /// Start failures are logged and swallowed: the request is forwarded
    /// anyway and the claim released so a later request retries.
    pub async fn activate(&self, hostname: &str) {
        let Some(entry) = self.registry.get(hostname) else {
            // Host not under idle management, nothing to wake
            return;
        };

        let claim = {
            let mut guard = entry.lock();
            guard.last_access = Instant::now();
            if guard.running {
                None
            } else {
                // Claim the start under the lock so concurrent requests for
                // the same host issue exactly one start call
                guard.running = true;
                Some((
                    guard.identity.clone(),
                    guard.short_id().to_string(),
                    guard.name.clone(),
                    guard.port_bindings.clone(),
                ))
            }
        };

        let Some((identity, short_id, name, bindings)) = claim else {
            return;
        };

        info!(hostname, container_id = %short_id, name = %name, "starting container");

        match self.runtime.start(&identity, &bindings).await {
            Ok(()) => {
                self.await_upstream().await;
                info!(hostname, container_id = %short_id, "container started");
            }
            Err(e) => {
                error!(hostname, container_id = %short_id, error = %e, "failed to start container");
                entry.lock().running = false;
            }
        }
    }

    /// Bounded poll-until-ready: try TCP connects against the upstream until
    /// it accepts or the settle window elapses. Exhausting the window
    /// degrades to the plain fixed wait; the request is forwarded either way.
    async fn await_upstream(&self) {
        let deadline = Instant::now() + self.settle_wait;

        loop {
            if let Ok(Ok(_)) =
                tokio::time::timeout(READY_POLL_INTERVAL, TcpStream::connect(self.upstream)).await
            {
                return;
            }
            if Instant::now() >= deadline {
                debug!(
                    upstream = %self.upstream,
                    settle_secs = self.settle_wait.as_secs(),
                    "settle window elapsed without upstream accepting, forwarding anyway"
                );
                return;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        pool: Arc<ConnectionPool>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            pool,
            request_timeout,
            shutdown_rx,
        }
    }

    /// Bind and serve until shutdown. Failing to bind the listener is the
    /// one fatal error in the system; it propagates to the caller.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let pool = Arc::clone(&self.pool);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway, pool, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                res = shutdown_rx.changed() => {
                    // A closed channel counts as shutdown, otherwise the
                    // closed-channel Err would fire on every loop pass
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let pool = Arc::clone(&pool);
        let client_addr = addr;
        async move { handle_request(req, gateway, pool, request_timeout, client_addr).await }
    });

    // auto::Builder serves both HTTP/1.1 and h2c on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    gateway: Arc<Gateway>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // Overwrite X-Forwarded-* rather than appending: this proxy is assumed
    // to be the first trusted hop, so client-provided values are spoofing.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

    // Touch the idle clock and wake the container if needed; unknown hosts
    // fall through to the unconditional catch-all forward.
    gateway.activate(&hostname).await;

    let result = tokio::time::timeout(request_timeout, pool.send_request(req)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(hostname, upstream = %pool.upstream(), error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnreachable,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                hostname,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            // Validate length (DNS max is 253 characters)
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Validate characters: alphanumeric, hyphen, and dot only.
            // This prevents log injection and other attacks.
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendEntry;
    use crate::runtime::mock::{snapshot, MockRuntime};
    use crate::runtime::{PortBinding, PortMap};
    use chrono::Utc;
    use http_body_util::Empty;

    fn request_with_host(host: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri("/")
            .header(hyper::header::HOST, host)
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(
            extract_hostname(&request_with_host("Example.COM")),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_hostname(&request_with_host("example.com:8080")),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_hostname(&request_with_host("a-b.c-d.local")),
            Some("a-b.c-d.local".to_string())
        );
    }

    #[test]
    fn test_extract_hostname_rejects_invalid() {
        assert_eq!(extract_hostname(&request_with_host("bad host")), None);
        assert_eq!(extract_hostname(&request_with_host("bad_host")), None);
        assert_eq!(extract_hostname(&request_with_host(&"a".repeat(254))), None);

        let no_host: Request<Empty<Bytes>> =
            Request::builder().uri("/").body(Empty::new()).unwrap();
        assert_eq!(extract_hostname(&no_host), None);
    }

    fn test_bindings() -> PortMap {
        let mut bindings = PortMap::new();
        bindings.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: None,
                host_port: Some("3000".to_string()),
            }],
        );
        bindings
    }

    fn sleeping_entry(id: &str, name: &str) -> BackendEntry {
        BackendEntry {
            identity: id.to_string(),
            name: name.to_string(),
            port_bindings: test_bindings(),
            running: false,
            last_access: Instant::now() - Duration::from_secs(600),
            started_at: Utc::now(),
        }
    }

    /// Gateway pointed at a live throwaway listener, so the readiness poll
    /// succeeds immediately
    async fn gateway_with_live_upstream(
        runtime: Arc<MockRuntime>,
        registry: Arc<Registry>,
    ) -> (Gateway, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        let gateway = Gateway::new(registry, runtime, upstream, Duration::from_secs(5));
        (gateway, listener)
    }

    #[tokio::test]
    async fn test_activate_starts_sleeping_container_with_original_bindings() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot("abc", "web", Some("a.local"), false)]));
        let registry = Arc::new(Registry::new());
        registry.insert("a.local", sleeping_entry("abc", "web"));

        let (gateway, _listener) =
            gateway_with_live_upstream(Arc::clone(&runtime), Arc::clone(&registry)).await;

        let before = Instant::now();
        gateway.activate("a.local").await;

        let starts = runtime.start_calls.lock().clone();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, "abc");
        assert_eq!(starts[0].1, test_bindings());

        let entry = registry.get("a.local").unwrap();
        let guard = entry.lock();
        assert!(guard.running);
        assert!(guard.last_access >= before);
    }

    #[tokio::test]
    async fn test_activate_running_container_only_touches() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot("abc", "web", Some("a.local"), true)]));
        let registry = Arc::new(Registry::new());
        let mut entry = sleeping_entry("abc", "web");
        entry.running = true;
        registry.insert("a.local", entry);

        let (gateway, _listener) =
            gateway_with_live_upstream(Arc::clone(&runtime), Arc::clone(&registry)).await;

        let before = Instant::now();
        gateway.activate("a.local").await;

        assert!(runtime.start_calls.lock().is_empty());
        assert!(registry.get("a.local").unwrap().lock().last_access >= before);
    }

    #[tokio::test]
    async fn test_activate_unknown_host_is_a_no_op() {
        let runtime = Arc::new(MockRuntime::new(vec![]));
        let registry = Arc::new(Registry::new());

        let (gateway, _listener) =
            gateway_with_live_upstream(Arc::clone(&runtime), Arc::clone(&registry)).await;

        gateway.activate("unmanaged.local").await;
        assert!(runtime.start_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_activate_issues_exactly_one_start() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot("abc", "web", Some("a.local"), false)]));
        let registry = Arc::new(Registry::new());
        registry.insert("a.local", sleeping_entry("abc", "web"));

        let (gateway, _listener) =
            gateway_with_live_upstream(Arc::clone(&runtime), Arc::clone(&registry)).await;

        gateway.activate("a.local").await;
        gateway.activate("a.local").await;

        assert_eq!(runtime.start_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_releases_claim_on_start_failure() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot("abc", "web", Some("a.local"), false)]));
        runtime.set_healthy(false);
        let registry = Arc::new(Registry::new());
        registry.insert("a.local", sleeping_entry("abc", "web"));

        let gateway = Gateway::new(
            Arc::clone(&registry),
            Arc::clone(&runtime) as SharedRuntime,
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(50),
        );

        gateway.activate("a.local").await;

        // Claim released so a later request retries the start
        assert!(!registry.get("a.local").unwrap().lock().running);

        runtime.set_healthy(true);
        gateway.activate("a.local").await;
        assert_eq!(runtime.start_calls.lock().len(), 1);
        assert!(registry.get("a.local").unwrap().lock().running);
    }

    #[tokio::test]
    async fn test_server_exits_when_shutdown_sender_is_dropped() {
        let runtime = Arc::new(MockRuntime::new(vec![]));
        let registry = Arc::new(Registry::new());
        let upstream: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let gateway = Arc::new(Gateway::new(
            registry,
            runtime as crate::runtime::SharedRuntime,
            upstream,
            Duration::from_millis(50),
        ));
        let pool = Arc::new(ConnectionPool::new(upstream, crate::pool::PoolConfig::default()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(
            "127.0.0.1:0".parse().unwrap(),
            gateway,
            pool,
            Duration::from_secs(1),
            shutdown_rx,
        );
        let handle = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("server kept running after the shutdown channel closed")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_settle_window_is_bounded_when_upstream_never_accepts() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot("abc", "web", Some("a.local"), false)]));
        let registry = Arc::new(Registry::new());
        registry.insert("a.local", sleeping_entry("abc", "web"));

        // Discard port: nothing will ever accept
        let gateway = Gateway::new(
            Arc::clone(&registry),
            Arc::clone(&runtime) as SharedRuntime,
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(300),
        );

        let started = Instant::now();
        gateway.activate("a.local").await;

        // Returned after roughly the settle window, not stuck forever
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(runtime.start_calls.lock().len(), 1);
        assert!(registry.get("a.local").unwrap().lock().running);
    }
}
