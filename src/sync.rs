//! Runtime synchronizer: keeps the registry consistent with the container
//! runtime through a one-time full scan and a continuous event subscription.
//!
//! The event stream is the low-latency path for externally triggered stops
//! and starts; the full scan only runs once because establishing the
//! virtual-host mapping requires inspecting configuration that events do not
//! carry.

use crate::registry::{BackendEntry, Registry};
use crate::runtime::{ContainerRuntime, RuntimeError, SharedRuntime};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const VIRTUAL_HOST_KEY: &str = "VIRTUAL_HOST";

/// Split a `KEY`, `KEY=`, `KEY=VALUE` or `KEY=NESTED_KEY=VALUE2` environment
/// entry at its first `=`. Bare keys get an empty value.
pub fn split_env_entry(entry: &str) -> (&str, &str) {
    match entry.split_once('=') {
        Some((key, value)) => (key, value),
        None => (entry, ""),
    }
}

/// The virtual host a container declares through its environment, if any.
/// Later declarations shadow earlier ones.
pub fn declared_virtual_host(env: &[String]) -> Option<String> {
    let mut vhost = None;
    for entry in env {
        let (key, value) = split_env_entry(entry);
        if key == VIRTUAL_HOST_KEY {
            vhost = Some(value);
        }
    }
    vhost.filter(|v| !v.is_empty()).map(String::from)
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Enumerate every container the runtime knows (running and stopped) and
/// register those declaring a virtual host. Containers without the
/// declaration are not proxy targets; containers that fail inspection are
/// skipped for this scan. Returns the resulting registry size.
pub async fn scan_runtime(
    runtime: &dyn ContainerRuntime,
    registry: &Registry,
) -> Result<usize, RuntimeError> {
    let ids = runtime.list_all().await?;

    for id in ids {
        let snapshot = match runtime.inspect(&id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(container_id = short(&id), error = %e, "failed to inspect container");
                continue;
            }
        };

        let Some(vhost) = declared_virtual_host(&snapshot.env) else {
            continue;
        };

        debug!(
            vhost,
            container_id = short(&snapshot.id),
            name = %snapshot.name,
            running = snapshot.running,
            "discovered managed container"
        );

        registry.insert(
            &vhost,
            BackendEntry {
                identity: snapshot.id,
                name: snapshot.name,
                port_bindings: snapshot.port_bindings,
                running: snapshot.running,
                last_access: Instant::now(),
                started_at: snapshot.started_at,
            },
        );
    }

    Ok(registry.len())
}

/// Connection state of the synchronizer, observable for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Watching,
}

/// Long-lived background task reconciling the registry with the runtime.
///
/// Two states: Disconnected (probe with fixed backoff) and Watching
/// (subscribed to the event stream, re-probing periodically). The initial
/// full scan runs on the first successful probe, so an unreachable runtime
/// at boot is transient rather than fatal. The loop only exits through the
/// shutdown channel.
pub struct Synchronizer {
    runtime: SharedRuntime,
    registry: Arc<Registry>,
    backoff: Duration,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SyncState>,
}

impl Synchronizer {
    pub fn new(
        runtime: SharedRuntime,
        registry: Arc<Registry>,
        backoff: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Disconnected);
        Self {
            runtime,
            registry,
            backoff,
            shutdown_rx,
            state_tx,
        }
    }

    /// Observe Disconnected/Watching transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub async fn run(mut self) {
        let mut scanned = false;

        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }

            if let Err(e) = self.runtime.ping().await {
                warn!(error = %e, "unable to reach container runtime");
                if !self.pause().await {
                    return;
                }
                continue;
            }

            if !scanned {
                match scan_runtime(self.runtime.as_ref(), &self.registry).await {
                    Ok(count) => {
                        scanned = true;
                        info!(backends = count, "registry built from runtime state");
                    }
                    Err(e) => {
                        warn!(error = %e, "initial container scan failed");
                        if !self.pause().await {
                            return;
                        }
                        continue;
                    }
                }
            }

            let mut events = match self.runtime.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "failed to subscribe to runtime events");
                    if !self.pause().await {
                        return;
                    }
                    continue;
                }
            };

            let _ = self.state_tx.send(SyncState::Watching);
            info!("watching container runtime events");

            let mut probe = tokio::time::interval(self.backoff);
            probe.tick().await; // absorb the immediate first tick

            loop {
                tokio::select! {
                    res = self.shutdown_rx.changed() => {
                        if res.is_err() || *self.shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = probe.tick() => {
                        if let Err(e) = self.runtime.ping().await {
                            warn!(error = %e, "liveness probe failed, dropping event subscription");
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            if self.registry.apply_event(&event) {
                                info!(
                                    status = ?event.status,
                                    container_id = short(&event.id),
                                    "applied runtime event"
                                );
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "runtime event stream error");
                            break;
                        }
                        None => {
                            warn!("runtime event stream closed");
                            break;
                        }
                    }
                }
            }

            let _ = self.state_tx.send(SyncState::Disconnected);
            if !self.pause().await {
                return;
            }
        }
    }

    /// Back off for the configured interval. Returns false when shutdown was
    /// requested during the pause.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => true,
            res = self.shutdown_rx.changed() => res.is_ok() && !*self.shutdown_rx.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{snapshot, MockRuntime};
    use crate::runtime::{EventStatus, RuntimeEvent};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_split_env_entry() {
        assert_eq!(split_env_entry("KEY=VALUE"), ("KEY", "VALUE"));
        assert_eq!(split_env_entry("KEY="), ("KEY", ""));
        assert_eq!(split_env_entry("KEY"), ("KEY", ""));
        assert_eq!(
            split_env_entry("KEY=NESTED_KEY=VALUE2"),
            ("KEY", "NESTED_KEY=VALUE2")
        );
    }

    #[test]
    fn test_declared_virtual_host() {
        let env = vec![
            "PATH=/usr/bin".to_string(),
            "VIRTUAL_HOST=a.local".to_string(),
        ];
        assert_eq!(declared_virtual_host(&env), Some("a.local".to_string()));

        // Later declarations shadow earlier ones
        let env = vec![
            "VIRTUAL_HOST=a.local".to_string(),
            "VIRTUAL_HOST=b.local".to_string(),
        ];
        assert_eq!(declared_virtual_host(&env), Some("b.local".to_string()));

        // Empty or absent declarations do not create a proxy target
        assert_eq!(declared_virtual_host(&["VIRTUAL_HOST=".to_string()]), None);
        assert_eq!(declared_virtual_host(&["VIRTUAL_HOST".to_string()]), None);
        assert_eq!(declared_virtual_host(&["PATH=/usr/bin".to_string()]), None);
        assert_eq!(declared_virtual_host(&[]), None);
    }

    #[tokio::test]
    async fn test_scan_ignores_undeclared_containers() {
        let runtime = MockRuntime::new(vec![
            snapshot("aaa", "web", Some("a.local"), true),
            snapshot("bbb", "db", None, true),
        ]);
        let registry = Registry::new();

        let count = scan_runtime(&runtime, &registry).await.unwrap();
        assert_eq!(count, 1);
        assert!(registry.get("a.local").is_some());
        assert!(!registry.contains_identity("bbb"));
    }

    #[tokio::test]
    async fn test_scan_resolves_collisions_by_start_time() {
        let mut older = snapshot("old-id", "web-old", Some("a.local"), false);
        older.started_at = Utc.timestamp_opt(100, 0).unwrap();
        let mut newer = snapshot("new-id", "web-new", Some("a.local"), true);
        newer.started_at = Utc.timestamp_opt(200, 0).unwrap();

        let runtime = MockRuntime::new(vec![older, newer]);
        let registry = Registry::new();

        scan_runtime(&runtime, &registry).await.unwrap();

        assert_eq!(registry.len(), 1);
        let entry = registry.get("a.local").unwrap();
        assert_eq!(entry.lock().identity, "new-id");
        assert!(registry.contains_identity("new-id"));
        assert!(!registry.contains_identity("old-id"));
    }

    #[tokio::test]
    async fn test_scan_is_idempotent() {
        let mut older = snapshot("old-id", "web-old", Some("a.local"), false);
        older.started_at = Utc.timestamp_opt(100, 0).unwrap();
        let mut newer = snapshot("new-id", "web-new", Some("a.local"), true);
        newer.started_at = Utc.timestamp_opt(200, 0).unwrap();
        let other = snapshot("other", "api", Some("b.local"), true);

        let runtime = MockRuntime::new(vec![older, newer, other]);
        let registry = Registry::new();

        scan_runtime(&runtime, &registry).await.unwrap();
        let first: Vec<(String, String, bool)> = {
            let mut v: Vec<_> = registry
                .entries()
                .into_iter()
                .map(|(host, e)| {
                    let g = e.lock();
                    (host, g.identity.clone(), g.running)
                })
                .collect();
            v.sort();
            v
        };

        // Second scan over unchanged runtime state
        scan_runtime(&runtime, &registry).await.unwrap();
        let second: Vec<(String, String, bool)> = {
            let mut v: Vec<_> = registry
                .entries()
                .into_iter()
                .map(|(host, e)| {
                    let g = e.lock();
                    (host, g.identity.clone(), g.running)
                })
                .collect();
            v.sort();
            v
        };

        assert_eq!(first, second);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_fails_when_runtime_unreachable() {
        let runtime = MockRuntime::new(vec![snapshot("aaa", "web", Some("a.local"), true)]);
        runtime.set_healthy(false);
        let registry = Registry::new();

        assert!(scan_runtime(&runtime, &registry).await.is_err());
        assert!(registry.is_empty());
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SyncState>, want: SyncState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow() != want {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("synchronizer never reached {:?}", want));
    }

    #[tokio::test]
    async fn test_disconnection_recovery() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot(
            "aaa", "web", Some("a.local"), false,
        )]));
        let registry = Arc::new(Registry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Start unreachable: the synchronizer must sit in Disconnected
        runtime.set_healthy(false);

        let sync = Synchronizer::new(
            Arc::clone(&runtime) as SharedRuntime,
            Arc::clone(&registry),
            Duration::from_millis(20),
            shutdown_rx,
        );
        let mut state_rx = sync.subscribe_state();
        let handle = tokio::spawn(sync.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*state_rx.borrow(), SyncState::Disconnected);
        assert!(registry.is_empty());

        // Runtime comes back: scan runs, subscription established
        let events = runtime.event_channel();
        runtime.set_healthy(true);
        wait_for_state(&mut state_rx, SyncState::Watching).await;
        assert_eq!(registry.len(), 1);

        // Event delivery works
        events
            .send(Ok(RuntimeEvent {
                id: "aaa".into(),
                status: EventStatus::Start,
            }))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if registry.get("a.local").unwrap().lock().running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event never applied");

        // Runtime goes away again: probe failure drops the subscription
        runtime.set_healthy(false);
        drop(events);
        wait_for_state(&mut state_rx, SyncState::Disconnected).await;

        // And a second recovery resumes event delivery
        let events = runtime.event_channel();
        runtime.set_healthy(true);
        wait_for_state(&mut state_rx, SyncState::Watching).await;

        events
            .send(Ok(RuntimeEvent {
                id: "aaa".into(),
                status: EventStatus::Die,
            }))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !registry.get("a.local").unwrap().lock().running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event after recovery never applied");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("synchronizer did not shut down")
            .unwrap();
    }

    #[tokio::test]
    async fn test_events_for_unknown_identities_leave_registry_unchanged() {
        let runtime = Arc::new(MockRuntime::new(vec![snapshot(
            "known", "web", Some("a.local"), false,
        )]));
        let registry = Arc::new(Registry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let events = runtime.event_channel();
        let sync = Synchronizer::new(
            Arc::clone(&runtime) as SharedRuntime,
            Arc::clone(&registry),
            Duration::from_millis(20),
            shutdown_rx,
        );
        let mut state_rx = sync.subscribe_state();
        let handle = tokio::spawn(sync.run());

        wait_for_state(&mut state_rx, SyncState::Watching).await;

        events
            .send(Ok(RuntimeEvent {
                id: "stranger".into(),
                status: EventStatus::Start,
            }))
            .unwrap();
        // A subsequent event for the known id proves the first was processed
        events
            .send(Ok(RuntimeEvent {
                id: "known".into(),
                status: EventStatus::Start,
            }))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if registry.get("a.local").unwrap().lock().running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("known-id event never applied");

        assert_eq!(registry.len(), 1);
        assert!(!registry.contains_identity("stranger"));

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
