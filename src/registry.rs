//! The container registry: the single piece of state shared by the gateway,
//! the reaper and the runtime synchronizer.
//!
//! Two indices (virtual host, container identity) over one logical set of
//! entries. Entries are created only by the initial scan; stopping a
//! container never removes its entry, so it can be woken again later.

use crate::runtime::{EventStatus, PortMap, RuntimeEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-backend metadata tracked by the proxy
#[derive(Debug, Clone)]
pub struct BackendEntry {
    /// Opaque container identifier assigned by the runtime
    pub identity: String,
    /// Display name, valid for runtime lookups that accept names
    pub name: String,
    /// Port bindings recorded at scan time, replayed on start
    pub port_bindings: PortMap,
    /// Last-known liveness state
    pub running: bool,
    /// Updated on every proxied request
    pub last_access: Instant,
    /// Runtime start timestamp, used only to break virtual-host ties
    pub started_at: DateTime<Utc>,
}

impl BackendEntry {
    /// Short identity for log lines, matching the runtime's abbreviated ids
    pub fn short_id(&self) -> &str {
        let end = self.identity.len().min(12);
        &self.identity[..end]
    }

    /// Whether this entry has been untouched strictly longer than `threshold`.
    ///
    /// The comparison is `>`, not `>=`: an entry whose last access is exactly
    /// `threshold` ago is not yet eligible for stopping.
    pub fn idle_beyond(&self, threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > threshold
    }
}

pub type SharedEntry = Arc<Mutex<BackendEntry>>;

struct Indices {
    by_host: HashMap<String, SharedEntry>,
    by_identity: HashMap<String, SharedEntry>,
}

/// In-memory store mapping virtual hosts and container identities to shared
/// [`BackendEntry`] values.
///
/// The outer lock guards index membership (insert and collision eviction span
/// both maps); the per-entry mutex guards field mutation. Lock order is
/// always index lock first, entry lock second, and neither is held across an
/// await point.
pub struct Registry {
    inner: RwLock<Indices>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indices {
                by_host: HashMap::new(),
                by_identity: HashMap::new(),
            }),
        }
    }

    /// Insert an entry discovered by the full scan.
    ///
    /// Collision policy: when two containers declare the same virtual host,
    /// the one with the strictly newer `started_at` wins both indices and the
    /// loser's identity is evicted from the identity index. Ties keep the
    /// incumbent, which makes a repeated scan over unchanged runtime state a
    /// no-op.
    pub fn insert(&self, vhost: &str, entry: BackendEntry) {
        let mut indices = self.inner.write();

        if let Some(existing) = indices.by_host.get(vhost).cloned() {
            let (existing_id, existing_started, existing_short) = {
                let guard = existing.lock();
                (guard.identity.clone(), guard.started_at, guard.short_id().to_string())
            };

            if existing_id == entry.identity {
                // Same container re-scanned; refresh every runtime-derived
                // field in place, keeping the shared allocation
                let mut guard = existing.lock();
                guard.name = entry.name;
                guard.port_bindings = entry.port_bindings;
                guard.running = entry.running;
                guard.started_at = entry.started_at;
                return;
            }

            warn!(
                vhost,
                container_id = entry.short_id(),
                existing_id = %existing_short,
                "duplicate VIRTUAL_HOST declaration"
            );

            if existing_started < entry.started_at {
                warn!(
                    vhost,
                    container_id = entry.short_id(),
                    "most recently started container wins the route"
                );
                indices.by_identity.remove(&existing_id);
            } else {
                warn!(
                    vhost,
                    container_id = %existing_short,
                    "keeping the most recently started container"
                );
                return;
            }
        }

        let identity = entry.identity.clone();
        let shared: SharedEntry = Arc::new(Mutex::new(entry));
        indices.by_host.insert(vhost.to_string(), Arc::clone(&shared));
        indices.by_identity.insert(identity, shared);
    }

    pub fn get(&self, vhost: &str) -> Option<SharedEntry> {
        self.inner.read().by_host.get(vhost).cloned()
    }

    pub fn get_by_identity(&self, id: &str) -> Option<SharedEntry> {
        self.inner.read().by_identity.get(id).cloned()
    }

    pub fn contains_identity(&self, id: &str) -> bool {
        self.inner.read().by_identity.contains_key(id)
    }

    /// Reset the idle clock for a host. Returns false for unmanaged hosts.
    pub fn touch(&self, vhost: &str) -> bool {
        match self.get(vhost) {
            Some(entry) => {
                entry.lock().last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Apply a runtime lifecycle event. Events for identities this registry
    /// never tracked are ignored; those containers are not proxy targets.
    /// Returns whether the event was applied.
    pub fn apply_event(&self, event: &RuntimeEvent) -> bool {
        let Some(entry) = self.get_by_identity(&event.id) else {
            return false;
        };

        let mut guard = entry.lock();
        match event.status {
            EventStatus::Start => guard.running = true,
            EventStatus::Stop | EventStatus::Die => guard.running = false,
        }
        true
    }

    /// Snapshot of the host index for iteration outside the lock
    pub fn entries(&self) -> Vec<(String, SharedEntry)> {
        self.inner
            .read()
            .by_host
            .iter()
            .map(|(host, entry)| (host.clone(), Arc::clone(entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_host.is_empty()
    }
}
