use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::PoolError;
use crate::models::{ShareableHost, Snapshot};

/// Outcome of binding a reservation to one named host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupyOutcome {
    Bound,
    Busy,
    Missing,
}

/// The orchestrator's live set of shareable hosts.
///
/// Entities are created when first seen in a Snapshot, mutated in place on
/// later Snapshots, and soft-deleted when they disappear; hard deletion
/// waits until the occupying reservation completes. All occupancy mutation
/// happens under the single map mutex, which is what enforces
/// at-most-one-occupant-per-host at bind time.
pub struct HostInventory {
    hosts: Mutex<HashMap<String, ShareableHost>>,
    applied_version: Mutex<Option<String>>,
    sync_error: Mutex<Option<String>>,
}

impl HostInventory {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            applied_version: Mutex::new(None),
            sync_error: Mutex::new(None),
        }
    }

    /// Bring the host set in line with a Snapshot. A repeated call with the
    /// same `source_version` is a pure no-op.
    pub fn reconcile(&self, snapshot: &Snapshot) {
        let mut applied = self.applied_version.lock().unwrap();
        if applied.as_deref() == Some(snapshot.source_version.as_str()) {
            return;
        }

        let mut hosts = self.hosts.lock().unwrap();
        for (name, definition) in &snapshot.hosts {
            match hosts.get_mut(name) {
                Some(host) => {
                    // Update in place: identity and occupancy survive.
                    host.label = definition.label.clone();
                    host.definition = definition.clone();
                    host.pending_removal = false;
                }
                None => {
                    debug!(host = %name, label = %definition.label, "host joined the pool");
                    hosts.insert(name.clone(), ShareableHost::new(definition.clone()));
                }
            }
        }
        hosts.retain(|name, host| {
            if snapshot.hosts.contains_key(name) {
                return true;
            }
            if host.is_idle() {
                info!(host = %name, "host left the pool config; removed");
                false
            } else {
                info!(host = %name, "host left the pool config; removal deferred until released");
                host.pending_removal = true;
                true
            }
        });

        *applied = Some(snapshot.source_version.clone());
    }

    /// Remove pending-removal hosts that have become idle.
    pub fn sweep(&self) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.retain(|name, host| {
            if host.pending_removal && host.is_idle() {
                info!(host = %name, "removed host after deferred deletion");
                false
            } else {
                true
            }
        });
    }

    /// Bind `reservation` to the idle non-pending host with the smallest
    /// name whose label atoms contain `label`. Returns the host name.
    pub fn try_occupy_matching(&self, label: &str, reservation: u64) -> Option<String> {
        let mut hosts = self.hosts.lock().unwrap();
        let name = hosts
            .values()
            .filter(|h| h.is_idle() && !h.pending_removal && h.matches_label(label))
            .map(|h| h.name.clone())
            .min()?;
        hosts.get_mut(&name)?.occupant = Some(reservation);
        Some(name)
    }

    /// Bind `reservation` to one specific host. Used by backfill, which may
    /// target a pending-removal host: the executor factually uses it, and
    /// deferred deletion needs the occupancy tracked.
    pub fn try_occupy_named(&self, name: &str, reservation: u64) -> OccupyOutcome {
        let mut hosts = self.hosts.lock().unwrap();
        match hosts.get_mut(name) {
            None => OccupyOutcome::Missing,
            Some(host) if !host.is_idle() => OccupyOutcome::Busy,
            Some(host) => {
                host.occupant = Some(reservation);
                OccupyOutcome::Bound
            }
        }
    }

    /// Clear the occupancy `reservation` holds on `name`, removing the host
    /// right away if its deletion was deferred. A mismatched or absent
    /// occupancy is a no-op.
    pub fn release(&self, name: &str, reservation: u64) {
        let mut hosts = self.hosts.lock().unwrap();
        let pending = {
            let Some(host) = hosts.get_mut(name) else {
                return;
            };
            if host.occupant != Some(reservation) {
                return;
            }
            host.occupant = None;
            host.pending_removal
        };
        if pending {
            info!(host = %name, "removed host after deferred deletion");
            hosts.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<ShareableHost> {
        self.hosts.lock().unwrap().get(name).cloned()
    }

    /// Cheap clone of all hosts, sorted by name.
    pub fn hosts(&self) -> Vec<ShareableHost> {
        let mut all: Vec<ShareableHost> = self.hosts.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_sync_error(&self, error: &PoolError) {
        *self.sync_error.lock().unwrap() = Some(error.to_string());
    }

    pub fn clear_sync_error(&self) {
        *self.sync_error.lock().unwrap() = None;
    }

    /// The last config sync failure, for operator visibility. A failed sync
    /// never touches the host set itself.
    pub fn current_error(&self) -> Option<String> {
        self.sync_error.lock().unwrap().clone()
    }
}

impl Default for HostInventory {
    fn default() -> Self {
        Self::new()
    }
}
