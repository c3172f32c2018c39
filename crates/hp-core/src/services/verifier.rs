use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::models::ExecutorIdentity;
use crate::services::config_source::ConfigSource;
use crate::services::engine::ReservationEngine;
use crate::services::executor_client::ExecutorClient;

/// Periodically compares the engine's beliefs against what executors report
/// and repairs the divergence: dangling reservations are released, untracked
/// usage is backfilled, contradictions are only warned about.
pub struct ReconciliationVerifier {
    config: Arc<ConfigSource>,
    engine: Arc<ReservationEngine>,
    client: Arc<dyn ExecutorClient>,
}

impl ReconciliationVerifier {
    pub fn new(
        config: Arc<ConfigSource>,
        engine: Arc<ReservationEngine>,
        client: Arc<dyn ExecutorClient>,
    ) -> Self {
        Self {
            config,
            engine,
            client,
        }
    }

    /// One reconciliation pass. Idempotent: a second pass over unchanged
    /// reports performs no transitions and emits no further dangling or
    /// backfill log lines.
    pub async fn run_pass(&self) {
        // Registry executors plus anyone still owning a tracked reservation,
        // so an executor evicted from the config repo keeps being reconciled
        // until its last reservation clears.
        let mut interesting: Vec<ExecutorIdentity> = self
            .config
            .current()
            .await
            .map(|s| s.executors.clone())
            .unwrap_or_default();
        for executor in self.engine.tracked_executors() {
            if !interesting.contains(&executor) {
                interesting.push(executor);
            }
        }

        // Query each executor independently; one unreachable peer must not
        // block the rest. Its retry is simply the next pass.
        let mut usage: Vec<(ExecutorIdentity, HashSet<String>)> = Vec::new();
        for executor in &interesting {
            match self.client.report_usage(executor).await {
                Ok(hosts) => {
                    debug!(executor = %executor, hosts = hosts.len(), "usage report");
                    usage.push((executor.clone(), hosts.into_iter().collect()));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        executor = %executor,
                        error = %e,
                        "usage query failed; skipping executor until next pass"
                    );
                }
                Err(e) => {
                    warn!(
                        executor = %executor,
                        error = %e,
                        "usage query rejected; skipping executor"
                    );
                }
            }
        }

        // A host reported by more than one executor is contradictory state;
        // picking a winner could revoke a host under a running job, so warn
        // and leave every reservation on it untouched this pass.
        let mut reporters: HashMap<&str, Vec<&str>> = HashMap::new();
        for (executor, hosts) in &usage {
            for host in hosts {
                reporters.entry(host).or_default().push(&executor.name);
            }
        }
        let collisions: HashSet<String> = reporters
            .iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(host, names)| {
                warn!(
                    host = %host,
                    executors = ?names,
                    "host claimed by multiple executors; leaving state untouched"
                );
                host.to_string()
            })
            .collect();

        // Dangling: tracked ACTIVE the owner no longer reports.
        for (executor, reported) in &usage {
            for (id, host) in self.engine.active_for(executor) {
                if collisions.contains(&host) || reported.contains(&host) {
                    continue;
                }
                if self.engine.complete(id) {
                    info!(
                        host = %host,
                        executor = %executor,
                        "released dangling reservation"
                    );
                }
            }
        }

        // Backfill: reported usage nobody tracks for that executor.
        for (executor, reported) in &usage {
            self.engine.prune_stale_backfills(executor, reported);
            for host in reported {
                if collisions.contains(host) || self.engine.has_reservation_for(executor, host) {
                    continue;
                }
                if self.engine.queue_backfill(executor, host) {
                    info!(
                        host = %host,
                        executor = %executor,
                        "backfilling untracked reservation"
                    );
                }
            }
        }

        self.engine.schedule().await;
    }
}
