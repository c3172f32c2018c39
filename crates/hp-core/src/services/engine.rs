use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::models::{
    ExecutorIdentity, Reservation, ReservationState, ReservationTarget, ReservationTask,
    WorkloadItem,
};
use crate::services::config_source::ConfigSource;
use crate::services::executor_client::ExecutorClient;
use crate::services::inventory::{HostInventory, OccupyOutcome};

/// Models every claim of a pool host by an executor as a QUEUED → ACTIVE →
/// COMPLETE state machine (QUEUED → CANCELLED as the alternate terminal).
///
/// Terminal reservations are pruned from the table on transition, so a
/// concurrent second release simply finds nothing and is a no-op. The
/// inventory's occupancy seam provides the at-most-one-occupant guarantee;
/// lock order is always reservations before inventory, and no RPC is made
/// while either is held.
pub struct ReservationEngine {
    config: Arc<ConfigSource>,
    inventory: Arc<HostInventory>,
    client: Arc<dyn ExecutorClient>,
    reservations: Mutex<BTreeMap<u64, Reservation>>,
    next_id: AtomicU64,
}

impl ReservationEngine {
    pub fn new(
        config: Arc<ConfigSource>,
        inventory: Arc<HostInventory>,
        client: Arc<dyn ExecutorClient>,
    ) -> Self {
        Self {
            config,
            inventory,
            client,
            reservations: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inbound `reportWorkload`: reconcile this executor's queued demand
    /// against its latest report, then run a scheduling pass.
    ///
    /// Per label, the queued normal tasks are trimmed to the reported count
    /// (QUEUED → CANCELLED; never touches ACTIVE) and topped up with new
    /// QUEUED tasks for the deficit. An executor is admitted if the current
    /// Snapshot's registry lists it, or if it still owns a live reservation
    /// (so an evicted executor can drain).
    pub async fn report_workload(
        &self,
        requester: &ExecutorIdentity,
        pending: &[WorkloadItem],
    ) -> Result<()> {
        let registered = self
            .config
            .current()
            .await
            .map_or(false, |s| s.is_member(requester));
        if !registered && !self.owns_live_reservation(requester) {
            return Err(PoolError::NotAMember(requester.name.clone()));
        }

        {
            let mut reservations = self.reservations.lock().unwrap();

            let mut desired: HashMap<&str, usize> = HashMap::new();
            for item in pending {
                *desired.entry(item.label.as_str()).or_default() += 1;
            }

            // An executor keeps reporting a claim while its bound host is
            // still spinning up, so ACTIVE reservations offset the demand
            // before the queued trim; otherwise a restated report books the
            // same claim twice.
            for reservation in reservations.values() {
                if !reservation.is_active()
                    || reservation.task.backfill
                    || reservation.task.requester != *requester
                {
                    continue;
                }
                if let ReservationTarget::Label(label) = &reservation.task.target {
                    if let Some(count) = desired.get_mut(label.as_str()) {
                        *count = count.saturating_sub(1);
                    }
                }
            }

            let mut cancelled: Vec<u64> = Vec::new();
            for (id, reservation) in reservations.iter() {
                if !reservation.is_queued()
                    || reservation.task.backfill
                    || reservation.task.requester != *requester
                {
                    continue;
                }
                let ReservationTarget::Label(label) = &reservation.task.target else {
                    continue;
                };
                match desired.get_mut(label.as_str()) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => cancelled.push(*id),
                }
            }
            for id in cancelled {
                if let Some(mut reservation) = reservations.remove(&id) {
                    reservation.state = ReservationState::Cancelled;
                    info!(
                        reservation = id,
                        executor = %requester,
                        "cancelled queued reservation no longer demanded"
                    );
                }
            }

            for (label, count) in desired {
                for _ in 0..count {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let task = ReservationTask::demand(requester.clone(), label);
                    debug!(reservation = id, executor = %requester, label, "queued reservation");
                    reservations.insert(id, Reservation::new(id, task));
                }
            }
        }

        self.schedule().await;
        Ok(())
    }

    /// Queue a backfill reservation for one named host, created by the
    /// verifier to make bookkeeping match the executor's report. Returns
    /// false if an equivalent live reservation already exists.
    pub fn queue_backfill(&self, requester: &ExecutorIdentity, host: &str) -> bool {
        let mut reservations = self.reservations.lock().unwrap();
        if reservations
            .values()
            .any(|r| tracks(r, requester, host))
        {
            return false;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = ReservationTask::backfill(requester.clone(), host);
        reservations.insert(id, Reservation::new(id, task));
        true
    }

    /// Drop queued backfills for this executor whose host is no longer in
    /// its report.
    pub fn prune_stale_backfills(&self, requester: &ExecutorIdentity, reported: &HashSet<String>) {
        let mut reservations = self.reservations.lock().unwrap();
        reservations.retain(|id, r| {
            let stale = r.is_queued()
                && r.task.backfill
                && r.task.requester == *requester
                && matches!(&r.task.target, ReservationTarget::Host(h) if !reported.contains(h));
            if stale {
                info!(reservation = *id, executor = %requester, "dropped stale backfill");
            }
            !stale
        });
    }

    /// One scheduling pass: bind queued tasks to hosts in FIFO id order.
    ///
    /// Normal tasks take any idle host whose label matches; backfill tasks
    /// take exactly their named host and wait while it is still draining a
    /// stale occupant. Utilize notifications go out after every lock is
    /// dropped; a failed notify is left for the verifier to straighten out.
    pub async fn schedule(&self) {
        let mut notices: Vec<(ExecutorIdentity, String, String)> = Vec::new();
        {
            let mut reservations = self.reservations.lock().unwrap();
            let mut vanished: Vec<u64> = Vec::new();

            for (id, reservation) in reservations.iter_mut() {
                if !reservation.is_queued() {
                    continue;
                }
                let bound = match &reservation.task.target {
                    ReservationTarget::Label(label) => {
                        self.inventory.try_occupy_matching(label, *id)
                    }
                    ReservationTarget::Host(name) => {
                        match self.inventory.try_occupy_named(name, *id) {
                            OccupyOutcome::Bound => Some(name.clone()),
                            OccupyOutcome::Busy => None,
                            OccupyOutcome::Missing => {
                                warn!(
                                    host = %name,
                                    "backfill target vanished from inventory; cancelling"
                                );
                                vanished.push(*id);
                                None
                            }
                        }
                    }
                };
                let Some(host) = bound else { continue };

                reservation.state = ReservationState::Active;
                reservation.host = Some(host.clone());
                reservation.started_at = Some(Utc::now());
                info!(
                    reservation = *id,
                    host = %host,
                    executor = %reservation.task.requester,
                    backfill = reservation.task.backfill,
                    "reservation active"
                );
                let label = self
                    .inventory
                    .get(&host)
                    .map(|h| h.label)
                    .unwrap_or_default();
                notices.push((reservation.task.requester.clone(), host, label));
            }

            for id in vanished {
                reservations.remove(&id);
            }
        }

        for (executor, host, label) in notices {
            if let Err(e) = self.client.utilize_host(&executor, &host, &label).await {
                warn!(
                    host = %host,
                    executor = %executor,
                    error = %e,
                    "utilize notification failed; reconciliation will repair"
                );
            }
        }
    }

    /// Inbound `returnNode`: explicit release from the owning executor.
    /// Releasing a host with no active reservation is an idempotent no-op.
    pub async fn return_host(&self, host: &str) -> Result<()> {
        if let Some(id) = self.complete_on(host) {
            debug!(reservation = id, host, "released by executor");
            self.schedule().await;
        }
        Ok(())
    }

    /// ACTIVE → COMPLETE for one reservation id, freeing its host. Returns
    /// false if the reservation is gone or not active (second trigger of a
    /// concurrent release lands here).
    pub fn complete(&self, id: u64) -> bool {
        let reservation = {
            let mut reservations = self.reservations.lock().unwrap();
            let active = reservations.get(&id).is_some_and(|r| r.is_active());
            if !active {
                return false;
            }
            reservations.remove(&id)
        };
        let Some(mut reservation) = reservation else {
            return false;
        };
        reservation.state = ReservationState::Complete;
        reservation.completed_at = Some(Utc::now());
        if let Some(host) = &reservation.host {
            self.inventory.release(host, id);
        }
        true
    }

    fn complete_on(&self, host: &str) -> Option<u64> {
        let id = {
            let reservations = self.reservations.lock().unwrap();
            reservations
                .values()
                .find(|r| r.is_active() && r.host.as_deref() == Some(host))
                .map(|r| r.id)?
        };
        self.complete(id).then_some(id)
    }

    /// `(id, host)` pairs of this executor's ACTIVE reservations.
    pub fn active_for(&self, executor: &ExecutorIdentity) -> Vec<(u64, String)> {
        let reservations = self.reservations.lock().unwrap();
        reservations
            .values()
            .filter(|r| r.is_active() && r.task.requester == *executor)
            .filter_map(|r| r.host.clone().map(|h| (r.id, h)))
            .collect()
    }

    /// Executors owning any live (queued or active) reservation.
    pub fn tracked_executors(&self) -> Vec<ExecutorIdentity> {
        let reservations = self.reservations.lock().unwrap();
        let mut executors: Vec<ExecutorIdentity> = Vec::new();
        for reservation in reservations.values() {
            if !executors.contains(&reservation.task.requester) {
                executors.push(reservation.task.requester.clone());
            }
        }
        executors
    }

    /// True when a live reservation already accounts for (executor, host):
    /// either ACTIVE on it, or a queued backfill targeting it.
    pub fn has_reservation_for(&self, executor: &ExecutorIdentity, host: &str) -> bool {
        let reservations = self.reservations.lock().unwrap();
        reservations.values().any(|r| tracks(r, executor, host))
    }

    /// Snapshot of all live reservations, in id order.
    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations.lock().unwrap().values().cloned().collect()
    }

    fn owns_live_reservation(&self, executor: &ExecutorIdentity) -> bool {
        let reservations = self.reservations.lock().unwrap();
        reservations
            .values()
            .any(|r| r.task.requester == *executor)
    }
}

fn tracks(reservation: &Reservation, executor: &ExecutorIdentity, host: &str) -> bool {
    if reservation.task.requester != *executor {
        return false;
    }
    if reservation.is_active() {
        return reservation.host.as_deref() == Some(host);
    }
    reservation.is_queued()
        && reservation.task.backfill
        && matches!(&reservation.task.target, ReservationTarget::Host(h) if h == host)
}
