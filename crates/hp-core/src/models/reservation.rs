use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::ExecutorIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReservationState {
    Queued,
    Active,
    Complete,
    Cancelled,
}

/// What a task wants bound: any idle host carrying a label (normal demand),
/// or one specific host by name (verifier backfill).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReservationTarget {
    Label(String),
    Host(String),
}

/// One claim request from one executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationTask {
    pub requester: ExecutorIdentity,
    pub target: ReservationTarget,
    pub backfill: bool,
}

impl ReservationTask {
    pub fn demand(requester: ExecutorIdentity, label: impl Into<String>) -> Self {
        Self {
            requester,
            target: ReservationTarget::Label(label.into()),
            backfill: false,
        }
    }

    pub fn backfill(requester: ExecutorIdentity, host: impl Into<String>) -> Self {
        Self {
            requester,
            target: ReservationTarget::Host(host.into()),
            backfill: true,
        }
    }
}

/// A task plus its binding lifecycle. `host` is set on entering ACTIVE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: u64,
    pub task: ReservationTask,
    pub state: ReservationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(id: u64, task: ReservationTask) -> Self {
        Self {
            id,
            task,
            state: ReservationState::Queued,
            host: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.state == ReservationState::Queued
    }

    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active
    }
}

/// One pending claim from an executor's reported workload. The orchestrator
/// consumes demand only as a count of these per label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadItem {
    pub label: String,
}

impl WorkloadItem {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}
