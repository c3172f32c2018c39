//! End-to-end flow over a real on-disk config layout: sync → inventory →
//! workload → binding → reconciliation, plus config-change behavior for
//! hosts that are in use.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use hp_core::error::{PoolError, Result};
use hp_core::models::{ExecutorIdentity, WorkloadItem};
use hp_core::services::config_source::{parse_layout, ConfigSource};
use hp_core::services::engine::ReservationEngine;
use hp_core::services::executor_client::{DiscoverReport, ExecutorClient};
use hp_core::services::inventory::HostInventory;
use hp_core::services::verifier::ReconciliationVerifier;

const POOL: &str = "https://orchestrator.example.com";

#[derive(Default)]
struct RecordingClient {
    usage: Mutex<HashMap<String, Vec<String>>>,
    utilized: Mutex<Vec<(String, String)>>,
}

impl RecordingClient {
    fn set_usage(&self, executor: &str, hosts: &[&str]) {
        self.usage.lock().unwrap().insert(
            executor.to_string(),
            hosts.iter().map(|h| h.to_string()).collect(),
        );
    }
}

#[async_trait]
impl ExecutorClient for RecordingClient {
    async fn discover(&self, executor: &ExecutorIdentity) -> Result<DiscoverReport> {
        Ok(DiscoverReport {
            version: "test".into(),
            pool_fingerprint: executor.pool_fingerprint.clone(),
        })
    }

    async fn report_usage(&self, executor: &ExecutorIdentity) -> Result<Vec<String>> {
        self.usage
            .lock()
            .unwrap()
            .get(&executor.name)
            .cloned()
            .ok_or_else(|| PoolError::Communication {
                url: executor.base_url.clone(),
                reason: "no canned usage".into(),
            })
    }

    async fn utilize_host(
        &self,
        executor: &ExecutorIdentity,
        host: &str,
        _label: &str,
    ) -> Result<()> {
        self.utilized
            .lock()
            .unwrap()
            .push((executor.name.clone(), host.to_string()));
        Ok(())
    }
}

fn write_layout(root: &Path, hosts: &[(&str, &str)]) {
    std::fs::write(
        root.join("config"),
        format!("orchestrator.url={POOL}\nenforce.https=true\n"),
    )
    .unwrap();
    std::fs::write(root.join("jenkinses"), "E=https://e.example.com\n").unwrap();
    let nodes = root.join("nodes");
    if nodes.exists() {
        std::fs::remove_dir_all(&nodes).unwrap();
    }
    std::fs::create_dir_all(&nodes).unwrap();
    for (name, label) in hosts {
        std::fs::write(
            nodes.join(format!("{name}.xml")),
            format!("<slave><label>{label}</label></slave>"),
        )
        .unwrap();
    }
}

fn executor_e() -> ExecutorIdentity {
    ExecutorIdentity::new("E", "https://e.example.com", POOL)
}

#[tokio::test]
async fn reservation_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_layout(dir.path(), &[("winA", "windows"), ("solB", "solaris")]);

    let config = Arc::new(ConfigSource::new("unused", dir.path()));
    let v1 = parse_layout(dir.path(), "v1").unwrap();
    config.install(v1).await;

    let inventory = Arc::new(HostInventory::new());
    inventory.reconcile(&config.current().await.unwrap());
    assert_eq!(inventory.len(), 2);
    assert!(inventory.hosts().iter().all(|h| h.is_idle()));

    let client = Arc::new(RecordingClient::default());
    let engine = Arc::new(ReservationEngine::new(
        config.clone(),
        inventory.clone(),
        client.clone(),
    ));
    let verifier = ReconciliationVerifier::new(config.clone(), engine.clone(), client.clone());

    // E reports one pending solaris claim: it binds on solB and E is told.
    let e = executor_e();
    engine
        .report_workload(&e, &[WorkloadItem::new("solaris")])
        .await
        .unwrap();
    let active = engine.active_for(&e);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].1, "solB");
    assert_eq!(
        client.utilized.lock().unwrap().as_slice(),
        &[("E".to_string(), "solB".to_string())]
    );

    // E's usage agrees: a verifier pass changes nothing.
    client.set_usage("E", &["solB"]);
    verifier.run_pass().await;
    assert_eq!(engine.active_for(&e), active);
    assert_eq!(engine.reservations().len(), 1);

    // Label change for winA arrives while solB is occupied: winA updates in
    // place, solB's occupancy is undisturbed.
    write_layout(dir.path(), &[("winA", "windows,2019"), ("solB", "solaris")]);
    config.install(parse_layout(dir.path(), "v2").unwrap()).await;
    inventory.reconcile(&config.current().await.unwrap());
    assert_eq!(inventory.get("winA").unwrap().label, "windows,2019");
    assert_eq!(
        inventory.get("solB").unwrap().occupant,
        Some(active[0].0)
    );

    // solB is evicted from the config while occupied: deletion is deferred.
    write_layout(dir.path(), &[("winA", "windows,2019")]);
    config.install(parse_layout(dir.path(), "v3").unwrap()).await;
    inventory.reconcile(&config.current().await.unwrap());
    assert!(inventory.get("solB").unwrap().pending_removal);
    inventory.sweep();
    assert!(inventory.get("solB").is_some());

    // E returns the host: the reservation completes and the deferred
    // deletion finally happens.
    engine.return_host("solB").await.unwrap();
    assert!(engine.reservations().is_empty());
    assert!(inventory.get("solB").is_none());
    assert_eq!(inventory.len(), 1);
}

#[tokio::test]
async fn crash_recovery_backfills_from_reports() {
    let dir = tempfile::tempdir().unwrap();
    write_layout(dir.path(), &[("winA", "windows"), ("solB", "solaris")]);

    // Fresh orchestrator state (as after a restart): no reservations, but E
    // says it is using solB.
    let config = Arc::new(ConfigSource::new("unused", dir.path()));
    config.install(parse_layout(dir.path(), "v1").unwrap()).await;
    let inventory = Arc::new(HostInventory::new());
    inventory.reconcile(&config.current().await.unwrap());
    let client = Arc::new(RecordingClient::default());
    let engine = Arc::new(ReservationEngine::new(
        config.clone(),
        inventory.clone(),
        client.clone(),
    ));
    let verifier = ReconciliationVerifier::new(config.clone(), engine.clone(), client.clone());

    client.set_usage("E", &["solB"]);
    verifier.run_pass().await;

    let e = executor_e();
    let active = engine.active_for(&e);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].1, "solB");
    assert!(!inventory.get("solB").unwrap().is_idle());
    assert!(inventory.get("winA").unwrap().is_idle());

    // Converged: another pass adds nothing.
    verifier.run_pass().await;
    assert_eq!(engine.reservations().len(), 1);
}
