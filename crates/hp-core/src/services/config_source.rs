use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{PoolError, Result};
use crate::models::snapshot::{ENDPOINT_KEY, ENFORCE_HTTPS_KEY};
use crate::models::{ExecutorIdentity, Snapshot};
use crate::services::{git, node_file};

const CONFIG_FILE: &str = "config";
const REGISTRY_FILE: &str = "jenkinses";
const NODES_DIR: &str = "nodes";

/// Reads the versioned config repo and produces immutable Snapshots.
///
/// One ConfigSource instance per local clone: concurrent in-process callers
/// are serialized internally, but two processes driving the same working
/// copy are undefined.
pub struct ConfigSource {
    repo_url: String,
    checkout: PathBuf,
    current: RwLock<Option<Arc<Snapshot>>>,
    sync_gate: Mutex<()>,
}

impl ConfigSource {
    pub fn new(repo_url: impl Into<String>, checkout: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            checkout: checkout.into(),
            current: RwLock::new(None),
            sync_gate: Mutex::new(()),
        }
    }

    /// The last known-good Snapshot, if any sync has ever succeeded.
    pub async fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    /// Install an already-parsed Snapshot, e.g. one produced by
    /// [`parse_layout`] against a checkout managed elsewhere. Swap-only.
    pub async fn install(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().await = Some(snapshot.clone());
        snapshot
    }

    /// Bring the local clone up to date and parse it into a Snapshot.
    ///
    /// If the remote version matches the held Snapshot this is a no-op that
    /// returns the same Arc. On a parse failure the whole attempt is
    /// discarded and the held Snapshot is left untouched, so callers keep a
    /// stale-but-valid view; only the very first sync has no fallback.
    pub async fn sync(&self) -> Result<Arc<Snapshot>> {
        let _gate = self.sync_gate.lock().await;

        if !self.checkout.join(".git").exists() {
            if let Some(parent) = self.checkout.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!(repo = %self.repo_url, "cloning config repo");
            git::clone_repo(&self.repo_url, &self.checkout).await?;
        }

        let remote = git::remote_head(&self.checkout).await?;
        if let Some(held) = self.current.read().await.clone() {
            if held.source_version == remote {
                debug!(version = %remote, "config repo unchanged");
                return Ok(held);
            }
        }

        git::fetch(&self.checkout).await?;
        git::checkout_detached(&self.checkout, &remote).await?;
        let checked_out = git::current_commit(&self.checkout).await?;
        if checked_out != remote {
            return Err(PoolError::Git(format!(
                "checkout landed on {checked_out}, expected {remote}"
            )));
        }

        let snapshot = Arc::new(parse_layout(&self.checkout, &remote)?);
        info!(
            version = %remote,
            executors = snapshot.executors.len(),
            hosts = snapshot.hosts.len(),
            "config repo synced"
        );
        *self.current.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }
}

/// Parse the fixed config-repo layout at `root` into a Snapshot.
///
/// All-or-nothing: every file is attempted so the error message can name
/// every problem at once, and any recorded error discards the attempt.
pub fn parse_layout(root: &Path, version: &str) -> Result<Snapshot> {
    let mut errors: Vec<String> = Vec::new();

    let config = match std::fs::read_to_string(root.join(CONFIG_FILE)) {
        Ok(contents) => parse_config(&contents, &mut errors),
        Err(e) => {
            errors.push(format!("{CONFIG_FILE}: {e}"));
            BTreeMap::new()
        }
    };
    let endpoint = config.get(ENDPOINT_KEY).cloned().unwrap_or_default();

    let executors = match std::fs::read_to_string(root.join(REGISTRY_FILE)) {
        Ok(contents) => parse_registry(&contents, &endpoint, &mut errors),
        Err(e) => {
            errors.push(format!("{REGISTRY_FILE}: {e}"));
            Vec::new()
        }
    };

    let hosts = parse_nodes_dir(&root.join(NODES_DIR), &mut errors);

    if !errors.is_empty() {
        return Err(PoolError::ConfigRepo(errors.join("; ")));
    }

    Ok(Snapshot {
        source_version: version.to_string(),
        config,
        executors,
        hosts,
    })
}

fn parse_config(contents: &str, errors: &mut Vec<String>) -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                config.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => errors.push(format!(
                "{CONFIG_FILE}: line {} is not a key=value pair",
                number + 1
            )),
        }
    }

    match config.get(ENDPOINT_KEY).map(String::as_str) {
        None => errors.push(format!("{CONFIG_FILE}: missing required key '{ENDPOINT_KEY}'")),
        Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
            errors.push(format!(
                "{CONFIG_FILE}: '{ENDPOINT_KEY}' is not an http(s) URL: {url}"
            ));
        }
        Some(url) => {
            let enforce = matches!(
                config.get(ENFORCE_HTTPS_KEY).map(String::as_str),
                Some("true") | Some("yes") | Some("1")
            );
            if enforce && !url.starts_with("https://") {
                errors.push(format!(
                    "{CONFIG_FILE}: '{ENFORCE_HTTPS_KEY}' is set but '{ENDPOINT_KEY}' is not https"
                ));
            }
        }
    }

    config
}

fn parse_registry(
    contents: &str,
    pool_endpoint: &str,
    errors: &mut Vec<String>,
) -> Vec<ExecutorIdentity> {
    let mut executors: Vec<ExecutorIdentity> = Vec::new();
    let mut names: HashSet<String> = HashSet::new();

    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, url)) = line.split_once('=') else {
            errors.push(format!(
                "{REGISTRY_FILE}: line {} is not a name=url pair",
                number + 1
            ));
            continue;
        };
        let (name, url) = (name.trim(), url.trim());
        if !url.starts_with("http://") && !url.starts_with("https://") {
            errors.push(format!(
                "{REGISTRY_FILE}: executor '{name}' has a non-http(s) URL: {url}"
            ));
            continue;
        }
        if !names.insert(name.to_string()) {
            errors.push(format!("{REGISTRY_FILE}: duplicate executor name '{name}'"));
            continue;
        }
        executors.push(ExecutorIdentity::new(name, url, pool_endpoint));
    }

    if executors.is_empty() && errors.is_empty() {
        errors.push(format!("{REGISTRY_FILE}: no executors declared"));
    }
    executors
}

fn parse_nodes_dir(dir: &Path, errors: &mut Vec<String>) -> BTreeMap<String, crate::models::HostDefinition> {
    let mut hosts = BTreeMap::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(format!("{NODES_DIR}: {e}"));
            return hosts;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    for path in paths {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                errors.push(format!("{NODES_DIR}/{file_name}: {e}"));
                continue;
            }
        };
        match node_file::parse(&file_name, &raw) {
            Ok(definition) => {
                if hosts.contains_key(&definition.name) {
                    errors.push(format!(
                        "{NODES_DIR}: duplicate host name '{}'",
                        definition.name
                    ));
                } else {
                    hosts.insert(definition.name.clone(), definition);
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    hosts
}
