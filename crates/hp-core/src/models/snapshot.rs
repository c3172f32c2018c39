use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Config-repo key holding the pool endpoint URL. Its absence fails a sync.
pub const ENDPOINT_KEY: &str = "orchestrator.url";
/// Config-repo key that, when truthy, requires the endpoint to be https.
pub const ENFORCE_HTTPS_KEY: &str = "enforce.https";

/// One immutable, fully-parsed reading of the config repo at a specific
/// version. Produced wholesale; a new Snapshot replaces the old one entirely
/// or the sync attempt is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub source_version: String,
    pub config: BTreeMap<String, String>,
    pub executors: Vec<ExecutorIdentity>,
    pub hosts: BTreeMap<String, HostDefinition>,
}

impl Snapshot {
    /// Pool endpoint URL. Guaranteed present by the parse; empty only on a
    /// hand-assembled Snapshot.
    pub fn endpoint_url(&self) -> &str {
        self.config
            .get(ENDPOINT_KEY)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn enforce_https(&self) -> bool {
        matches!(
            self.config.get(ENFORCE_HTTPS_KEY).map(String::as_str),
            Some("true") | Some("yes") | Some("1")
        )
    }

    pub fn is_member(&self, executor: &ExecutorIdentity) -> bool {
        self.executors.iter().any(|e| e == executor)
    }
}

/// A remote master permitted to claim hosts from the pool. Equality and
/// hashing deliberately consider only `(base_url, name)`; the fingerprint
/// records which pool endpoint the executor was enrolled against.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorIdentity {
    pub base_url: String,
    pub name: String,
    pub pool_fingerprint: String,
}

impl ExecutorIdentity {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, pool_endpoint: &str) -> Self {
        Self {
            base_url: base_url.into(),
            name: name.into(),
            pool_fingerprint: fingerprint(pool_endpoint),
        }
    }
}

impl PartialEq for ExecutorIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.base_url == other.base_url && self.name == other.name
    }
}

impl Hash for ExecutorIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_url.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for ExecutorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.base_url)
    }
}

/// FNV-1a digest of a pool endpoint, hex-encoded. Stable across processes.
pub fn fingerprint(input: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// One host as declared by the config repo. Immutable; reconstructing a
/// definition from its own `declaring_file_name`/`raw_definition` yields an
/// equal value (see `services::node_file::parse`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDefinition {
    pub name: String,
    pub label: String,
    pub declaring_file_name: String,
    pub raw_definition: String,
}
