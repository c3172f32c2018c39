use serde::Serialize;

use super::snapshot::HostDefinition;

/// One build machine managed by the pool. Long-lived and mutable: later
/// Snapshots update the label/definition in place so in-flight occupancy and
/// external references survive config changes. `occupant` holds the id of
/// the single reservation currently bound to this host.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareableHost {
    pub name: String,
    pub label: String,
    pub definition: HostDefinition,
    pub pending_removal: bool,
    pub occupant: Option<u64>,
}

impl ShareableHost {
    pub fn new(definition: HostDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            label: definition.label.clone(),
            pending_removal: false,
            occupant: None,
            definition,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.occupant.is_none()
    }

    /// A label string is a set of atoms separated by commas or whitespace;
    /// a requested label matches when it equals one of them.
    pub fn matches_label(&self, requested: &str) -> bool {
        self.label
            .split([',', ' ', '\t'])
            .map(str::trim)
            .filter(|atom| !atom.is_empty())
            .any(|atom| atom == requested)
    }
}
