//! Firmware inventory snapshots and the before/after diff that proves an
//! update actually changed something. Job-state success alone is not
//! trusted for audit purposes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One versioned firmware component as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryComponent {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Provider-side locator, e.g. the Redfish member odata id.
    pub source: Option<String>,
}

/// The full firmware inventory of a host at one point in time.
///
/// Components are keyed by id in a `BTreeMap` so iteration (and therefore
/// diff output) is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub raw: serde_json::Value,
    pub components: BTreeMap<String, InventoryComponent>,
}

impl InventorySnapshot {
    pub fn from_components(components: impl IntoIterator<Item = InventoryComponent>) -> Self {
        Self {
            raw: serde_json::Value::Null,
            components: components.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
    Updated,
}

/// Derived from exactly two snapshots; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryChange {
    pub id: String,
    pub name: String,
    pub previous_version: Option<String>,
    pub current_version: Option<String>,
    pub change_type: ChangeType,
}

/// Compute the changes between two snapshots.
///
/// Every id in the symmetric union of the two component maps yields at
/// most one record: only-before is `removed`, only-after is `added`, a
/// version mismatch is `updated`, and equal versions yield nothing.
/// Output is sorted ascending by component id.
pub fn diff_inventories(
    before: &InventorySnapshot,
    after: &InventorySnapshot,
) -> Vec<InventoryChange> {
    let mut ids: Vec<&String> = before.components.keys().collect();
    ids.extend(after.components.keys());
    ids.sort();
    ids.dedup();

    let mut changes = Vec::new();
    for id in ids {
        match (before.components.get(id), after.components.get(id)) {
            (Some(prev), None) => changes.push(InventoryChange {
                id: id.clone(),
                name: prev.name.clone(),
                previous_version: Some(prev.version.clone()),
                current_version: None,
                change_type: ChangeType::Removed,
            }),
            (None, Some(cur)) => changes.push(InventoryChange {
                id: id.clone(),
                name: cur.name.clone(),
                previous_version: None,
                current_version: Some(cur.version.clone()),
                change_type: ChangeType::Added,
            }),
            (Some(prev), Some(cur)) if prev.version != cur.version => {
                changes.push(InventoryChange {
                    id: id.clone(),
                    name: cur.name.clone(),
                    previous_version: Some(prev.version.clone()),
                    current_version: Some(cur.version.clone()),
                    change_type: ChangeType::Updated,
                })
            }
            _ => {}
        }
    }
    changes
}
