//! Staff list and floor plan.
//!
//! These aggregates are not versioned. A received upsert replaces the whole
//! item, a removal deletes it, and divergence heals through the full-state
//! `sync_requested` / `sync_response` exchange.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMember {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloorTable {
    pub id: String,
    pub number: String,
    pub capacity: u32,
    #[serde(default)]
    pub section: Option<String>,
    /// `available`, `occupied`, `reserved`, ...
    pub status: String,
}

fn default_true() -> bool {
    true
}

/// Snapshot exchanged on full resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    pub staff: Vec<StaffMember>,
    pub tables: Vec<FloorTable>,
}

#[derive(Default)]
struct Inner {
    staff: BTreeMap<String, StaffMember>,
    tables: BTreeMap<String, FloorTable>,
}

#[derive(Default)]
pub struct Roster {
    inner: RwLock<Inner>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_staff(&self, member: StaffMember) {
        if let Ok(mut inner) = self.inner.write() {
            inner.staff.insert(member.id.clone(), member);
        }
    }

    pub fn remove_staff(&self, staff_id: &str) -> bool {
        self.inner
            .write()
            .map(|mut inner| inner.staff.remove(staff_id).is_some())
            .unwrap_or(false)
    }

    pub fn upsert_table(&self, table: FloorTable) {
        if let Ok(mut inner) = self.inner.write() {
            inner.tables.insert(table.id.clone(), table);
        }
    }

    pub fn remove_table(&self, table_id: &str) -> bool {
        self.inner
            .write()
            .map(|mut inner| inner.tables.remove(table_id).is_some())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        self.inner
            .read()
            .map(|inner| RosterSnapshot {
                staff: inner.staff.values().cloned().collect(),
                tables: inner.tables.values().cloned().collect(),
            })
            .unwrap_or_default()
    }

    /// Replace-on-receive for a full snapshot: every item in the snapshot
    /// overwrites the local copy. Local items the sender does not know are
    /// kept; a later removal event deletes them.
    pub fn merge_snapshot(&self, snapshot: RosterSnapshot) {
        if let Ok(mut inner) = self.inner.write() {
            for member in snapshot.staff {
                inner.staff.insert(member.id.clone(), member);
            }
            for table in snapshot.tables {
                inner.tables.insert(table.id.clone(), table);
            }
        }
    }
}
