use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::orgs::{Membership, Organization};
use super::project::{Project, Section};
use super::task::{Task, TaskTag};

pub const PAYLOAD_VERSION: u32 = 1;

/// Full row captured at mutation time, tagged by the table it belongs to.
/// Revert matches exhaustively over these kinds instead of dispatching on a
/// free-form table-name string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum RowSnapshot {
    Organizations(Organization),
    Projects(Project),
    Sections(Section),
    Tasks(Task),
    TaskTags(TaskTag),
    UserOrganizations(Membership),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityTable {
    Organizations,
    Projects,
    Sections,
    Tasks,
    TaskTags,
    UserOrganizations,
}

impl EntityTable {
    /// Reinsertion order: parents first, so the foreign keys children point at
    /// exist before the children come back.
    pub const RESTORE_ORDER: [EntityTable; 6] = [
        EntityTable::Organizations,
        EntityTable::Projects,
        EntityTable::Sections,
        EntityTable::Tasks,
        EntityTable::TaskTags,
        EntityTable::UserOrganizations,
    ];
}

impl RowSnapshot {
    pub fn table(&self) -> EntityTable {
        match self {
            RowSnapshot::Organizations(_) => EntityTable::Organizations,
            RowSnapshot::Projects(_) => EntityTable::Projects,
            RowSnapshot::Sections(_) => EntityTable::Sections,
            RowSnapshot::Tasks(_) => EntityTable::Tasks,
            RowSnapshot::TaskTags(_) => EntityTable::TaskTags,
            RowSnapshot::UserOrganizations(_) => EntityTable::UserOrganizations,
        }
    }
}

/// In-place mutation captured with both sides, so revert can write `before`
/// back over the live row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub before: RowSnapshot,
    pub after: RowSnapshot,
}

/// The ordered undo record accumulated during one merge. Append-only while the
/// merge runs; immutable once the event is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePayload {
    #[serde(default = "default_payload_version")]
    pub version: u32,
    pub inserts: Vec<RowSnapshot>,
    pub deletes: Vec<RowSnapshot>,
    pub updates: Vec<UpdateEntry>,
}

fn default_payload_version() -> u32 {
    PAYLOAD_VERSION
}

impl Default for MergePayload {
    fn default() -> Self {
        Self::new()
    }
}

impl MergePayload {
    pub fn new() -> Self {
        Self {
            version: PAYLOAD_VERSION,
            inserts: Vec::new(),
            deletes: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn record_insert(&mut self, row: RowSnapshot) {
        self.inserts.push(row);
    }

    pub fn record_delete(&mut self, row: RowSnapshot) {
        self.deletes.push(row);
    }

    pub fn record_update(&mut self, before: RowSnapshot, after: RowSnapshot) {
        self.updates.push(UpdateEntry { before, after });
    }

    pub fn mutation_count(&self) -> usize {
        self.inserts.len() + self.deletes.len() + self.updates.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Completed,
    Reverted,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::Completed => "completed",
            MergeStatus::Reverted => "reverted",
        }
    }
}

impl From<String> for MergeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "reverted" => MergeStatus::Reverted,
            _ => MergeStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeEvent {
    pub id: i64,
    pub created_by: i64,
    pub source_organization_id: i64,
    pub target_organization_id: i64,
    pub status: MergeStatus,
    pub payload: MergePayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMergeEvent {
    pub created_by: i64,
    pub source_organization_id: i64,
    pub target_organization_id: i64,
    pub payload: MergePayload,
}
