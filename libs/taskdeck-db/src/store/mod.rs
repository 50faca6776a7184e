use anyhow::Result;
use async_trait::async_trait;

use crate::models::merge_event::{MergeEvent, MergeStatus, NewMergeEvent, RowSnapshot};
use crate::models::orgs::{Membership, Organization};
use crate::models::project::{Project, Section};
use crate::models::task::{Task, TaskTag};

pub mod memory;
pub mod pg;

pub use memory::MemStore;
pub use pg::PgStore;

/// Held for the full duration of a merge or revert. Dropping the guard
/// releases the per-organization locks.
pub enum OrgLockGuard {
    /// Session advisory locks on a dedicated connection; Postgres releases
    /// them when the connection is closed.
    Pg(sqlx::PgConnection),
    Mem(Vec<tokio::sync::OwnedMutexGuard<()>>),
}

/// CRUD seam between the merge engine and the relational store. Fetchers
/// return rows in ascending id order so duplicate matching is deterministic.
#[async_trait]
pub trait Store: Send + Sync {
    async fn organization(&self, id: i64) -> Result<Option<Organization>>;
    async fn projects_in_org(&self, org_id: i64) -> Result<Vec<Project>>;
    async fn sections_in_project(&self, project_id: i64) -> Result<Vec<Section>>;
    /// Tasks attached directly to the project, outside any section.
    async fn root_tasks_in_project(&self, project_id: i64) -> Result<Vec<Task>>;
    async fn tasks_in_section(&self, section_id: i64) -> Result<Vec<Task>>;
    async fn tags_for_task(&self, task_id: i64) -> Result<Vec<TaskTag>>;
    async fn memberships_in_org(&self, org_id: i64) -> Result<Vec<Membership>>;
    async fn membership(&self, user_id: i64, org_id: i64) -> Result<Option<Membership>>;

    /// Insert-or-replace the row by its primary key. Used both for forward
    /// reparenting during a merge and for restoring captured rows on revert.
    async fn upsert_row(&self, row: &RowSnapshot) -> Result<()>;
    /// Delete the row by primary key; join rows go by their composite key.
    async fn delete_row(&self, row: &RowSnapshot) -> Result<()>;

    async fn insert_merge_event(&self, event: NewMergeEvent) -> Result<i64>;
    async fn merge_event(&self, id: i64) -> Result<Option<MergeEvent>>;
    async fn set_merge_event_status(&self, id: i64, status: MergeStatus) -> Result<()>;

    /// Owner of the organization, or a platform super-admin.
    async fn is_org_admin(&self, user_id: i64, org_id: i64) -> Result<bool>;
    async fn is_super_admin(&self, user_id: i64) -> Result<bool>;

    /// Acquire advisory locks for every listed organization, in ascending id
    /// order regardless of the order given.
    async fn lock_orgs(&self, org_ids: &[i64]) -> Result<OrgLockGuard>;
}
