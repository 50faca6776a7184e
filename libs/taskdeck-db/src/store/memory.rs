use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;

use crate::models::merge_event::{MergeEvent, MergeStatus, NewMergeEvent, RowSnapshot};
use crate::models::orgs::{Membership, Organization};
use crate::models::project::{Project, Section};
use crate::models::task::{Task, TaskTag};

use super::{OrgLockGuard, Store};

/// In-memory store with the same observable semantics as [`super::PgStore`]:
/// fetchers iterate in ascending key order, upserts replace by primary key.
/// Backs the engine test-suite; no persistence.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
    org_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

#[derive(Default)]
struct Inner {
    organizations: BTreeMap<i64, Organization>,
    projects: BTreeMap<i64, Project>,
    sections: BTreeMap<i64, Section>,
    tasks: BTreeMap<i64, Task>,
    task_tags: BTreeMap<(i64, i64), TaskTag>,
    memberships: BTreeMap<(i64, i64), Membership>,
    merge_events: BTreeMap<i64, MergeEvent>,
    super_admins: BTreeSet<i64>,
    next_event_id: i64,
}

/// Point-in-time copy of every entity table, in ascending key order. Two
/// snapshots compare equal iff the stores hold the same row sets.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub organizations: Vec<Organization>,
    pub projects: Vec<Project>,
    pub sections: Vec<Section>,
    pub tasks: Vec<Task>,
    pub task_tags: Vec<TaskTag>,
    pub memberships: Vec<Membership>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_super_admin(&self, user_id: i64) {
        self.inner.lock().unwrap().super_admins.insert(user_id);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.lock().unwrap();
        StoreSnapshot {
            organizations: inner.organizations.values().cloned().collect(),
            projects: inner.projects.values().cloned().collect(),
            sections: inner.sections.values().cloned().collect(),
            tasks: inner.tasks.values().cloned().collect(),
            task_tags: inner.task_tags.values().cloned().collect(),
            memberships: inner.memberships.values().cloned().collect(),
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn organization(&self, id: i64) -> Result<Option<Organization>> {
        Ok(self.inner.lock().unwrap().organizations.get(&id).cloned())
    }

    async fn projects_in_org(&self, org_id: i64) -> Result<Vec<Project>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .projects
            .values()
            .filter(|p| p.organization_id == org_id)
            .cloned()
            .collect())
    }

    async fn sections_in_project(&self, project_id: i64) -> Result<Vec<Section>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sections
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn root_tasks_in_project(&self, project_id: i64) -> Result<Vec<Task>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.project_id == project_id && t.section_id.is_none())
            .cloned()
            .collect())
    }

    async fn tasks_in_section(&self, section_id: i64) -> Result<Vec<Task>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.section_id == Some(section_id))
            .cloned()
            .collect())
    }

    async fn tags_for_task(&self, task_id: i64) -> Result<Vec<TaskTag>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .task_tags
            .values()
            .filter(|tt| tt.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn memberships_in_org(&self, org_id: i64) -> Result<Vec<Membership>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .memberships
            .values()
            .filter(|m| m.organization_id == org_id)
            .cloned()
            .collect())
    }

    async fn membership(&self, user_id: i64, org_id: i64) -> Result<Option<Membership>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .memberships
            .get(&(user_id, org_id))
            .cloned())
    }

    async fn upsert_row(&self, row: &RowSnapshot) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match row {
            RowSnapshot::Organizations(o) => {
                inner.organizations.insert(o.id, o.clone());
            }
            RowSnapshot::Projects(p) => {
                inner.projects.insert(p.id, p.clone());
            }
            RowSnapshot::Sections(s) => {
                inner.sections.insert(s.id, s.clone());
            }
            RowSnapshot::Tasks(t) => {
                inner.tasks.insert(t.id, t.clone());
            }
            RowSnapshot::TaskTags(tt) => {
                inner.task_tags.insert((tt.task_id, tt.tag_id), tt.clone());
            }
            RowSnapshot::UserOrganizations(m) => {
                inner
                    .memberships
                    .insert((m.user_id, m.organization_id), m.clone());
            }
        }
        Ok(())
    }

    async fn delete_row(&self, row: &RowSnapshot) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match row {
            RowSnapshot::Organizations(o) => {
                inner.organizations.remove(&o.id);
            }
            RowSnapshot::Projects(p) => {
                inner.projects.remove(&p.id);
            }
            RowSnapshot::Sections(s) => {
                inner.sections.remove(&s.id);
            }
            RowSnapshot::Tasks(t) => {
                inner.tasks.remove(&t.id);
            }
            RowSnapshot::TaskTags(tt) => {
                inner.task_tags.remove(&(tt.task_id, tt.tag_id));
            }
            RowSnapshot::UserOrganizations(m) => {
                inner.memberships.remove(&(m.user_id, m.organization_id));
            }
        }
        Ok(())
    }

    async fn insert_merge_event(&self, event: NewMergeEvent) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.merge_events.insert(
            id,
            MergeEvent {
                id,
                created_by: event.created_by,
                source_organization_id: event.source_organization_id,
                target_organization_id: event.target_organization_id,
                status: MergeStatus::Completed,
                payload: event.payload,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn merge_event(&self, id: i64) -> Result<Option<MergeEvent>> {
        Ok(self.inner.lock().unwrap().merge_events.get(&id).cloned())
    }

    async fn set_merge_event_status(&self, id: i64, status: MergeStatus) -> Result<()> {
        if let Some(event) = self.inner.lock().unwrap().merge_events.get_mut(&id) {
            event.status = status;
        }
        Ok(())
    }

    async fn is_org_admin(&self, user_id: i64, org_id: i64) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        let owner = inner
            .memberships
            .get(&(user_id, org_id))
            .is_some_and(|m| m.is_owner);
        Ok(owner || inner.super_admins.contains(&user_id))
    }

    async fn is_super_admin(&self, user_id: i64) -> Result<bool> {
        Ok(self.inner.lock().unwrap().super_admins.contains(&user_id))
    }

    async fn lock_orgs(&self, org_ids: &[i64]) -> Result<OrgLockGuard> {
        let mut ids: Vec<i64> = org_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = self.org_locks.lock().unwrap();
            ids.iter()
                .map(|id| Arc::clone(map.entry(*id).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        Ok(OrgLockGuard::Mem(guards))
    }
}
