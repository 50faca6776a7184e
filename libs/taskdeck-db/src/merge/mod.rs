//! Organization merge-and-revert engine.
//!
//! Merging folds one organization's project tree into another, deduplicating
//! projects and sections by normalized name and tasks by (name, due date).
//! Every row mutation is captured in a [`MergePayload`] and persisted as a
//! merge event, which can later be replayed backwards to restore the exact
//! pre-merge row set.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::models::merge_event::{
    EntityTable, MergePayload, MergeStatus, NewMergeEvent, RowSnapshot,
};
use crate::models::orgs::Membership;
use crate::models::project::Project;
use crate::models::task::{Task, TaskTag};
use crate::store::Store;

pub mod index;

use index::{normalize, project_index, section_index, task_index, task_key};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct MergeEngine {
    store: Arc<dyn Store>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Folds `source_org_id` into `target_org_id` and records a revertible
    /// merge event. The actor must be an admin of both organizations. Returns
    /// the new merge event's id.
    pub async fn merge(
        &self,
        source_org_id: i64,
        target_org_id: i64,
        actor_id: i64,
    ) -> Result<i64, MergeError> {
        if source_org_id == target_org_id {
            return Err(MergeError::Validation(
                "Source and target organization must differ".to_string(),
            ));
        }

        let _lock = self
            .store
            .lock_orgs(&[source_org_id, target_org_id])
            .await?;

        let source_org = self
            .store
            .organization(source_org_id)
            .await?
            .ok_or_else(|| {
                MergeError::NotFound(format!("Organization {} not found", source_org_id))
            })?;
        self.store
            .organization(target_org_id)
            .await?
            .ok_or_else(|| {
                MergeError::NotFound(format!("Organization {} not found", target_org_id))
            })?;

        if !self.store.is_org_admin(actor_id, source_org_id).await?
            || !self.store.is_org_admin(actor_id, target_org_id).await?
        {
            return Err(MergeError::Forbidden(
                "Merging requires admin rights on both organizations".to_string(),
            ));
        }

        info!(
            "Merging organization {} into {} (actor {})",
            source_org_id, target_org_id, actor_id
        );

        let mut payload = MergePayload::new();

        let source_projects = self.store.projects_in_org(source_org_id).await?;
        let target_projects = self.store.projects_in_org(target_org_id).await?;
        let target_by_name = project_index(&target_projects);

        for project in &source_projects {
            match target_by_name.get(&normalize(&project.name)) {
                None => {
                    // No name collision: the whole subtree moves with the
                    // project, nothing below it needs to be touched.
                    let mut after = project.clone();
                    after.organization_id = target_org_id;
                    self.store
                        .upsert_row(&RowSnapshot::Projects(after.clone()))
                        .await?;
                    payload.record_update(
                        RowSnapshot::Projects(project.clone()),
                        RowSnapshot::Projects(after),
                    );
                }
                Some(duplicate) => {
                    self.merge_duplicate_project(project, duplicate, &mut payload)
                        .await?;
                }
            }
        }

        self.reconcile_memberships(source_org_id, target_org_id, &mut payload)
            .await?;

        self.store
            .delete_row(&RowSnapshot::Organizations(source_org.clone()))
            .await?;
        payload.record_delete(RowSnapshot::Organizations(source_org));

        let mutations = payload.mutation_count();
        let event_id = self
            .store
            .insert_merge_event(NewMergeEvent {
                created_by: actor_id,
                source_organization_id: source_org_id,
                target_organization_id: target_org_id,
                payload,
            })
            .await?;

        info!(
            "Merge of organization {} into {} recorded as event {} ({} row mutations)",
            source_org_id, target_org_id, event_id, mutations
        );
        Ok(event_id)
    }

    /// Empties a source project into its same-named target, then deletes it.
    async fn merge_duplicate_project(
        &self,
        source: &Project,
        target: &Project,
        payload: &mut MergePayload,
    ) -> Result<(), MergeError> {
        let source_sections = self.store.sections_in_project(source.id).await?;
        let target_sections = self.store.sections_in_project(target.id).await?;
        let target_by_name = section_index(&target_sections);

        for section in &source_sections {
            match target_by_name.get(&normalize(&section.name)) {
                None => {
                    let mut after = section.clone();
                    after.project_id = target.id;
                    self.store
                        .upsert_row(&RowSnapshot::Sections(after.clone()))
                        .await?;
                    payload.record_update(
                        RowSnapshot::Sections(section.clone()),
                        RowSnapshot::Sections(after),
                    );
                    // The section's tasks must follow it, or their project
                    // reference would dangle once the source project is gone.
                    for task in self.store.tasks_in_section(section.id).await? {
                        let mut task_after = task.clone();
                        task_after.project_id = target.id;
                        self.store
                            .upsert_row(&RowSnapshot::Tasks(task_after.clone()))
                            .await?;
                        payload.record_update(
                            RowSnapshot::Tasks(task),
                            RowSnapshot::Tasks(task_after),
                        );
                    }
                }
                Some(duplicate) => {
                    let source_tasks = self.store.tasks_in_section(section.id).await?;
                    let target_tasks = self.store.tasks_in_section(duplicate.id).await?;
                    self.reconcile_tasks(
                        &source_tasks,
                        &target_tasks,
                        target.id,
                        Some(duplicate.id),
                        payload,
                    )
                    .await?;
                    self.store
                        .delete_row(&RowSnapshot::Sections(section.clone()))
                        .await?;
                    payload.record_delete(RowSnapshot::Sections(section.clone()));
                }
            }
        }

        // Tasks hanging directly off the project, outside any section.
        let source_root = self.store.root_tasks_in_project(source.id).await?;
        let target_root = self.store.root_tasks_in_project(target.id).await?;
        self.reconcile_tasks(&source_root, &target_root, target.id, None, payload)
            .await?;

        self.store
            .delete_row(&RowSnapshot::Projects(source.clone()))
            .await?;
        payload.record_delete(RowSnapshot::Projects(source.clone()));
        Ok(())
    }

    /// Moves source tasks into the destination container; a task whose
    /// (name, due date) key already exists there is folded into its duplicate:
    /// tag associations become the union of both, the source task is deleted.
    async fn reconcile_tasks(
        &self,
        source_tasks: &[Task],
        target_tasks: &[Task],
        dest_project_id: i64,
        dest_section_id: Option<i64>,
        payload: &mut MergePayload,
    ) -> Result<(), MergeError> {
        let target_by_key = task_index(target_tasks);

        for task in source_tasks {
            match target_by_key.get(&task_key(task)) {
                None => {
                    let mut after = task.clone();
                    after.project_id = dest_project_id;
                    after.section_id = dest_section_id;
                    self.store
                        .upsert_row(&RowSnapshot::Tasks(after.clone()))
                        .await?;
                    payload.record_update(
                        RowSnapshot::Tasks(task.clone()),
                        RowSnapshot::Tasks(after),
                    );
                }
                Some(duplicate) => {
                    let source_assocs = self.store.tags_for_task(task.id).await?;
                    let target_tag_ids: HashSet<i64> = self
                        .store
                        .tags_for_task(duplicate.id)
                        .await?
                        .iter()
                        .map(|tt| tt.tag_id)
                        .collect();

                    // Union the tag sets onto the surviving task. Every source
                    // association goes away with the source task, so each one
                    // is captured for revert.
                    for assoc in &source_assocs {
                        if !target_tag_ids.contains(&assoc.tag_id) {
                            let moved = TaskTag {
                                task_id: duplicate.id,
                                tag_id: assoc.tag_id,
                            };
                            self.store
                                .upsert_row(&RowSnapshot::TaskTags(moved.clone()))
                                .await?;
                            payload.record_insert(RowSnapshot::TaskTags(moved));
                        }
                        self.store
                            .delete_row(&RowSnapshot::TaskTags(assoc.clone()))
                            .await?;
                        payload.record_delete(RowSnapshot::TaskTags(assoc.clone()));
                    }

                    self.store
                        .delete_row(&RowSnapshot::Tasks(task.clone()))
                        .await?;
                    payload.record_delete(RowSnapshot::Tasks(task.clone()));
                }
            }
        }
        Ok(())
    }

    /// Moves memberships over. Ownership is never transferred: a source owner
    /// without a target membership comes across as a plain member.
    async fn reconcile_memberships(
        &self,
        source_org_id: i64,
        target_org_id: i64,
        payload: &mut MergePayload,
    ) -> Result<(), MergeError> {
        for membership in self.store.memberships_in_org(source_org_id).await? {
            self.store
                .delete_row(&RowSnapshot::UserOrganizations(membership.clone()))
                .await?;
            payload.record_delete(RowSnapshot::UserOrganizations(membership.clone()));

            if self
                .store
                .membership(membership.user_id, target_org_id)
                .await?
                .is_none()
            {
                let moved = Membership {
                    user_id: membership.user_id,
                    organization_id: target_org_id,
                    is_owner: false,
                    created_at: Utc::now(),
                };
                self.store
                    .upsert_row(&RowSnapshot::UserOrganizations(moved.clone()))
                    .await?;
                payload.record_insert(RowSnapshot::UserOrganizations(moved));
            }
        }
        Ok(())
    }

    /// Replays a completed merge event backwards and marks it reverted. The
    /// actor must be the event's creator, an admin of the target organization,
    /// or a platform super-admin. An event reverts exactly once.
    pub async fn revert(&self, event_id: i64, actor_id: i64) -> Result<(), MergeError> {
        let event = self
            .store
            .merge_event(event_id)
            .await?
            .ok_or_else(|| MergeError::NotFound(format!("Merge event {} not found", event_id)))?;

        let authorized = event.created_by == actor_id
            || self.store.is_super_admin(actor_id).await?
            || self
                .store
                .is_org_admin(actor_id, event.target_organization_id)
                .await?;
        if !authorized {
            return Err(MergeError::Forbidden(
                "Reverting requires admin rights or event ownership".to_string(),
            ));
        }

        if event.status == MergeStatus::Reverted {
            return Err(MergeError::InvalidState(format!(
                "Merge event {} is already reverted",
                event_id
            )));
        }

        let _lock = self
            .store
            .lock_orgs(&[
                event.source_organization_id,
                event.target_organization_id,
            ])
            .await?;

        // A concurrent revert may have won the race between the status check
        // above and the lock acquisition; only the holder of the org locks is
        // allowed to decide the event is still revertible.
        let event = self
            .store
            .merge_event(event_id)
            .await?
            .ok_or_else(|| MergeError::NotFound(format!("Merge event {} not found", event_id)))?;
        if event.status == MergeStatus::Reverted {
            return Err(MergeError::InvalidState(format!(
                "Merge event {} is already reverted",
                event_id
            )));
        }

        // 1. Rows created by the merge disappear again.
        for row in &event.payload.inserts {
            self.store.delete_row(row).await?;
        }

        // 2. Deleted rows come back parents-first, so children never reference
        //    a row that is not there yet.
        for table in EntityTable::RESTORE_ORDER {
            for row in event.payload.deletes.iter().filter(|r| r.table() == table) {
                self.store.upsert_row(row).await?;
            }
        }

        // 3. In-place mutations roll back to their captured before-image.
        for update in &event.payload.updates {
            self.store.upsert_row(&update.before).await?;
        }

        self.store
            .set_merge_event_status(event_id, MergeStatus::Reverted)
            .await?;

        info!(
            "Reverted merge event {} ({} row mutations undone, actor {})",
            event_id,
            event.payload.mutation_count(),
            actor_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::merge_event::PAYLOAD_VERSION;
    use crate::models::orgs::Organization;
    use crate::models::project::Section;
    use crate::store::MemStore;
    use chrono::NaiveDate;

    fn org(id: i64, name: &str) -> RowSnapshot {
        RowSnapshot::Organizations(Organization {
            id,
            name: name.to_string(),
            color: None,
            description: None,
            archived: false,
            display_order: 0,
            created_at: Utc::now(),
        })
    }

    fn project(id: i64, org_id: i64, name: &str) -> RowSnapshot {
        RowSnapshot::Projects(Project {
            id,
            organization_id: org_id,
            name: name.to_string(),
            color: None,
            archived: false,
            favorite: false,
            budget_cents: None,
            deadline: None,
            created_at: Utc::now(),
        })
    }

    fn section(id: i64, project_id: i64, name: &str) -> RowSnapshot {
        RowSnapshot::Sections(Section {
            id,
            project_id,
            name: name.to_string(),
            created_at: Utc::now(),
        })
    }

    fn task(
        id: i64,
        project_id: i64,
        section_id: Option<i64>,
        name: &str,
        due: Option<&str>,
    ) -> RowSnapshot {
        RowSnapshot::Tasks(Task {
            id,
            project_id,
            section_id,
            name: name.to_string(),
            description: None,
            due_date: due.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
            completed: false,
            priority: None,
            assignee_id: None,
            created_at: Utc::now(),
        })
    }

    fn tag_assoc(task_id: i64, tag_id: i64) -> RowSnapshot {
        RowSnapshot::TaskTags(TaskTag { task_id, tag_id })
    }

    fn member(user_id: i64, org_id: i64, is_owner: bool) -> RowSnapshot {
        RowSnapshot::UserOrganizations(Membership {
            user_id,
            organization_id: org_id,
            is_owner,
            created_at: Utc::now(),
        })
    }

    const ACTOR: i64 = 10;

    async fn store_with(rows: Vec<RowSnapshot>) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        for row in rows {
            store.upsert_row(&row).await.unwrap();
        }
        store
    }

    /// Both orgs exist and the actor owns both.
    fn base_rows() -> Vec<RowSnapshot> {
        vec![
            org(1, "Acme Legacy"),
            org(2, "Acme"),
            member(ACTOR, 1, true),
            member(ACTOR, 2, true),
        ]
    }

    fn engine(store: &Arc<MemStore>) -> MergeEngine {
        MergeEngine::new(store.clone() as Arc<dyn Store>)
    }

    #[tokio::test]
    async fn merge_rejects_equal_organizations() {
        let store = store_with(base_rows()).await;
        let err = engine(&store).merge(1, 1, ACTOR).await.unwrap_err();
        assert!(matches!(err, MergeError::Validation(_)));
    }

    #[tokio::test]
    async fn merge_rejects_missing_organization() {
        let store = store_with(base_rows()).await;
        let err = engine(&store).merge(1, 999, ACTOR).await.unwrap_err();
        assert!(matches!(err, MergeError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_admin_actor_cannot_merge_and_nothing_changes() {
        let mut rows = base_rows();
        rows.push(project(100, 1, "Website"));
        let store = store_with(rows).await;
        let before = store.snapshot();

        let err = engine(&store).merge(1, 2, 99).await.unwrap_err();
        assert!(matches!(err, MergeError::Forbidden(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn admin_of_only_one_side_is_rejected() {
        let mut rows = base_rows();
        rows.push(member(11, 1, true)); // owns source only
        let store = store_with(rows).await;

        let err = engine(&store).merge(1, 2, 11).await.unwrap_err();
        assert!(matches!(err, MergeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn project_without_name_collision_is_relocated_untouched() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Marketing"),
            section(110, 100, "Q1"),
            task(120, 100, Some(110), "Plan launch", None),
            project(200, 2, "Website"),
        ]);
        let store = store_with(rows).await;
        let eng = engine(&store);

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        let marketing = snap.projects.iter().find(|p| p.id == 100).unwrap();
        assert_eq!(marketing.organization_id, 2);
        // Subtree untouched: same section and task rows, still parented to 100.
        assert_eq!(snap.sections.iter().find(|s| s.id == 110).unwrap().project_id, 100);
        let plan = snap.tasks.iter().find(|t| t.id == 120).unwrap();
        assert_eq!((plan.project_id, plan.section_id), (100, Some(110)));

        let event = store.merge_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, MergeStatus::Completed);
        assert_eq!(event.payload.version, PAYLOAD_VERSION);
        assert_eq!(event.payload.updates.len(), 1);
        assert!(event.payload.inserts.is_empty());
        // Actor's source membership plus the source organization row.
        assert_eq!(event.payload.deletes.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_tree_collapses_into_target() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Website"),
            project(200, 2, "Website"),
            section(110, 100, "Design"),
            section(210, 200, "Design"),
            task(120, 100, Some(110), "Draft logo", Some("2024-01-01")),
            task(220, 200, Some(210), "Draft logo", Some("2024-01-01")),
            tag_assoc(120, 1),
            tag_assoc(120, 2),
            tag_assoc(220, 2),
            tag_assoc(220, 3),
            task(130, 100, None, "Ship it", None),
        ]);
        let store = store_with(rows).await;

        engine(&store).merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        assert!(snap.organizations.iter().all(|o| o.id != 1));
        assert!(snap.projects.iter().all(|p| p.id != 100));
        assert!(snap.sections.iter().all(|s| s.id != 110));
        assert!(snap.tasks.iter().all(|t| t.id != 120));

        // Exactly one "Draft logo" survives, carrying the union of both tag sets.
        let survivors: Vec<_> = snap.tasks.iter().filter(|t| t.name == "Draft logo").collect();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, 220);
        let tags: Vec<(i64, i64)> = snap
            .task_tags
            .iter()
            .map(|tt| (tt.task_id, tt.tag_id))
            .collect();
        assert_eq!(tags, vec![(220, 1), (220, 2), (220, 3)]);

        // The sectionless source task moved to the target project's root.
        let shipped = snap.tasks.iter().find(|t| t.id == 130).unwrap();
        assert_eq!((shipped.project_id, shipped.section_id), (200, None));
    }

    #[tokio::test]
    async fn name_matching_ignores_case_and_whitespace() {
        let mut rows = base_rows();
        rows.extend([project(100, 1, "  WEBSITE "), project(200, 2, "website")]);
        let store = store_with(rows).await;

        engine(&store).merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        assert!(snap.projects.iter().all(|p| p.id != 100));
        assert!(snap.projects.iter().any(|p| p.id == 200));
    }

    #[tokio::test]
    async fn same_name_different_due_date_is_not_a_duplicate() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Website"),
            project(200, 2, "Website"),
            task(120, 100, None, "Draft logo", Some("2024-01-01")),
            task(220, 200, None, "Draft logo", Some("2024-02-02")),
        ]);
        let store = store_with(rows).await;

        engine(&store).merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        let drafts: Vec<_> = snap.tasks.iter().filter(|t| t.name == "Draft logo").collect();
        assert_eq!(drafts.len(), 2);
        let moved = snap.tasks.iter().find(|t| t.id == 120).unwrap();
        assert_eq!((moved.project_id, moved.section_id), (200, None));
    }

    #[tokio::test]
    async fn section_without_collision_is_reparented_not_deleted() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Website"),
            project(200, 2, "Website"),
            section(110, 100, "Backlog"),
            task(120, 100, Some(110), "Triage", None),
        ]);
        let store = store_with(rows).await;

        engine(&store).merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        let backlog = snap.sections.iter().find(|s| s.id == 110).unwrap();
        assert_eq!(backlog.project_id, 200);
        // The section's tasks follow it into the target project.
        let triage = snap.tasks.iter().find(|t| t.id == 120).unwrap();
        assert_eq!((triage.project_id, triage.section_id), (200, Some(110)));
    }

    #[tokio::test]
    async fn membership_union_does_not_promote_source_owner() {
        let mut rows = base_rows();
        rows.extend([member(11, 1, true), member(12, 2, true)]);
        let store = store_with(rows).await;

        engine(&store).merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        assert!(snap.memberships.iter().all(|m| m.organization_id != 1));
        let u1 = snap
            .memberships
            .iter()
            .find(|m| m.user_id == 11 && m.organization_id == 2)
            .unwrap();
        assert!(!u1.is_owner);
        let u2 = snap
            .memberships
            .iter()
            .find(|m| m.user_id == 12 && m.organization_id == 2)
            .unwrap();
        assert!(u2.is_owner);
    }

    #[tokio::test]
    async fn existing_target_membership_is_left_alone() {
        let mut rows = base_rows();
        rows.extend([member(11, 1, true), member(11, 2, true)]);
        let store = store_with(rows).await;

        engine(&store).merge(1, 2, ACTOR).await.unwrap();

        let snap = store.snapshot();
        let m = snap
            .memberships
            .iter()
            .find(|m| m.user_id == 11 && m.organization_id == 2)
            .unwrap();
        // Already a target owner; the merge must not demote them.
        assert!(m.is_owner);
    }

    #[tokio::test]
    async fn revert_restores_exact_premerge_rows_disjoint_names() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Marketing"),
            section(110, 100, "Q1"),
            task(120, 100, Some(110), "Plan launch", Some("2024-03-01")),
            project(200, 2, "Website"),
            member(11, 1, false),
        ]);
        let store = store_with(rows).await;
        let eng = engine(&store);
        let before = store.snapshot();

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();
        assert_ne!(store.snapshot(), before);

        eng.revert(event_id, ACTOR).await.unwrap();
        assert_eq!(store.snapshot(), before);

        let event = store.merge_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, MergeStatus::Reverted);
    }

    #[tokio::test]
    async fn revert_restores_exact_premerge_rows_duplicate_tree() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Website"),
            project(200, 2, "Website"),
            section(110, 100, "Design"),
            section(210, 200, "Design"),
            task(120, 100, Some(110), "Draft logo", Some("2024-01-01")),
            task(220, 200, Some(210), "Draft logo", Some("2024-01-01")),
            tag_assoc(120, 1),
            tag_assoc(220, 2),
            member(11, 1, true),
        ]);
        let store = store_with(rows).await;
        let eng = engine(&store);
        let before = store.snapshot();

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();
        eng.revert(event_id, ACTOR).await.unwrap();

        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn second_revert_is_invalid_state_and_changes_nothing() {
        let mut rows = base_rows();
        rows.push(project(100, 1, "Marketing"));
        let store = store_with(rows).await;
        let eng = engine(&store);

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();
        eng.revert(event_id, ACTOR).await.unwrap();
        let after_first = store.snapshot();

        let err = eng.revert(event_id, ACTOR).await.unwrap_err();
        assert!(matches!(err, MergeError::InvalidState(_)));
        assert_eq!(store.snapshot(), after_first);
        let event = store.merge_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.status, MergeStatus::Reverted);
    }

    #[tokio::test]
    async fn revert_of_unknown_event_is_not_found() {
        let store = store_with(base_rows()).await;
        let err = engine(&store).revert(12345, ACTOR).await.unwrap_err();
        assert!(matches!(err, MergeError::NotFound(_)));
    }

    #[tokio::test]
    async fn stranger_cannot_revert_and_nothing_changes() {
        let mut rows = base_rows();
        rows.push(project(100, 1, "Marketing"));
        let store = store_with(rows).await;
        let eng = engine(&store);

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();
        let merged = store.snapshot();

        let err = eng.revert(event_id, 99).await.unwrap_err();
        assert!(matches!(err, MergeError::Forbidden(_)));
        assert_eq!(store.snapshot(), merged);
    }

    #[tokio::test]
    async fn target_admin_may_revert() {
        let mut rows = base_rows();
        rows.extend([project(100, 1, "Marketing"), member(12, 2, true)]);
        let store = store_with(rows).await;
        let eng = engine(&store);

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();
        eng.revert(event_id, 12).await.unwrap();
    }

    #[tokio::test]
    async fn super_admin_may_revert() {
        let mut rows = base_rows();
        rows.push(project(100, 1, "Marketing"));
        let store = store_with(rows).await;
        store.mark_super_admin(50);
        let eng = engine(&store);

        let event_id = eng.merge(1, 2, ACTOR).await.unwrap();
        eng.revert(event_id, 50).await.unwrap();
    }

    /// Store wrapper that simulates a concurrent revert finishing between the
    /// pre-lock status check and the lock acquisition: the first time the org
    /// locks are requested, the event flips to reverted before they are
    /// granted.
    struct RevertRacingStore {
        inner: Arc<MemStore>,
        event_id: i64,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Store for RevertRacingStore {
        async fn organization(&self, id: i64) -> anyhow::Result<Option<Organization>> {
            self.inner.organization(id).await
        }
        async fn projects_in_org(&self, org_id: i64) -> anyhow::Result<Vec<Project>> {
            self.inner.projects_in_org(org_id).await
        }
        async fn sections_in_project(&self, project_id: i64) -> anyhow::Result<Vec<Section>> {
            self.inner.sections_in_project(project_id).await
        }
        async fn root_tasks_in_project(&self, project_id: i64) -> anyhow::Result<Vec<Task>> {
            self.inner.root_tasks_in_project(project_id).await
        }
        async fn tasks_in_section(&self, section_id: i64) -> anyhow::Result<Vec<Task>> {
            self.inner.tasks_in_section(section_id).await
        }
        async fn tags_for_task(&self, task_id: i64) -> anyhow::Result<Vec<TaskTag>> {
            self.inner.tags_for_task(task_id).await
        }
        async fn memberships_in_org(&self, org_id: i64) -> anyhow::Result<Vec<Membership>> {
            self.inner.memberships_in_org(org_id).await
        }
        async fn membership(&self, user_id: i64, org_id: i64) -> anyhow::Result<Option<Membership>> {
            self.inner.membership(user_id, org_id).await
        }
        async fn upsert_row(&self, row: &RowSnapshot) -> anyhow::Result<()> {
            self.inner.upsert_row(row).await
        }
        async fn delete_row(&self, row: &RowSnapshot) -> anyhow::Result<()> {
            self.inner.delete_row(row).await
        }
        async fn insert_merge_event(
            &self,
            event: NewMergeEvent,
        ) -> anyhow::Result<i64> {
            self.inner.insert_merge_event(event).await
        }
        async fn merge_event(
            &self,
            id: i64,
        ) -> anyhow::Result<Option<crate::models::merge_event::MergeEvent>> {
            self.inner.merge_event(id).await
        }
        async fn set_merge_event_status(&self, id: i64, status: MergeStatus) -> anyhow::Result<()> {
            self.inner.set_merge_event_status(id, status).await
        }
        async fn is_org_admin(&self, user_id: i64, org_id: i64) -> anyhow::Result<bool> {
            self.inner.is_org_admin(user_id, org_id).await
        }
        async fn is_super_admin(&self, user_id: i64) -> anyhow::Result<bool> {
            self.inner.is_super_admin(user_id).await
        }
        async fn lock_orgs(&self, org_ids: &[i64]) -> anyhow::Result<crate::store::OrgLockGuard> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.inner
                    .set_merge_event_status(self.event_id, MergeStatus::Reverted)
                    .await?;
            }
            self.inner.lock_orgs(org_ids).await
        }
    }

    #[tokio::test]
    async fn revert_losing_the_lock_race_does_not_replay() {
        let mut rows = base_rows();
        rows.push(project(100, 1, "Marketing"));
        let store = store_with(rows).await;

        let event_id = engine(&store).merge(1, 2, ACTOR).await.unwrap();
        let merged = store.snapshot();

        // The pre-lock check sees a completed event, then the competitor
        // reverts it while this call is blocked on the org locks.
        let racing = Arc::new(RevertRacingStore {
            inner: store.clone(),
            event_id,
            raced: std::sync::atomic::AtomicBool::new(false),
        });
        let eng = MergeEngine::new(racing as Arc<dyn Store>);

        let err = eng.revert(event_id, ACTOR).await.unwrap_err();
        assert!(matches!(err, MergeError::InvalidState(_)));
        // No stale replay: the row set is exactly as the merge left it.
        assert_eq!(store.snapshot(), merged);
    }

    #[tokio::test]
    async fn payload_survives_json_round_trip() {
        let mut rows = base_rows();
        rows.extend([
            project(100, 1, "Website"),
            project(200, 2, "Website"),
            task(120, 100, None, "Draft logo", Some("2024-01-01")),
            task(220, 200, None, "Draft logo", Some("2024-01-01")),
            tag_assoc(120, 1),
        ]);
        let store = store_with(rows).await;

        let event_id = engine(&store).merge(1, 2, ACTOR).await.unwrap();
        let event = store.merge_event(event_id).await.unwrap().unwrap();

        let json = serde_json::to_value(&event.payload).unwrap();
        let decoded: MergePayload = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.version, PAYLOAD_VERSION);
        assert_eq!(decoded.inserts.len(), event.payload.inserts.len());
        assert_eq!(decoded.deletes.len(), event.payload.deletes.len());
        assert_eq!(decoded.updates.len(), event.payload.updates.len());
    }
}
