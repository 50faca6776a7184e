use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection, PgPool, Row, postgres::PgRow};

use crate::models::merge_event::{
    MergeEvent, MergePayload, MergeStatus, NewMergeEvent, RowSnapshot,
};
use crate::models::orgs::{Membership, Organization};
use crate::models::project::{Project, Section};
use crate::models::task::{Task, TaskTag};

use super::{OrgLockGuard, Store};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    database_url: String,
}

impl PgStore {
    pub fn new(pool: PgPool, database_url: impl Into<String>) -> Self {
        Self {
            pool,
            database_url: database_url.into(),
        }
    }

    fn row_to_merge_event(row: &PgRow) -> Result<MergeEvent> {
        let payload_json: serde_json::Value = row
            .try_get("payload")
            .context("merge_events row is missing its payload column")?;
        let payload: MergePayload = serde_json::from_value(payload_json)
            .context("Failed to decode merge event payload")?;
        Ok(MergeEvent {
            id: row.try_get("id")?,
            created_by: row.try_get("created_by")?,
            source_organization_id: row.try_get("source_organization_id")?,
            target_organization_id: row.try_get("target_organization_id")?,
            status: MergeStatus::from(row.try_get::<String, _>("status")?),
            payload,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn organization(&self, id: i64) -> Result<Option<Organization>> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch organization by ID")
    }

    async fn projects_in_org(&self, org_id: i64) -> Result<Vec<Project>> {
        sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE organization_id = $1 ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch projects for organization")
    }

    async fn sections_in_project(&self, project_id: i64) -> Result<Vec<Section>> {
        sqlx::query_as::<_, Section>("SELECT * FROM sections WHERE project_id = $1 ORDER BY id")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch sections for project")
    }

    async fn root_tasks_in_project(&self, project_id: i64) -> Result<Vec<Task>> {
        sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE project_id = $1 AND section_id IS NULL ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch sectionless tasks for project")
    }

    async fn tasks_in_section(&self, section_id: i64) -> Result<Vec<Task>> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE section_id = $1 ORDER BY id")
            .bind(section_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch tasks for section")
    }

    async fn tags_for_task(&self, task_id: i64) -> Result<Vec<TaskTag>> {
        sqlx::query_as::<_, TaskTag>(
            "SELECT task_id, tag_id FROM task_tags WHERE task_id = $1 ORDER BY tag_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch tag associations for task")
    }

    async fn memberships_in_org(&self, org_id: i64) -> Result<Vec<Membership>> {
        sqlx::query_as::<_, Membership>(
            "SELECT * FROM user_organizations WHERE organization_id = $1 ORDER BY user_id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch memberships for organization")
    }

    async fn membership(&self, user_id: i64, org_id: i64) -> Result<Option<Membership>> {
        sqlx::query_as::<_, Membership>(
            "SELECT * FROM user_organizations WHERE user_id = $1 AND organization_id = $2",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch membership")
    }

    async fn upsert_row(&self, row: &RowSnapshot) -> Result<()> {
        match row {
            RowSnapshot::Organizations(o) => {
                sqlx::query(
                    "INSERT INTO organizations (id, name, color, description, archived, display_order, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (id) DO UPDATE SET
                         name = EXCLUDED.name,
                         color = EXCLUDED.color,
                         description = EXCLUDED.description,
                         archived = EXCLUDED.archived,
                         display_order = EXCLUDED.display_order",
                )
                .bind(o.id)
                .bind(&o.name)
                .bind(&o.color)
                .bind(&o.description)
                .bind(o.archived)
                .bind(o.display_order)
                .bind(o.created_at)
                .execute(&self.pool)
                .await
                .context("Failed to upsert organization")?;
            }
            RowSnapshot::Projects(p) => {
                sqlx::query(
                    "INSERT INTO projects (id, organization_id, name, color, archived, favorite, budget_cents, deadline, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     ON CONFLICT (id) DO UPDATE SET
                         organization_id = EXCLUDED.organization_id,
                         name = EXCLUDED.name,
                         color = EXCLUDED.color,
                         archived = EXCLUDED.archived,
                         favorite = EXCLUDED.favorite,
                         budget_cents = EXCLUDED.budget_cents,
                         deadline = EXCLUDED.deadline",
                )
                .bind(p.id)
                .bind(p.organization_id)
                .bind(&p.name)
                .bind(&p.color)
                .bind(p.archived)
                .bind(p.favorite)
                .bind(p.budget_cents)
                .bind(p.deadline)
                .bind(p.created_at)
                .execute(&self.pool)
                .await
                .context("Failed to upsert project")?;
            }
            RowSnapshot::Sections(s) => {
                sqlx::query(
                    "INSERT INTO sections (id, project_id, name, created_at)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (id) DO UPDATE SET
                         project_id = EXCLUDED.project_id,
                         name = EXCLUDED.name",
                )
                .bind(s.id)
                .bind(s.project_id)
                .bind(&s.name)
                .bind(s.created_at)
                .execute(&self.pool)
                .await
                .context("Failed to upsert section")?;
            }
            RowSnapshot::Tasks(t) => {
                sqlx::query(
                    "INSERT INTO tasks (id, project_id, section_id, name, description, due_date, completed, priority, assignee_id, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                     ON CONFLICT (id) DO UPDATE SET
                         project_id = EXCLUDED.project_id,
                         section_id = EXCLUDED.section_id,
                         name = EXCLUDED.name,
                         description = EXCLUDED.description,
                         due_date = EXCLUDED.due_date,
                         completed = EXCLUDED.completed,
                         priority = EXCLUDED.priority,
                         assignee_id = EXCLUDED.assignee_id",
                )
                .bind(t.id)
                .bind(t.project_id)
                .bind(t.section_id)
                .bind(&t.name)
                .bind(&t.description)
                .bind(t.due_date)
                .bind(t.completed)
                .bind(t.priority)
                .bind(t.assignee_id)
                .bind(t.created_at)
                .execute(&self.pool)
                .await
                .context("Failed to upsert task")?;
            }
            RowSnapshot::TaskTags(tt) => {
                sqlx::query(
                    "INSERT INTO task_tags (task_id, tag_id) VALUES ($1, $2)
                     ON CONFLICT (task_id, tag_id) DO NOTHING",
                )
                .bind(tt.task_id)
                .bind(tt.tag_id)
                .execute(&self.pool)
                .await
                .context("Failed to upsert tag association")?;
            }
            RowSnapshot::UserOrganizations(m) => {
                sqlx::query(
                    "INSERT INTO user_organizations (user_id, organization_id, is_owner, created_at)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (user_id, organization_id) DO UPDATE SET
                         is_owner = EXCLUDED.is_owner",
                )
                .bind(m.user_id)
                .bind(m.organization_id)
                .bind(m.is_owner)
                .bind(m.created_at)
                .execute(&self.pool)
                .await
                .context("Failed to upsert membership")?;
            }
        }
        Ok(())
    }

    async fn delete_row(&self, row: &RowSnapshot) -> Result<()> {
        match row {
            RowSnapshot::Organizations(o) => {
                sqlx::query("DELETE FROM organizations WHERE id = $1")
                    .bind(o.id)
                    .execute(&self.pool)
                    .await
                    .context("Failed to delete organization")?;
            }
            RowSnapshot::Projects(p) => {
                sqlx::query("DELETE FROM projects WHERE id = $1")
                    .bind(p.id)
                    .execute(&self.pool)
                    .await
                    .context("Failed to delete project")?;
            }
            RowSnapshot::Sections(s) => {
                sqlx::query("DELETE FROM sections WHERE id = $1")
                    .bind(s.id)
                    .execute(&self.pool)
                    .await
                    .context("Failed to delete section")?;
            }
            RowSnapshot::Tasks(t) => {
                sqlx::query("DELETE FROM tasks WHERE id = $1")
                    .bind(t.id)
                    .execute(&self.pool)
                    .await
                    .context("Failed to delete task")?;
            }
            RowSnapshot::TaskTags(tt) => {
                sqlx::query("DELETE FROM task_tags WHERE task_id = $1 AND tag_id = $2")
                    .bind(tt.task_id)
                    .bind(tt.tag_id)
                    .execute(&self.pool)
                    .await
                    .context("Failed to delete tag association")?;
            }
            RowSnapshot::UserOrganizations(m) => {
                sqlx::query(
                    "DELETE FROM user_organizations WHERE user_id = $1 AND organization_id = $2",
                )
                .bind(m.user_id)
                .bind(m.organization_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete membership")?;
            }
        }
        Ok(())
    }

    async fn insert_merge_event(&self, event: NewMergeEvent) -> Result<i64> {
        let payload = serde_json::to_value(&event.payload)
            .context("Failed to encode merge event payload")?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO merge_events (created_by, source_organization_id, target_organization_id, status, payload)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(event.created_by)
        .bind(event.source_organization_id)
        .bind(event.target_organization_id)
        .bind(MergeStatus::Completed.as_str())
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert merge event")?;
        Ok(id)
    }

    async fn merge_event(&self, id: i64) -> Result<Option<MergeEvent>> {
        let row = sqlx::query("SELECT * FROM merge_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch merge event by ID")?;
        row.map(|r| Self::row_to_merge_event(&r)).transpose()
    }

    async fn set_merge_event_status(&self, id: i64, status: MergeStatus) -> Result<()> {
        sqlx::query("UPDATE merge_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update merge event status")?;
        Ok(())
    }

    async fn is_org_admin(&self, user_id: i64, org_id: i64) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM user_organizations
                 WHERE user_id = $1 AND organization_id = $2 AND is_owner
             ) OR EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_admin)",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check organization admin rights")
    }

    async fn is_super_admin(&self, user_id: i64) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_admin)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check super-admin rights")
    }

    async fn lock_orgs(&self, org_ids: &[i64]) -> Result<OrgLockGuard> {
        // Locks live on a dedicated session so they survive pool churn and die
        // with the connection even if the caller aborts mid-operation.
        let mut conn = PgConnection::connect(&self.database_url)
            .await
            .context("Failed to open advisory lock connection")?;
        let mut ids: Vec<i64> = org_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(id)
                .execute(&mut conn)
                .await
                .with_context(|| format!("Failed to lock organization {}", id))?;
        }
        Ok(OrgLockGuard::Pg(conn))
    }
}
