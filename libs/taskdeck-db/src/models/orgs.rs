use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
    pub archived: bool,
    pub display_order: i32,
    pub created_at: DateTime<Utc>,
}

/// One row per (user, organization). Ownership is a flag on the membership,
/// not a separate role table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub user_id: i64,
    pub organization_id: i64,
    pub is_owner: bool,
    pub created_at: DateTime<Utc>,
}
