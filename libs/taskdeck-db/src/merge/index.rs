use std::collections::HashMap;

use crate::models::project::{Project, Section};
use crate::models::task::Task;

/// Comparison key for "same name": surrounding whitespace and letter case are
/// ignored, everything else must match exactly.
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Two tasks count as the same task only when both the normalized name and the
/// due date line up. A missing due date is part of the key.
pub fn task_key(task: &Task) -> String {
    let due = task
        .due_date
        .map(|d| d.to_string())
        .unwrap_or_default();
    format!("{}::{}", normalize(&task.name), due)
}

/// Builds a key → record map. On key collisions the record with the lowest id
/// wins, so the oldest row is the canonical duplicate target and the outcome
/// does not depend on store return order.
fn index_by<'a, T>(
    records: &'a [T],
    key: impl Fn(&T) -> String,
    id: impl Fn(&T) -> i64,
) -> HashMap<String, &'a T> {
    let mut map: HashMap<String, &'a T> = HashMap::new();
    for record in records {
        map.entry(key(record))
            .and_modify(|held| {
                if id(record) < id(*held) {
                    *held = record;
                }
            })
            .or_insert(record);
    }
    map
}

pub fn project_index(projects: &[Project]) -> HashMap<String, &Project> {
    index_by(projects, |p| normalize(&p.name), |p| p.id)
}

pub fn section_index(sections: &[Section]) -> HashMap<String, &Section> {
    index_by(sections, |s| normalize(&s.name), |s| s.id)
}

pub fn task_index(tasks: &[Task]) -> HashMap<String, &Task> {
    index_by(tasks, task_key, |t| t.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn named_task(id: i64, name: &str, due: Option<&str>) -> Task {
        Task {
            id,
            project_id: 1,
            section_id: None,
            name: name.to_string(),
            description: None,
            due_date: due.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
            completed: false,
            priority: None,
            assignee_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn normalize_trims_and_casefolds() {
        assert_eq!(normalize("  Website  "), "website");
        assert_eq!(normalize("WEBSITE"), "website");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn task_key_includes_due_date() {
        let dated = named_task(1, "Draft logo", Some("2024-01-01"));
        let undated = named_task(2, "Draft logo", None);
        assert_eq!(task_key(&dated), "draft logo::2024-01-01");
        assert_eq!(task_key(&undated), "draft logo::");
        assert_ne!(task_key(&dated), task_key(&undated));
    }

    #[test]
    fn colliding_keys_resolve_to_lowest_id() {
        let tasks = vec![
            named_task(7, "dupe", None),
            named_task(3, "Dupe", None),
            named_task(5, " dupe ", None),
        ];
        let index = task_index(&tasks);
        assert_eq!(index.len(), 1);
        assert_eq!(index["dupe::"].id, 3);
    }
}
