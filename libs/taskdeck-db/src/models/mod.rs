pub mod api_key;
pub mod merge_event;
pub mod orgs;
pub mod project;
pub mod task;
