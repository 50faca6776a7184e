use std::sync::Arc;

use tracing::warn;

use taskdeck_db::merge::{MergeEngine, MergeError};
use taskdeck_db::store::Store;

/// Orchestrates the merge engine for the HTTP layer. Failures are logged here
/// once, so handlers only translate them into responses.
#[derive(Clone)]
pub struct MergeService {
    engine: Arc<MergeEngine>,
}

impl MergeService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            engine: Arc::new(MergeEngine::new(store)),
        }
    }

    pub async fn merge(
        &self,
        source_org_id: i64,
        target_org_id: i64,
        actor_id: i64,
    ) -> Result<i64, MergeError> {
        self.engine
            .merge(source_org_id, target_org_id, actor_id)
            .await
            .inspect_err(|e| {
                warn!(
                    "Merge of organization {} into {} failed: {}",
                    source_org_id, target_org_id, e
                );
            })
    }

    pub async fn revert(&self, event_id: i64, actor_id: i64) -> Result<(), MergeError> {
        self.engine
            .revert(event_id, actor_id)
            .await
            .inspect_err(|e| {
                warn!("Revert of merge event {} failed: {}", event_id, e);
            })
    }
}
