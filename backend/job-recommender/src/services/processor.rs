use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{JobIndexer, RecommendationEngine};
use crate::error::ServiceError;
use crate::events::{EventHandler, IndexEvent};
use crate::index::{IndexPersistence, SharedJobIndex};

/// Consumer-facing handler: indexes job events, recommends on profile
/// events and persists the index on its interval
pub struct EventProcessor {
    indexer: JobIndexer,
    engine: Arc<RecommendationEngine>,
    persistence: IndexPersistence,
    index: SharedJobIndex,
}

impl EventProcessor {
    pub fn new(
        indexer: JobIndexer,
        engine: Arc<RecommendationEngine>,
        persistence: IndexPersistence,
        index: SharedJobIndex,
    ) -> Self {
        Self {
            indexer,
            engine,
            persistence,
            index,
        }
    }

    async fn persist_if_due(&self) {
        if !self.persistence.has_unsaved(&self.index) {
            return;
        }
        // The event itself succeeded; a failed write stays due and is
        // retried after the next event
        if let Err(e) = self.persistence.maybe_persist(&self.index).await {
            warn!(error = %e, "Scheduled index persist failed");
        }
    }
}

#[async_trait]
impl EventHandler for EventProcessor {
    async fn handle_job(&self, event: &IndexEvent) -> Result<(), ServiceError> {
        let job = match event {
            IndexEvent::JobCreated(job) | IndexEvent::JobUpdated(job) => job,
            _ => return Ok(()),
        };
        self.indexer.index_job(job).await?;
        self.persist_if_due().await;
        Ok(())
    }

    async fn handle_profile(&self, event: &IndexEvent) -> Result<(), ServiceError> {
        let IndexEvent::ProfileUpdated(profile) = event else {
            return Ok(());
        };
        self.engine
            .recommend(profile.user_id, &profile.detail, None)
            .await?;
        Ok(())
    }

    async fn on_shutdown(&self) {
        if !self.persistence.has_unsaved(&self.index) {
            info!("Job index already persisted; nothing to flush");
            return;
        }
        match self.persistence.persist(&self.index).await {
            Ok(()) => info!("Final job index persist complete"),
            Err(e) => error!(error = %e, "Final job index persist failed"),
        }
    }
}
