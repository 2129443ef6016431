//! Session cleanup job

use async_trait::async_trait;
use tracing::info;

use super::{CronJob, JobKind, JobReport};
use crate::context::EngineContext;
use crate::error::LedgerResult;
use crate::storage::LedgerStore;

/// Deletes sessions past their expiry
pub struct SessionCleanupJob<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
}

impl<S: LedgerStore + 'static> SessionCleanupJob<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> CronJob for SessionCleanupJob<S> {
    fn kind(&self) -> JobKind {
        JobKind::SessionCleanup
    }

    async fn run(&self) -> LedgerResult<JobReport> {
        let deleted = self.ctx.store.delete_expired_sessions(self.ctx.now()).await?;
        self.ctx.metrics.sessions_deleted(deleted);
        if deleted > 0 {
            info!(deleted, "Expired sessions removed");
        }
        Ok(JobReport {
            processed: deleted,
            succeeded: deleted,
            failed: 0,
        })
    }
}
