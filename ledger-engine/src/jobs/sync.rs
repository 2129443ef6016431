//! Blockchain sync job: ledger audit plus per-network scan cursors

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CronJob, JobKind, JobReport};
use crate::context::EngineContext;
use crate::error::LedgerResult;
use crate::scanner::{AuditReport, Scanner};
use crate::storage::LedgerStore;
use crate::types::{BlockchainScanState, Network};

pub struct BlockchainSyncJob<S: LedgerStore + 'static> {
    ctx: EngineContext<S>,
    scanner: Scanner<S>,
}

impl<S: LedgerStore + 'static> BlockchainSyncJob<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self {
            scanner: Scanner::new(ctx.clone()),
            ctx,
        }
    }

    /// Advance the scan cursor of one network; it never moves backwards
    async fn advance_cursor(&self, network: Network, report: &AuditReport) -> LedgerResult<BlockchainScanState> {
        let previous = self
            .ctx
            .store
            .get_scan_state(network)
            .await?
            .map(|s| s.last_scanned_block)
            .unwrap_or(0);
        let head = match self.ctx.chain.latest_block(network).await {
            Ok(head) => head,
            Err(e) => {
                warn!(network = %network, error = %e, "Could not read chain head");
                0
            }
        };
        let seen = report.highest_blocks.get(&network).copied().unwrap_or(0);

        let state = BlockchainScanState {
            network,
            last_scanned_block: previous.max(head).max(seen),
            last_scan_time: self.ctx.now(),
        };
        self.ctx.store.save_scan_state(&state).await?;
        debug!(network = %network, block = state.last_scanned_block, "Scan cursor saved");
        Ok(state)
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> CronJob for BlockchainSyncJob<S> {
    fn kind(&self) -> JobKind {
        JobKind::BlockchainSync
    }

    async fn run(&self) -> LedgerResult<JobReport> {
        let report = self.scanner.audit().await?;
        for network in Network::all() {
            self.advance_cursor(network, &report).await?;
        }
        Ok(JobReport::from(&report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let h = harness();
        let job = BlockchainSyncJob::new(h.ctx.clone());

        h.chain.set_head(Network::Bep20, 500);
        job.run().await.unwrap();
        let state = h.store.get_scan_state(Network::Bep20).await.unwrap().unwrap();
        assert_eq!(state.last_scanned_block, 500);

        h.chain.set_head(Network::Bep20, 120);
        job.run().await.unwrap();
        let state = h.store.get_scan_state(Network::Bep20).await.unwrap().unwrap();
        assert_eq!(state.last_scanned_block, 500);
    }

    #[tokio::test]
    async fn test_unreachable_chain_keeps_cursor() {
        let h = harness();
        h.chain.set_head(Network::Trc20, 77);
        let job = BlockchainSyncJob::new(h.ctx.clone());
        job.run().await.unwrap();

        h.chain.set_unreachable(true);
        job.run().await.unwrap();
        let state = h.store.get_scan_state(Network::Trc20).await.unwrap().unwrap();
        assert_eq!(state.last_scanned_block, 77);
    }
}
