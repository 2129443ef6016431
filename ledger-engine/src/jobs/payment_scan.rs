//! Payment scan job: deposit discovery over open payment requests

use async_trait::async_trait;

use super::{CronJob, JobKind, JobReport};
use crate::context::EngineContext;
use crate::error::LedgerResult;
use crate::scanner::Scanner;
use crate::storage::LedgerStore;

pub struct PaymentScanJob<S: LedgerStore + 'static> {
    scanner: Scanner<S>,
}

impl<S: LedgerStore + 'static> PaymentScanJob<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self {
            scanner: Scanner::new(ctx),
        }
    }
}

#[async_trait]
impl<S: LedgerStore + 'static> CronJob for PaymentScanJob<S> {
    fn kind(&self) -> JobKind {
        JobKind::PaymentScan
    }

    async fn run(&self) -> LedgerResult<JobReport> {
        let report = self.scanner.discover().await?;
        Ok(JobReport::from(&report))
    }
}
