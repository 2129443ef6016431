//! Shared handles passed to the gateway, scanner and jobs

use std::sync::Arc;

use crate::chain::ChainReader;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::metrics::LedgerMetrics;
use crate::notify::{notify_user, Notifier};
use crate::storage::LedgerStore;
use crate::types::{Timestamp, UserId};

/// Collaborators every component works against
pub struct EngineContext<S: LedgerStore + 'static> {
    pub store: Arc<S>,
    pub chain: Arc<dyn ChainReader>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<LedgerMetrics>,
}

impl<S: LedgerStore + 'static> Clone for EngineContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chain: self.chain.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: LedgerStore + 'static> EngineContext<S> {
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Best-effort notification to a user
    pub async fn notify(&self, user_id: &UserId, subject: &str, body: &str) {
        notify_user(self.store.as_ref(), self.notifier.as_ref(), user_id, subject, body).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chain::MemoryChainReader;
    use crate::clock::ManualClock;
    use crate::notify::MemoryNotifier;
    use crate::storage::MemoryLedgerStore;
    use chrono::{TimeZone, Utc};

    pub(crate) struct Harness {
        pub ctx: EngineContext<MemoryLedgerStore>,
        pub store: Arc<MemoryLedgerStore>,
        pub chain: MemoryChainReader,
        pub clock: Arc<ManualClock>,
        pub notifier: MemoryNotifier,
    }

    /// In-memory context on the development config, clock at 2024-01-01
    pub(crate) fn harness() -> Harness {
        let store = Arc::new(MemoryLedgerStore::new());
        let chain = MemoryChainReader::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let notifier = MemoryNotifier::new();
        let ctx = EngineContext {
            store: store.clone(),
            chain: Arc::new(chain.clone()),
            notifier: Arc::new(notifier.clone()),
            clock: clock.clone(),
            config: Arc::new(EngineConfig::development()),
            metrics: Arc::new(LedgerMetrics::new()),
        };
        Harness {
            ctx,
            store,
            chain,
            clock,
            notifier,
        }
    }
}
