//! Ledger Engine Configuration
//!
//! Deposit networks, job schedules, payout policy and store settings.
//! Supports loading from environment variables with the LEDGER_ prefix.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};
use crate::jobs::JobKind;
use crate::types::{Network, PackageType};

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Per-network deposit and RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: Network,
    /// Fixed platform deposit address on this network
    pub deposit_address: String,
    /// JSON-RPC endpoint (BEP20) or TronGrid base URL (TRC20)
    pub rpc_url: String,
    /// Optional API key sent with every RPC request
    pub api_key: Option<String>,
    /// Stablecoin contract address
    pub token_contract: String,
    /// Confirmations required before a deposit is final
    pub required_confirmations: u32,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// How many blocks back `transfers_to` searches
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_lookback_blocks() -> u64 {
    2_000
}

impl NetworkConfig {
    /// Defaults for a network, without a deposit address
    pub fn defaults(network: Network) -> Self {
        match network {
            Network::Bep20 => Self {
                network,
                deposit_address: String::new(),
                rpc_url: "https://bsc-dataseed.binance.org".to_string(),
                api_key: None,
                token_contract: "0x55d398326f99059fF775485246999027B3197955".to_string(),
                required_confirmations: 15,
                timeout_secs: 30,
                lookback_blocks: 2_000,
            },
            Network::Trc20 => Self {
                network,
                deposit_address: String::new(),
                rpc_url: "https://api.trongrid.io".to_string(),
                api_key: None,
                token_contract: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
                required_confirmations: 19,
                timeout_secs: 30,
                lookback_blocks: 2_000,
            },
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables (`<NET>` is `BEP20` or `TRC20`):
    /// - LEDGER_<NET>_DEPOSIT_ADDRESS: Platform deposit address
    /// - LEDGER_<NET>_RPC_URL: RPC / API endpoint
    /// - LEDGER_<NET>_API_KEY: API key (optional)
    /// - LEDGER_<NET>_TOKEN_CONTRACT: Token contract override
    /// - LEDGER_<NET>_CONFIRMATIONS: Required confirmations override
    /// - LEDGER_<NET>_RPC_TIMEOUT: Request timeout in seconds
    pub fn from_env(network: Network) -> Self {
        let defaults = Self::defaults(network);
        let prefix = format!("LEDGER_{}", network.as_str());

        Self {
            network,
            deposit_address: env::var(format!("{}_DEPOSIT_ADDRESS", prefix)).unwrap_or_default(),
            rpc_url: env::var(format!("{}_RPC_URL", prefix)).unwrap_or(defaults.rpc_url),
            api_key: env::var(format!("{}_API_KEY", prefix)).ok(),
            token_contract: env::var(format!("{}_TOKEN_CONTRACT", prefix))
                .unwrap_or(defaults.token_contract),
            required_confirmations: env_parse(&format!("{}_CONFIRMATIONS", prefix))
                .unwrap_or(defaults.required_confirmations),
            timeout_secs: env_parse(&format!("{}_RPC_TIMEOUT", prefix)).unwrap_or(defaults.timeout_secs),
            lookback_blocks: env_parse(&format!("{}_LOOKBACK_BLOCKS", prefix))
                .unwrap_or(defaults.lookback_blocks),
        }
    }

    /// Set the deposit address
    pub fn with_deposit_address(mut self, address: &str) -> Self {
        self.deposit_address = address.to_string();
        self
    }
}

/// Recurring job intervals in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub payment_scan_secs: u64,
    pub roi_payout_secs: u64,
    pub expiration_secs: u64,
    pub blockchain_sync_secs: u64,
    pub session_cleanup_secs: u64,
    pub referral_dispatch_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            payment_scan_secs: 120,
            roi_payout_secs: 15 * 60,
            expiration_secs: 24 * 60 * 60,
            blockchain_sync_secs: 10 * 60,
            session_cleanup_secs: 24 * 60 * 60,
            referral_dispatch_secs: 5 * 60,
        }
    }
}

impl ScheduleConfig {
    /// Interval for a job
    pub fn interval(&self, kind: JobKind) -> Duration {
        let secs = match kind {
            JobKind::PaymentScan => self.payment_scan_secs,
            JobKind::RoiPayout => self.roi_payout_secs,
            JobKind::Expiration => self.expiration_secs,
            JobKind::BlockchainSync => self.blockchain_sync_secs,
            JobKind::SessionCleanup => self.session_cleanup_secs,
            JobKind::ReferralDispatch => self.referral_dispatch_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Load overrides from LEDGER_SCHEDULE_<JOB>_SECS
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let get = |kind: JobKind, default: u64| {
            env_parse(&format!("LEDGER_SCHEDULE_{}_SECS", kind.env_name())).unwrap_or(default)
        };
        Self {
            payment_scan_secs: get(JobKind::PaymentScan, defaults.payment_scan_secs),
            roi_payout_secs: get(JobKind::RoiPayout, defaults.roi_payout_secs),
            expiration_secs: get(JobKind::Expiration, defaults.expiration_secs),
            blockchain_sync_secs: get(JobKind::BlockchainSync, defaults.blockchain_sync_secs),
            session_cleanup_secs: get(JobKind::SessionCleanup, defaults.session_cleanup_secs),
            referral_dispatch_secs: get(JobKind::ReferralDispatch, defaults.referral_dispatch_secs),
        }
    }
}

/// ROI payout policy constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiPolicy {
    /// Payout interval for demo package types
    pub demo_interval_secs: i64,
    /// Payout interval for standard package types
    pub standard_interval_secs: i64,
    /// Lifetime of an activated bot
    pub bot_term_days: i64,
}

impl Default for RoiPolicy {
    fn default() -> Self {
        Self {
            demo_interval_secs: 60 * 60,
            standard_interval_secs: 30 * 24 * 60 * 60,
            bot_term_days: 365,
        }
    }
}

impl RoiPolicy {
    pub fn interval_for(&self, package_type: PackageType) -> ChronoDuration {
        if package_type.is_demo() {
            ChronoDuration::seconds(self.demo_interval_secs)
        } else {
            ChronoDuration::seconds(self.standard_interval_secs)
        }
    }

    pub fn bot_term(&self) -> ChronoDuration {
        ChronoDuration::days(self.bot_term_days)
    }
}

/// Payment request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Lifetime of a PENDING request in seconds
    pub request_ttl_secs: i64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: 30 * 60,
        }
    }
}

impl PaymentConfig {
    pub fn request_ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.request_ttl_secs)
    }
}

/// Chain audit throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Transactions fetched per batch
    pub batch_size: usize,
    /// Pause between batches in milliseconds
    pub batch_pause_ms: u64,
    /// Verified rows are rechecked after this many days
    pub recheck_after_days: i64,
    /// Upper bound of rows audited per run
    pub max_per_run: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause_ms: 2_000,
            recheck_after_days: 7,
            max_per_run: 200,
        }
    }
}

impl AuditConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn recheck_after(&self) -> ChronoDuration {
        ChronoDuration::days(self.recheck_after_days)
    }
}

/// Referral distribution worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    /// Attempts per package before the job is dropped until the next dispatch
    pub max_attempts: u32,
    pub retry_initial_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    /// Bounded queue capacity
    pub queue_capacity: usize,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_initial_delay_secs: 30,
            retry_max_delay_secs: 1_800,
            queue_capacity: 256,
        }
    }
}

/// Ledger store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL URL; empty selects the in-memory store
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Idle connections are closed after this long
    pub idle_timeout_secs: u64,
    /// Every connection is recycled after this long
    pub max_lifetime_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 5 * 60,
            max_lifetime_secs: 30 * 60,
        }
    }
}

/// Notification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving notifications as JSON; `None` logs them instead
    pub webhook_url: Option<String>,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bep20: NetworkConfig,
    pub trc20: NetworkConfig,
    pub schedule: ScheduleConfig,
    pub roi: RoiPolicy,
    pub payment: PaymentConfig,
    pub audit: AuditConfig,
    pub referral: ReferralConfig,
    pub store: StoreConfig,
    pub notify: NotifyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bep20: NetworkConfig::defaults(Network::Bep20),
            trc20: NetworkConfig::defaults(Network::Trc20),
            schedule: ScheduleConfig::default(),
            roi: RoiPolicy::default(),
            payment: PaymentConfig::default(),
            audit: AuditConfig::default(),
            referral: ReferralConfig::default(),
            store: StoreConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - LEDGER_DATABASE_URL: PostgreSQL URL (falls back to DATABASE_URL)
    /// - LEDGER_DB_MAX_CONNECTIONS: Pool size
    /// - LEDGER_DB_IDLE_TIMEOUT: Idle connection timeout in seconds
    /// - LEDGER_DB_MAX_LIFETIME: Connection recycle age in seconds
    /// - LEDGER_PAYMENT_TTL_SECS: Payment request lifetime
    /// - LEDGER_AUDIT_BATCH_SIZE / LEDGER_AUDIT_BATCH_PAUSE_MS: Audit throttling
    /// - LEDGER_ROI_DEMO_INTERVAL_SECS / LEDGER_ROI_STANDARD_INTERVAL_SECS: Payout intervals
    /// - LEDGER_NOTIFY_WEBHOOK_URL: Notification webhook
    ///
    /// Also reads network and schedule config from their respective env vars.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let store = StoreConfig {
            database_url: env::var("LEDGER_DATABASE_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .unwrap_or_default(),
            max_connections: env_parse("LEDGER_DB_MAX_CONNECTIONS")
                .unwrap_or(defaults.store.max_connections),
            idle_timeout_secs: env_parse("LEDGER_DB_IDLE_TIMEOUT")
                .unwrap_or(defaults.store.idle_timeout_secs),
            max_lifetime_secs: env_parse("LEDGER_DB_MAX_LIFETIME")
                .unwrap_or(defaults.store.max_lifetime_secs),
            ..defaults.store
        };

        Self {
            bep20: NetworkConfig::from_env(Network::Bep20),
            trc20: NetworkConfig::from_env(Network::Trc20),
            schedule: ScheduleConfig::from_env(),
            roi: RoiPolicy {
                demo_interval_secs: env_parse("LEDGER_ROI_DEMO_INTERVAL_SECS")
                    .unwrap_or(defaults.roi.demo_interval_secs),
                standard_interval_secs: env_parse("LEDGER_ROI_STANDARD_INTERVAL_SECS")
                    .unwrap_or(defaults.roi.standard_interval_secs),
                bot_term_days: env_parse("LEDGER_BOT_TERM_DAYS").unwrap_or(defaults.roi.bot_term_days),
            },
            payment: PaymentConfig {
                request_ttl_secs: env_parse("LEDGER_PAYMENT_TTL_SECS")
                    .unwrap_or(defaults.payment.request_ttl_secs),
            },
            audit: AuditConfig {
                batch_size: env_parse("LEDGER_AUDIT_BATCH_SIZE").unwrap_or(defaults.audit.batch_size),
                batch_pause_ms: env_parse("LEDGER_AUDIT_BATCH_PAUSE_MS")
                    .unwrap_or(defaults.audit.batch_pause_ms),
                ..defaults.audit
            },
            referral: defaults.referral,
            store,
            notify: NotifyConfig {
                webhook_url: env::var("LEDGER_NOTIFY_WEBHOOK_URL").ok(),
            },
        }
    }

    /// Development configuration: short schedules, no throttling pause, in-memory store
    pub fn development() -> Self {
        Self {
            bep20: NetworkConfig::defaults(Network::Bep20)
                .with_deposit_address("0x000000000000000000000000000000000000dEaD"),
            trc20: NetworkConfig::defaults(Network::Trc20)
                .with_deposit_address("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7"),
            schedule: ScheduleConfig {
                payment_scan_secs: 10,
                roi_payout_secs: 30,
                expiration_secs: 60,
                blockchain_sync_secs: 30,
                session_cleanup_secs: 60,
                referral_dispatch_secs: 20,
            },
            roi: RoiPolicy {
                demo_interval_secs: 60,
                ..RoiPolicy::default()
            },
            payment: PaymentConfig::default(),
            audit: AuditConfig {
                batch_pause_ms: 0,
                ..AuditConfig::default()
            },
            referral: ReferralConfig {
                retry_initial_delay_secs: 1,
                retry_max_delay_secs: 10,
                ..ReferralConfig::default()
            },
            store: StoreConfig::default(),
            notify: NotifyConfig::default(),
        }
    }

    /// Configuration of one network
    pub fn network(&self, network: Network) -> &NetworkConfig {
        match network {
            Network::Bep20 => &self.bep20,
            Network::Trc20 => &self.trc20,
        }
    }

    /// Deposit address of one network, or a configuration error when unset
    pub fn deposit_address(&self, network: Network) -> LedgerResult<&str> {
        let address = self.network(network).deposit_address.as_str();
        if address.is_empty() {
            return Err(LedgerError::Configuration(format!(
                "no deposit address configured for {}",
                network
            )));
        }
        Ok(address)
    }

    pub fn required_confirmations(&self, network: Network) -> u32 {
        self.network(network).required_confirmations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.interval(JobKind::PaymentScan), Duration::from_secs(120));
        assert_eq!(schedule.interval(JobKind::RoiPayout), Duration::from_secs(900));
        assert_eq!(schedule.interval(JobKind::Expiration), Duration::from_secs(86_400));
        assert_eq!(schedule.interval(JobKind::BlockchainSync), Duration::from_secs(600));
        assert_eq!(schedule.interval(JobKind::SessionCleanup), Duration::from_secs(86_400));
        assert_eq!(schedule.interval(JobKind::ReferralDispatch), Duration::from_secs(300));
    }

    #[test]
    fn test_roi_intervals() {
        let policy = RoiPolicy::default();
        assert_eq!(policy.interval_for(PackageType::Demo), ChronoDuration::hours(1));
        assert_eq!(policy.interval_for(PackageType::Neo), ChronoDuration::days(30));
    }

    #[test]
    fn test_missing_deposit_address() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.deposit_address(Network::Bep20),
            Err(LedgerError::Configuration(_))
        ));

        let config = EngineConfig::development();
        assert!(config.deposit_address(Network::Trc20).is_ok());
        assert_eq!(config.required_confirmations(Network::Bep20), 15);
    }

    #[test]
    fn test_audit_defaults() {
        let audit = AuditConfig::default();
        assert_eq!(audit.batch_size, 10);
        assert_eq!(audit.batch_pause(), Duration::from_secs(2));
        assert_eq!(audit.recheck_after(), ChronoDuration::days(7));
    }
}
