//! PostgreSQL ledger store
//!
//! Every financial operation opens its own transaction with `pool.begin()`,
//! locks the row it is about to change (`SELECT ... FOR UPDATE`) or updates it
//! with a compare-and-set `WHERE` clause, and commits at the end. Returning
//! early drops the transaction, which rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::query::{Table, UpdateBuilder};
use super::schema::LEDGER_SCHEMA;
use super::{LedgerStats, LedgerStore};
use crate::config::StoreConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::*;

const PAYMENT_REQUEST_COLUMNS: &str = "id, user_id, purpose, amount, network, deposit_address, status, tx_hash, \
     confirmations, failure_reason, linked_kind, linked_id, expires_at, created_at, updated_at";

const PACKAGE_COLUMNS: &str = "id, user_id, amount, package_type, status, is_expired, network, investment_date, \
     expiry_date, last_roi_date, next_roi_date, roi_paid_count, total_roi_paid, created_at";

const BOT_COLUMNS: &str = "id, user_id, bot_type, status, is_expired, activation_date, expiry_date";

const TRANSACTION_COLUMNS: &str = "id, user_id, tx_type, amount, status, network, tx_hash, description, verified, \
     last_checked_at, audit_note, created_at, updated_at";

const EARNING_COLUMNS: &str = "id, user_id, amount, earning_type, level, package_id, transaction_id, status, \
     description, created_at";

const REFERRAL_TYPES: &str = "('DIRECT_REFERRAL', 'LEVEL_REFERRAL')";

fn parse_column<T>(value: &str, column: &str, parse: fn(&str) -> Option<T>) -> LedgerResult<T> {
    parse(value).ok_or_else(|| LedgerError::Serialization(format!("unknown {} value '{}'", column, value)))
}

fn payment_request_from_row(row: &PgRow) -> LedgerResult<PaymentRequest> {
    let purpose: String = row.try_get("purpose")?;
    let network: String = row.try_get("network")?;
    let status: String = row.try_get("status")?;
    let linked_kind: Option<String> = row.try_get("linked_kind")?;
    let linked_id: Option<Uuid> = row.try_get("linked_id")?;
    let confirmations: i32 = row.try_get("confirmations")?;

    Ok(PaymentRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        purpose: parse_column(&purpose, "purpose", PaymentPurpose::parse)?,
        amount: row.try_get("amount")?,
        network: parse_column(&network, "network", Network::parse)?,
        deposit_address: row.try_get("deposit_address")?,
        status: parse_column(&status, "status", PaymentStatus::parse)?,
        tx_hash: row.try_get("tx_hash")?,
        confirmations: confirmations.max(0) as u32,
        failure_reason: row.try_get("failure_reason")?,
        linked: LinkedEntity::from_parts(linked_kind.as_deref(), linked_id).ok_or_else(|| {
            LedgerError::Serialization(format!("inconsistent linked entity {:?}/{:?}", linked_kind, linked_id))
        })?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn package_from_row(row: &PgRow) -> LedgerResult<Package> {
    let package_type: String = row.try_get("package_type")?;
    let status: String = row.try_get("status")?;
    let network: String = row.try_get("network")?;
    let roi_paid_count: i32 = row.try_get("roi_paid_count")?;

    Ok(Package {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        package_type: parse_column(&package_type, "package_type", PackageType::parse)?,
        status: parse_column(&status, "status", PackageStatus::parse)?,
        is_expired: row.try_get("is_expired")?,
        network: parse_column(&network, "network", Network::parse)?,
        investment_date: row.try_get("investment_date")?,
        expiry_date: row.try_get("expiry_date")?,
        last_roi_date: row.try_get("last_roi_date")?,
        next_roi_date: row.try_get("next_roi_date")?,
        roi_paid_count: roi_paid_count.max(0) as u32,
        total_roi_paid: row.try_get("total_roi_paid")?,
        created_at: row.try_get("created_at")?,
    })
}

fn bot_from_row(row: &PgRow) -> LedgerResult<BotActivation> {
    let bot_type: String = row.try_get("bot_type")?;
    let status: String = row.try_get("status")?;
    Ok(BotActivation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        bot_type: parse_column(&bot_type, "bot_type", PackageType::parse)?,
        status: parse_column(&status, "status", BotStatus::parse)?,
        is_expired: row.try_get("is_expired")?,
        activation_date: row.try_get("activation_date")?,
        expiry_date: row.try_get("expiry_date")?,
    })
}

fn transaction_from_row(row: &PgRow) -> LedgerResult<Transaction> {
    let tx_type: String = row.try_get("tx_type")?;
    let status: String = row.try_get("status")?;
    let network: Option<String> = row.try_get("network")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tx_type: parse_column(&tx_type, "tx_type", TransactionType::parse)?,
        amount: row.try_get("amount")?,
        status: parse_column(&status, "status", TransactionStatus::parse)?,
        network: match network {
            Some(n) => Some(parse_column(&n, "network", Network::parse)?),
            None => None,
        },
        tx_hash: row.try_get("tx_hash")?,
        description: row.try_get("description")?,
        verified: row.try_get("verified")?,
        last_checked_at: row.try_get("last_checked_at")?,
        audit_note: row.try_get("audit_note")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn earning_from_row(row: &PgRow) -> LedgerResult<Earning> {
    let earning_type: String = row.try_get("earning_type")?;
    let status: String = row.try_get("status")?;
    let level: Option<i16> = row.try_get("level")?;
    Ok(Earning {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        earning_type: parse_column(&earning_type, "earning_type", EarningType::parse)?,
        level: level.map(|l| l.clamp(0, u8::MAX as i16) as u8),
        package_id: row.try_get("package_id")?,
        transaction_id: row.try_get("transaction_id")?,
        status: parse_column(&status, "status", EarningStatus::parse)?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Map a unique violation on a hash column onto `DuplicateTxHash`
fn hash_conflict(e: sqlx::Error, tx_hash: Option<&str>) -> LedgerError {
    let unique = e
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    match (unique, tx_hash) {
        (true, Some(hash)) => LedgerError::DuplicateTxHash(hash.to_string()),
        _ => e.into(),
    }
}

async fn insert_transaction_row(conn: &mut PgConnection, tx: &Transaction) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (id, user_id, tx_type, amount, status, network, tx_hash, description,
                                  verified, last_checked_at, audit_note, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(tx.id)
    .bind(tx.user_id)
    .bind(tx.tx_type.as_str())
    .bind(tx.amount)
    .bind(tx.status.as_str())
    .bind(tx.network.map(|n| n.as_str()))
    .bind(&tx.tx_hash)
    .bind(&tx.description)
    .bind(tx.verified)
    .bind(tx.last_checked_at)
    .bind(&tx.audit_note)
    .bind(tx.created_at)
    .bind(tx.updated_at)
    .execute(conn)
    .await
    .map_err(|e| hash_conflict(e, tx.tx_hash.as_deref()))?;
    Ok(())
}

async fn insert_earning_row(conn: &mut PgConnection, earning: &Earning) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO earnings (id, user_id, amount, earning_type, level, package_id, transaction_id,
                              status, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(earning.id)
    .bind(earning.user_id)
    .bind(earning.amount)
    .bind(earning.earning_type.as_str())
    .bind(earning.level.map(i16::from))
    .bind(earning.package_id)
    .bind(earning.transaction_id)
    .bind(earning.status.as_str())
    .bind(&earning.description)
    .bind(earning.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

async fn check_hash_unclaimed(
    conn: &mut PgConnection,
    tx_hash: &str,
    request_id: &PaymentRequestId,
    allowed_tx: Option<TransactionId>,
) -> LedgerResult<()> {
    let claimed: bool = sqlx::query(
        r#"
        SELECT EXISTS (SELECT 1 FROM payment_requests WHERE tx_hash = $1 AND id <> $2)
            OR EXISTS (SELECT 1 FROM transactions WHERE tx_hash = $1 AND ($3::uuid IS NULL OR id <> $3))
        "#,
    )
    .bind(tx_hash)
    .bind(request_id)
    .bind(allowed_tx)
    .fetch_one(&mut *conn)
    .await?
    .try_get(0)?;
    if claimed {
        return Err(LedgerError::DuplicateTxHash(tx_hash.to_string()));
    }
    Ok(())
}

async fn lock_payment_status(conn: &mut PgConnection, id: &PaymentRequestId) -> LedgerResult<PaymentStatus> {
    let row = sqlx::query("SELECT status FROM payment_requests WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("payment request {}", id)))?;
    let status: String = row.try_get("status")?;
    parse_column(&status, "status", PaymentStatus::parse)
}

/// PostgreSQL ledger store
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect a pool
    ///
    /// Connections are health-checked before every acquire, closed after
    /// `idle_timeout_secs` idle and recycled after `max_lifetime_secs`.
    pub async fn connect(config: &StoreConfig) -> LedgerResult<Self> {
        if config.database_url.is_empty() {
            return Err(LedgerError::Configuration("database URL is empty".to_string()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;
        info!(max_connections = config.max_connections, "Connected ledger store pool");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn init_schema(&self) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in LEDGER_SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(statements = LEDGER_SCHEMA.len(), "Ledger schema initialized");
        Ok(())
    }

    async fn fetch_packages(&self, sql: &str, now: DateTime<Utc>) -> LedgerResult<Vec<Package>> {
        let rows = sqlx::query(sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(package_from_row).collect()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    // ==================== Health ====================

    async fn ping(&self) -> LedgerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_stats(&self) -> LedgerResult<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM payment_requests WHERE status IN ('PENDING', 'CONFIRMING')) AS open_requests,
                (SELECT COUNT(*) FROM packages WHERE status = 'ACTIVE' AND NOT is_expired) AS active_packages,
                (SELECT COUNT(*) FROM bot_activations WHERE status = 'ACTIVE' AND NOT is_expired) AS active_bots,
                (SELECT COUNT(*) FROM transactions) AS transactions,
                (SELECT COUNT(*) FROM transactions WHERE NOT verified) AS unverified
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let count = |name: &str| -> LedgerResult<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };
        Ok(LedgerStats {
            open_payment_requests: count("open_requests")?,
            active_packages: count("active_packages")?,
            active_bots: count("active_bots")?,
            transactions: count("transactions")?,
            unverified_transactions: count("unverified")?,
        })
    }

    // ==================== Users & sessions ====================

    async fn save_user(&self, user: &User) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, referrer_id) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email, referrer_id = EXCLUDED.referrer_id
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(user.referrer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> LedgerResult<Option<User>> {
        let row = sqlx::query("SELECT id, email, referrer_id FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(User {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                referrer_id: row.try_get("referrer_id")?,
            })),
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &Session) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, expires_at) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired_sessions(&self, now: Timestamp) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ==================== Payment requests ====================

    async fn insert_payment_request(&self, request: &PaymentRequest) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_requests (id, user_id, purpose, amount, network, deposit_address, status, tx_hash,
                                          confirmations, failure_reason, linked_kind, linked_id, expires_at,
                                          created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.purpose.as_str())
        .bind(request.amount)
        .bind(request.network.as_str())
        .bind(&request.deposit_address)
        .bind(request.status.as_str())
        .bind(&request.tx_hash)
        .bind(request.confirmations as i32)
        .bind(&request.failure_reason)
        .bind(request.linked.kind())
        .bind(request.linked.id())
        .bind(request.expires_at)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment_request(&self, id: &PaymentRequestId) -> LedgerResult<Option<PaymentRequest>> {
        let sql = format!("SELECT {} FROM payment_requests WHERE id = $1", PAYMENT_REQUEST_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(payment_request_from_row).transpose()
    }

    async fn list_open_payment_requests(&self) -> LedgerResult<Vec<PaymentRequest>> {
        let sql = format!(
            "SELECT {} FROM payment_requests WHERE status IN ('PENDING', 'CONFIRMING') ORDER BY created_at",
            PAYMENT_REQUEST_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(payment_request_from_row).collect()
    }

    async fn transition_payment_request(&self, transition: &PaymentTransition) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let current = lock_payment_status(&mut tx, &transition.request_id).await?;
        if current != transition.from {
            return Ok(false);
        }
        if !transition.from.can_transition_to(transition.to) {
            return Err(LedgerError::InvariantViolation(format!(
                "illegal payment transition {} -> {}",
                transition.from, transition.to
            )));
        }
        if let Some(hash) = &transition.tx_hash {
            check_hash_unclaimed(&mut tx, hash, &transition.request_id, None).await?;
        }

        let mut update = UpdateBuilder::new(Table::PaymentRequests)
            .set("status", transition.to.as_str())
            .set("updated_at", transition.at);
        if let Some(hash) = transition.tx_hash.clone() {
            update = update.set("tx_hash", hash);
        }
        if let Some(confirmations) = transition.confirmations {
            update = update.set("confirmations", confirmations as i32);
        }
        if let Some(reason) = transition.failure_reason.clone() {
            update = update.set("failure_reason", reason);
        }
        update
            .filter_eq("id", transition.request_id)
            .filter_eq("status", transition.from.as_str())
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn expire_payment_requests(&self, now: Timestamp) -> LedgerResult<Vec<PaymentRequestId>> {
        let rows = sqlx::query(
            r#"
            UPDATE payment_requests SET status = 'EXPIRED', updated_at = $1
            WHERE status = 'PENDING' AND expires_at < $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(LedgerError::from))
            .collect()
    }

    async fn settle_payment_request(&self, settlement: &PaymentSettlement) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let current = lock_payment_status(&mut tx, &settlement.request_id).await?;
        if current != settlement.from {
            return Ok(false);
        }
        if !settlement.from.can_transition_to(PaymentStatus::Completed) {
            return Err(LedgerError::InvariantViolation(format!(
                "illegal payment transition {} -> COMPLETED",
                settlement.from
            )));
        }
        let allowed_tx = match &settlement.deposit {
            DepositEntry::Insert(_) => None,
            DepositEntry::CompleteExisting(id) => Some(*id),
        };
        check_hash_unclaimed(&mut tx, &settlement.tx_hash, &settlement.request_id, allowed_tx).await?;

        match &settlement.deposit {
            DepositEntry::Insert(deposit) => insert_transaction_row(&mut tx, deposit).await?,
            DepositEntry::CompleteExisting(id) => {
                let affected = UpdateBuilder::new(Table::Transactions)
                    .set("status", TransactionStatus::Completed.as_str())
                    .set("updated_at", settlement.at)
                    .filter_eq("id", *id)
                    .execute(&mut tx)
                    .await?;
                if affected == 0 {
                    return Err(LedgerError::NotFound(format!("tracking transaction {}", id)));
                }
            }
        }

        match &settlement.activation {
            Some(Activation::Package {
                package_id,
                investment_date,
                expiry_date,
                next_roi_date,
            }) => {
                let affected = UpdateBuilder::new(Table::Packages)
                    .set("status", PackageStatus::Active.as_str())
                    .set("is_expired", false)
                    .set("investment_date", *investment_date)
                    .set("expiry_date", *expiry_date)
                    .set("next_roi_date", *next_roi_date)
                    .filter_eq("id", *package_id)
                    .filter_eq("status", PackageStatus::Pending.as_str())
                    .execute(&mut tx)
                    .await?;
                if affected == 0 {
                    return Err(LedgerError::InvalidState(format!(
                        "package {} is missing or not PENDING",
                        package_id
                    )));
                }
            }
            Some(Activation::Bot {
                bot_id,
                activation_date,
                expiry_date,
            }) => {
                let affected = UpdateBuilder::new(Table::BotActivations)
                    .set("status", BotStatus::Active.as_str())
                    .set("is_expired", false)
                    .set("activation_date", *activation_date)
                    .set("expiry_date", *expiry_date)
                    .filter_eq("id", *bot_id)
                    .filter_eq("status", BotStatus::Pending.as_str())
                    .execute(&mut tx)
                    .await?;
                if affected == 0 {
                    return Err(LedgerError::InvalidState(format!("bot {} is missing or not PENDING", bot_id)));
                }
            }
            None => {}
        }

        UpdateBuilder::new(Table::PaymentRequests)
            .set("status", PaymentStatus::Completed.as_str())
            .set("tx_hash", settlement.tx_hash.clone())
            .set("confirmations", settlement.confirmations as i32)
            .set("updated_at", settlement.at)
            .filter_eq("id", settlement.request_id)
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn open_manual_verification(&self, verification: &ManualVerification) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let current = lock_payment_status(&mut tx, &verification.request_id).await?;
        if current != PaymentStatus::Pending {
            return Ok(false);
        }
        check_hash_unclaimed(&mut tx, &verification.tx_hash, &verification.request_id, None).await?;

        insert_transaction_row(&mut tx, &verification.tracking).await?;
        UpdateBuilder::new(Table::PaymentRequests)
            .set("status", PaymentStatus::AwaitingAdminApproval.as_str())
            .set("tx_hash", verification.tx_hash.clone())
            .set("confirmations", verification.confirmations as i32)
            .set("updated_at", verification.at)
            .filter_eq("id", verification.request_id)
            .filter_eq("status", PaymentStatus::Pending.as_str())
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ==================== Packages & bots ====================

    async fn save_package(&self, package: &Package) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO packages (id, user_id, amount, package_type, status, is_expired, network, investment_date,
                                  expiry_date, last_roi_date, next_roi_date, roi_paid_count, total_roi_paid,
                                  created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                is_expired = EXCLUDED.is_expired,
                investment_date = EXCLUDED.investment_date,
                expiry_date = EXCLUDED.expiry_date,
                last_roi_date = EXCLUDED.last_roi_date,
                next_roi_date = EXCLUDED.next_roi_date,
                roi_paid_count = EXCLUDED.roi_paid_count,
                total_roi_paid = EXCLUDED.total_roi_paid
            "#,
        )
        .bind(package.id)
        .bind(package.user_id)
        .bind(package.amount)
        .bind(package.package_type.as_str())
        .bind(package.status.as_str())
        .bind(package.is_expired)
        .bind(package.network.as_str())
        .bind(package.investment_date)
        .bind(package.expiry_date)
        .bind(package.last_roi_date)
        .bind(package.next_roi_date)
        .bind(package.roi_paid_count as i32)
        .bind(package.total_roi_paid)
        .bind(package.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_package(&self, id: &PackageId) -> LedgerResult<Option<Package>> {
        let sql = format!("SELECT {} FROM packages WHERE id = $1", PACKAGE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(package_from_row).transpose()
    }

    async fn list_due_packages(&self, now: Timestamp) -> LedgerResult<Vec<Package>> {
        let sql = format!(
            "SELECT {} FROM packages WHERE status = 'ACTIVE' AND NOT is_expired AND next_roi_date <= $1 \
             ORDER BY next_roi_date",
            PACKAGE_COLUMNS
        );
        self.fetch_packages(&sql, now).await
    }

    async fn list_expirable_packages(&self, now: Timestamp) -> LedgerResult<Vec<Package>> {
        let sql = format!(
            "SELECT {} FROM packages WHERE status = 'ACTIVE' AND NOT is_expired \
             AND (expiry_date <= $1 OR roi_paid_count >= {}) ORDER BY expiry_date",
            PACKAGE_COLUMNS, MAX_ROI_PAYMENTS
        );
        self.fetch_packages(&sql, now).await
    }

    async fn save_bot(&self, bot: &BotActivation) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_activations (id, user_id, bot_type, status, is_expired, activation_date, expiry_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                is_expired = EXCLUDED.is_expired,
                activation_date = EXCLUDED.activation_date,
                expiry_date = EXCLUDED.expiry_date
            "#,
        )
        .bind(bot.id)
        .bind(bot.user_id)
        .bind(bot.bot_type.as_str())
        .bind(bot.status.as_str())
        .bind(bot.is_expired)
        .bind(bot.activation_date)
        .bind(bot.expiry_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bot(&self, id: &BotId) -> LedgerResult<Option<BotActivation>> {
        let sql = format!("SELECT {} FROM bot_activations WHERE id = $1", BOT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(bot_from_row).transpose()
    }

    async fn find_active_bot(
        &self,
        user_id: &UserId,
        bot_type: PackageType,
        now: Timestamp,
    ) -> LedgerResult<Option<BotActivation>> {
        let sql = format!(
            "SELECT {} FROM bot_activations WHERE user_id = $1 AND bot_type = $2 AND status = 'ACTIVE' \
             AND NOT is_expired AND expiry_date > $3 ORDER BY expiry_date DESC LIMIT 1",
            BOT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(bot_type.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bot_from_row).transpose()
    }

    async fn list_expirable_bots(&self, now: Timestamp) -> LedgerResult<Vec<BotActivation>> {
        let sql = format!(
            "SELECT {} FROM bot_activations WHERE status = 'ACTIVE' AND NOT is_expired AND expiry_date <= $1",
            BOT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(bot_from_row).collect()
    }

    async fn apply_roi_payout(&self, payout: &RoiPayout) -> LedgerResult<bool> {
        if payout.expected_paid_count >= MAX_ROI_PAYMENTS {
            return Err(LedgerError::InvariantViolation(format!(
                "package {} would exceed {} ROI payments",
                payout.package_id, MAX_ROI_PAYMENTS
            )));
        }

        let mut tx = self.pool.begin().await?;
        let affected = UpdateBuilder::new(Table::Packages)
            .set("last_roi_date", Some(payout.paid_at))
            .set("next_roi_date", payout.next_roi_date)
            .increment("roi_paid_count", 1i32)
            .increment("total_roi_paid", payout.amount)
            .filter_eq("id", payout.package_id)
            .filter_eq("status", PackageStatus::Active.as_str())
            .filter_eq("is_expired", false)
            .filter_eq("roi_paid_count", payout.expected_paid_count as i32)
            .filter_eq("next_roi_date", payout.expected_next_roi_date)
            .execute(&mut tx)
            .await?;
        if affected == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO roi_payments (id, package_id, user_id, amount, month_number, payment_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(payout.payment.id)
        .bind(payout.payment.package_id)
        .bind(payout.payment.user_id)
        .bind(payout.payment.amount)
        .bind(payout.payment.month_number as i32)
        .bind(payout.payment.payment_date)
        .execute(&mut *tx)
        .await?;
        insert_transaction_row(&mut tx, &payout.transaction).await?;
        insert_earning_row(&mut tx, &payout.earning).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn apply_capital_return(&self, capital_return: &CapitalReturn) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let affected = UpdateBuilder::new(Table::Packages)
            .set("status", PackageStatus::Expired.as_str())
            .set("is_expired", true)
            .filter_eq("id", capital_return.package_id)
            .filter_eq("status", PackageStatus::Active.as_str())
            .filter_eq("is_expired", false)
            .execute(&mut tx)
            .await?;
        if affected == 0 {
            return Ok(false);
        }
        insert_transaction_row(&mut tx, &capital_return.transaction).await?;
        insert_earning_row(&mut tx, &capital_return.earning).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn expire_bot(&self, id: &BotId, now: Timestamp) -> LedgerResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let affected = UpdateBuilder::new(Table::BotActivations)
            .set("status", BotStatus::Expired.as_str())
            .set("is_expired", true)
            .filter_eq("id", *id)
            .filter_eq("status", BotStatus::Active.as_str())
            .filter_eq("is_expired", false)
            .filter_lte("expiry_date", now)
            .execute(&mut conn)
            .await?;
        Ok(affected > 0)
    }

    async fn list_roi_payments(&self, package_id: &PackageId) -> LedgerResult<Vec<RoiPayment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, package_id, user_id, amount, month_number, payment_date
            FROM roi_payments WHERE package_id = $1 ORDER BY month_number
            "#,
        )
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let month: i32 = row.try_get("month_number")?;
                Ok(RoiPayment {
                    id: row.try_get("id")?,
                    package_id: row.try_get("package_id")?,
                    user_id: row.try_get("user_id")?,
                    amount: row.try_get("amount")?,
                    month_number: month.max(0) as u32,
                    payment_date: row.try_get("payment_date")?,
                })
            })
            .collect()
    }

    // ==================== System settings ====================

    async fn get_setting(&self, key: &str) -> LedgerResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn put_setting(&self, key: &str, value: &str) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value, updated_at) VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Ledger rows ====================

    async fn insert_transaction(&self, transaction: &Transaction) -> LedgerResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_transaction_row(&mut conn, transaction).await
    }

    async fn get_transaction(&self, id: &TransactionId) -> LedgerResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", TRANSACTION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_transaction_by_hash(&self, tx_hash: &str) -> LedgerResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE tx_hash = $1 ORDER BY created_at LIMIT 1",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql).bind(tx_hash).fetch_optional(&self.pool).await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn list_transactions(&self, user_id: &UserId) -> LedgerResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE user_id = $1 ORDER BY created_at",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn insert_earning(&self, earning: &Earning) -> LedgerResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_earning_row(&mut conn, earning).await
    }

    async fn list_earnings(&self, user_id: &UserId) -> LedgerResult<Vec<Earning>> {
        let sql = format!("SELECT {} FROM earnings WHERE user_id = $1 ORDER BY created_at", EARNING_COLUMNS);
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(earning_from_row).collect()
    }

    // ==================== Chain audit ====================

    async fn list_audit_candidates(&self, recheck_before: Timestamp, limit: usize) -> LedgerResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {} FROM transactions
            WHERE tx_type IN ('DEPOSIT', 'WITHDRAWAL')
              AND network IS NOT NULL AND tx_hash IS NOT NULL AND status <> 'FAILED'
              AND (last_checked_at IS NULL OR status = 'PENDING' OR last_checked_at < $1)
            ORDER BY
                CASE
                    WHEN last_checked_at IS NULL THEN 0
                    WHEN status = 'PENDING' THEN 1
                    WHEN NOT verified THEN 2
                    ELSE 3
                END,
                COALESCE(last_checked_at, created_at)
            LIMIT $2
            "#,
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(recheck_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn record_audit(&self, record: &AuditRecord) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                last_checked_at = $2,
                audit_note = $3,
                status = CASE WHEN $4 AND NOT verified AND status = 'PENDING' THEN 'COMPLETED' ELSE status END,
                updated_at = CASE WHEN $4 AND NOT verified THEN $2 ELSE updated_at END,
                verified = verified OR $4
            WHERE id = $1
            "#,
        )
        .bind(record.transaction_id)
        .bind(record.checked_at)
        .bind(record.note())
        .bind(record.verifies())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("transaction {}", record.transaction_id)));
        }
        Ok(())
    }

    async fn get_scan_state(&self, network: Network) -> LedgerResult<Option<BlockchainScanState>> {
        let row = sqlx::query(
            "SELECT last_scanned_block, last_scan_time FROM blockchain_scan_state WHERE network = $1",
        )
        .bind(network.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let block: i64 = row.try_get("last_scanned_block")?;
                Ok(Some(BlockchainScanState {
                    network,
                    last_scanned_block: block.max(0) as u64,
                    last_scan_time: row.try_get("last_scan_time")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_scan_state(&self, state: &BlockchainScanState) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blockchain_scan_state (network, last_scanned_block, last_scan_time) VALUES ($1, $2, $3)
            ON CONFLICT (network) DO UPDATE SET
                last_scanned_block = EXCLUDED.last_scanned_block,
                last_scan_time = EXCLUDED.last_scan_time
            "#,
        )
        .bind(state.network.as_str())
        .bind(state.last_scanned_block as i64)
        .bind(state.last_scan_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Referral distribution ====================

    async fn list_undistributed_referral_packages(&self) -> LedgerResult<Vec<PackageId>> {
        let sql = format!(
            r#"
            SELECT e.package_id, MIN(e.created_at) AS first_seen
            FROM earnings e JOIN transactions t ON t.id = e.transaction_id
            WHERE e.earning_type IN {} AND e.status IN ('PAID', 'PENDING')
              AND e.package_id IS NOT NULL AND t.tx_hash IS NULL
            GROUP BY e.package_id
            ORDER BY first_seen
            "#,
            REFERRAL_TYPES
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get("package_id").map_err(LedgerError::from))
            .collect()
    }

    async fn list_undistributed_referrals(&self, package_id: &PackageId) -> LedgerResult<Vec<ReferralLine>> {
        let sql = format!(
            r#"
            SELECT {} FROM earnings e
            WHERE e.package_id = $1 AND e.earning_type IN {} AND e.status IN ('PAID', 'PENDING')
              AND EXISTS (SELECT 1 FROM transactions t WHERE t.id = e.transaction_id AND t.tx_hash IS NULL)
            ORDER BY e.created_at
            "#,
            EARNING_COLUMNS, REFERRAL_TYPES
        );
        let earnings: Vec<Earning> = sqlx::query(&sql)
            .bind(package_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(earning_from_row)
            .collect::<LedgerResult<_>>()?;

        let ids: Vec<Uuid> = earnings.iter().filter_map(|e| e.transaction_id).collect();
        let sql = format!("SELECT {} FROM transactions WHERE id = ANY($1)", TRANSACTION_COLUMNS);
        let transactions: Vec<Transaction> = sqlx::query(&sql)
            .bind(&ids[..])
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(transaction_from_row)
            .collect::<LedgerResult<_>>()?;

        Ok(earnings
            .into_iter()
            .filter_map(|earning| {
                let transaction = transactions
                    .iter()
                    .find(|t| Some(t.id) == earning.transaction_id)?
                    .clone();
                Some(ReferralLine { earning, transaction })
            })
            .collect())
    }

    async fn mark_referrals_distributed(
        &self,
        lines: &[ReferralLine],
        tx_hash: &str,
        now: Timestamp,
    ) -> LedgerResult<u64> {
        let settled: Vec<Uuid> = lines.iter().map(|l| l.transaction.id).collect();
        let mut tx = self.pool.begin().await?;
        let ids: Vec<Uuid> = sqlx::query(
            r#"
            UPDATE transactions SET tx_hash = $2, status = 'COMPLETED', updated_at = $3
            WHERE id = ANY($1) AND tx_hash IS NULL
            RETURNING id
            "#,
        )
        .bind(&settled[..])
        .bind(tx_hash)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get("id"))
        .collect::<Result<_, _>>()?;

        sqlx::query("UPDATE earnings SET status = 'PAID' WHERE transaction_id = ANY($1)")
            .bind(&ids[..])
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_column_rejects_unknown() {
        let err = parse_column("SOMETHING", "status", PaymentStatus::parse).unwrap_err();
        assert!(matches!(err, LedgerError::Serialization(_)));
        assert_eq!(
            parse_column("AWAITING_ADMIN_APPROVAL", "status", PaymentStatus::parse).unwrap(),
            PaymentStatus::AwaitingAdminApproval
        );
    }
}
