//! PostgreSQL schema
//!
//! Enum-like columns are stored as TEXT holding the `as_str()` names of the
//! corresponding Rust enums. Amounts are NUMERIC so no precision is lost
//! between `rust_decimal::Decimal` and the database.

/// Statements creating every ledger table and index, idempotent
pub const LEDGER_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        email TEXT NOT NULL,
        referrer_id UUID REFERENCES users(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS packages (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        amount NUMERIC(30, 8) NOT NULL CHECK (amount > 0),
        package_type TEXT NOT NULL,
        status TEXT NOT NULL,
        is_expired BOOLEAN NOT NULL DEFAULT FALSE,
        network TEXT NOT NULL,
        investment_date TIMESTAMPTZ NOT NULL,
        expiry_date TIMESTAMPTZ NOT NULL,
        last_roi_date TIMESTAMPTZ,
        next_roi_date TIMESTAMPTZ NOT NULL,
        roi_paid_count INTEGER NOT NULL DEFAULT 0 CHECK (roi_paid_count BETWEEN 0 AND 12),
        total_roi_paid NUMERIC(30, 8) NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_packages_due ON packages (next_roi_date) WHERE status = 'ACTIVE' AND NOT is_expired",
    r#"
    CREATE TABLE IF NOT EXISTS bot_activations (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        bot_type TEXT NOT NULL,
        status TEXT NOT NULL,
        is_expired BOOLEAN NOT NULL DEFAULT FALSE,
        activation_date TIMESTAMPTZ NOT NULL,
        expiry_date TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_bot_activations_user ON bot_activations (user_id, bot_type)",
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        tx_type TEXT NOT NULL,
        amount NUMERIC(30, 8) NOT NULL,
        status TEXT NOT NULL,
        network TEXT,
        tx_hash TEXT,
        description TEXT NOT NULL DEFAULT '',
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        last_checked_at TIMESTAMPTZ,
        audit_note TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_chain_hash ON transactions (tx_hash) WHERE tx_type IN ('DEPOSIT', 'WITHDRAWAL') AND tx_hash IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_audit ON transactions (last_checked_at NULLS FIRST) WHERE tx_hash IS NOT NULL",
    r#"
    CREATE TABLE IF NOT EXISTS earnings (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        amount NUMERIC(30, 8) NOT NULL,
        earning_type TEXT NOT NULL,
        level SMALLINT,
        package_id UUID,
        transaction_id UUID REFERENCES transactions(id),
        status TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_earnings_package ON earnings (package_id)",
    r#"
    CREATE TABLE IF NOT EXISTS roi_payments (
        id UUID PRIMARY KEY,
        package_id UUID NOT NULL REFERENCES packages(id),
        user_id UUID NOT NULL,
        amount NUMERIC(30, 8) NOT NULL,
        month_number INTEGER NOT NULL CHECK (month_number BETWEEN 1 AND 12),
        payment_date TIMESTAMPTZ NOT NULL,
        UNIQUE (package_id, month_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS withdrawals (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        amount NUMERIC(30, 8) NOT NULL,
        network TEXT NOT NULL,
        address TEXT NOT NULL,
        status TEXT NOT NULL,
        tx_hash TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payment_requests (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        purpose TEXT NOT NULL,
        amount NUMERIC(30, 8) NOT NULL CHECK (amount > 0),
        network TEXT NOT NULL,
        deposit_address TEXT NOT NULL,
        status TEXT NOT NULL,
        tx_hash TEXT UNIQUE,
        confirmations INTEGER NOT NULL DEFAULT 0,
        failure_reason TEXT,
        linked_kind TEXT,
        linked_id UUID,
        expires_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_payment_requests_open ON payment_requests (created_at) WHERE status IN ('PENDING', 'CONFIRMING')",
    r#"
    CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blockchain_scan_state (
        network TEXT PRIMARY KEY,
        last_scanned_block BIGINT NOT NULL,
        last_scan_time TIMESTAMPTZ NOT NULL
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        for statement in LEDGER_SCHEMA {
            let s = statement.trim_start();
            assert!(
                s.starts_with("CREATE TABLE IF NOT EXISTS")
                    || s.starts_with("CREATE INDEX IF NOT EXISTS")
                    || s.starts_with("CREATE UNIQUE INDEX IF NOT EXISTS"),
                "non-idempotent statement: {}",
                s
            );
        }
    }
}
