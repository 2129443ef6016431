//! Typed UPDATE builder
//!
//! Keeps the "SET from a map, WHERE from a map" ergonomics of hand-built SQL
//! without ever interpolating a value: table and column identifiers come from
//! a fixed whitelist, every value goes through `push_bind`.

use sqlx::postgres::PgConnection;
use sqlx::{Encode, Postgres, QueryBuilder, Type};

use crate::error::{LedgerError, LedgerResult};

/// Tables the builder may update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    PaymentRequests,
    Packages,
    BotActivations,
    Transactions,
    Earnings,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::PaymentRequests => "payment_requests",
            Table::Packages => "packages",
            Table::BotActivations => "bot_activations",
            Table::Transactions => "transactions",
            Table::Earnings => "earnings",
        }
    }

    /// Columns that may appear in SET or WHERE
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::PaymentRequests => &[
                "id",
                "status",
                "tx_hash",
                "confirmations",
                "failure_reason",
                "expires_at",
                "updated_at",
            ],
            Table::Packages => &[
                "id",
                "status",
                "is_expired",
                "investment_date",
                "expiry_date",
                "last_roi_date",
                "next_roi_date",
                "roi_paid_count",
                "total_roi_paid",
            ],
            Table::BotActivations => &["id", "status", "is_expired", "activation_date", "expiry_date"],
            Table::Transactions => &[
                "id",
                "status",
                "tx_hash",
                "verified",
                "last_checked_at",
                "audit_note",
                "updated_at",
            ],
            Table::Earnings => &["id", "status", "package_id"],
        }
    }

    fn check(&self, column: &str) -> LedgerResult<()> {
        if self.columns().contains(&column) {
            Ok(())
        } else {
            Err(LedgerError::InvalidInput(format!(
                "column {} is not updatable on {}",
                column,
                self.name()
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Set,
    Where,
}

/// Builder for `UPDATE <table> SET ... WHERE ...`
///
/// All SET clauses must come before the first filter. Errors are deferred to
/// [`UpdateBuilder::build`] so calls can be chained.
pub struct UpdateBuilder<'args> {
    table: Table,
    builder: QueryBuilder<'args, Postgres>,
    stage: Stage,
    sets: usize,
    filters: usize,
    error: Option<LedgerError>,
}

impl<'args> UpdateBuilder<'args> {
    pub fn new(table: Table) -> Self {
        let mut builder = QueryBuilder::new("UPDATE ");
        builder.push(table.name()).push(" SET ");
        Self {
            table,
            builder,
            stage: Stage::Set,
            sets: 0,
            filters: 0,
            error: None,
        }
    }

    fn fail(&mut self, e: LedgerError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    fn accept(&mut self, column: &str, stage: Stage) -> bool {
        if self.error.is_some() {
            return false;
        }
        if let Err(e) = self.table.check(column) {
            self.fail(e);
            return false;
        }
        if stage == Stage::Set && self.stage == Stage::Where {
            self.fail(LedgerError::InvalidInput(format!("SET {} after WHERE", column)));
            return false;
        }
        true
    }

    fn push_filter_prefix(&mut self) {
        if self.stage == Stage::Set {
            self.builder.push(" WHERE ");
            self.stage = Stage::Where;
        } else {
            self.builder.push(" AND ");
        }
        self.filters += 1;
    }

    /// `column = value`
    pub fn set<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'args + Encode<'args, Postgres> + Type<Postgres> + Send,
    {
        if self.accept(column, Stage::Set) {
            if self.sets > 0 {
                self.builder.push(", ");
            }
            self.builder.push(column).push(" = ").push_bind(value);
            self.sets += 1;
        }
        self
    }

    /// `column = column + value`
    pub fn increment<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'args + Encode<'args, Postgres> + Type<Postgres> + Send,
    {
        if self.accept(column, Stage::Set) {
            if self.sets > 0 {
                self.builder.push(", ");
            }
            self.builder
                .push(column)
                .push(" = ")
                .push(column)
                .push(" + ")
                .push_bind(value);
            self.sets += 1;
        }
        self
    }

    /// `WHERE column = value`
    pub fn filter_eq<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'args + Encode<'args, Postgres> + Type<Postgres> + Send,
    {
        if self.accept(column, Stage::Where) {
            self.push_filter_prefix();
            self.builder.push(column).push(" = ").push_bind(value);
        }
        self
    }

    /// `WHERE column <= value`
    pub fn filter_lte<T>(mut self, column: &'static str, value: T) -> Self
    where
        T: 'args + Encode<'args, Postgres> + Type<Postgres> + Send,
    {
        if self.accept(column, Stage::Where) {
            self.push_filter_prefix();
            self.builder.push(column).push(" <= ").push_bind(value);
        }
        self
    }

    /// `WHERE column IS NULL`
    pub fn filter_null(mut self, column: &'static str) -> Self {
        if self.accept(column, Stage::Where) {
            self.push_filter_prefix();
            self.builder.push(column).push(" IS NULL");
        }
        self
    }

    /// Finished builder; refuses empty SET lists and unfiltered updates
    pub fn build(self) -> LedgerResult<QueryBuilder<'args, Postgres>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.sets == 0 {
            return Err(LedgerError::InvalidInput(format!(
                "update of {} without SET",
                self.table.name()
            )));
        }
        if self.filters == 0 {
            return Err(LedgerError::InvalidInput(format!(
                "update of {} without WHERE",
                self.table.name()
            )));
        }
        Ok(self.builder)
    }

    /// Execute on a connection (usually an open transaction), returning rows affected
    pub async fn execute(self, conn: &mut PgConnection) -> LedgerResult<u64> {
        let mut builder = self.build()?;
        let result = builder.build().execute(conn).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_builds_parameterized_update() {
        let builder = UpdateBuilder::new(Table::Packages)
            .set("status", "EXPIRED")
            .set("is_expired", true)
            .filter_eq("id", Uuid::new_v4())
            .filter_eq("is_expired", false)
            .build()
            .unwrap();
        assert_eq!(
            builder.sql(),
            "UPDATE packages SET status = $1, is_expired = $2 WHERE id = $3 AND is_expired = $4"
        );
    }

    #[test]
    fn test_increment_and_null_filter() {
        let builder = UpdateBuilder::new(Table::Packages)
            .increment("roi_paid_count", 1i32)
            .filter_eq("id", Uuid::new_v4())
            .filter_null("last_roi_date")
            .build()
            .unwrap();
        assert_eq!(
            builder.sql(),
            "UPDATE packages SET roi_paid_count = roi_paid_count + $1 WHERE id = $2 AND last_roi_date IS NULL"
        );
    }

    #[test]
    fn test_rejects_unknown_column() {
        let err = UpdateBuilder::new(Table::Transactions)
            .set("amount", 10i64)
            .filter_eq("id", Uuid::new_v4())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_unfiltered_update() {
        let result = UpdateBuilder::new(Table::PaymentRequests)
            .set("status", "EXPIRED")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_set_after_where() {
        let result = UpdateBuilder::new(Table::Earnings)
            .filter_eq("id", Uuid::new_v4())
            .set("status", "PAID")
            .build();
        assert!(result.is_err());
    }
}
