//! Postgres implementation of the storage ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::domain::{
    BusinessRecord, EntryStatus, IdempotencyRecord, LedgerEntry, TraceImbalance, Transfer,
};
use crate::ports::{
    BusinessSettlement, RepositoryError, RepositoryResult, Store, TransferSettlement, UnitOfWork,
};

const ENTRY_COLUMNS: &str = "id, trace_id, account, entry_type, category, subtype, amount, \
     currency, status, related_to, meta, created_at, processed_at";

const TRANSFER_COLUMNS: &str = "id, trace_id, user_id, from_account, to_account, amount, currency, \
     transfer_type, category, subtype, status, reference, provider_ref, narration, failure_reason, \
     meta, created_at, updated_at, completed_at";

const BUSINESS_COLUMNS: &str = "id, kind, subtype, user_id, trace_id, amount, currency, status, \
     reference, idempotency_key, request_hash, needs_review, failure_reason, details, created_at, \
     updated_at";

const IDEMPOTENCY_COLUMNS: &str = "key, user_id, request_hash, response, created_at, expires_at";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    async fn entries_by_trace(&self, trace_id: &str) -> RepositoryResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE trace_id = $1 ORDER BY seq ASC",
            ENTRY_COLUMNS
        ))
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EntryRow::into_domain).collect()
    }

    async fn completed_balance(&self, account: &str) -> RepositoryResult<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(CASE WHEN entry_type = 'CREDIT' THEN amount ELSE -amount END), 0)::BIGINT
            FROM ledger_entries
            WHERE account = $1 AND status = 'COMPLETED'
            "#,
        )
        .bind(account)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }

    async fn unbalanced_traces(&self) -> RepositoryResult<Vec<TraceImbalance>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT trace_id, total_debits, total_credits FROM (
                SELECT trace_id,
                       COALESCE(SUM(amount) FILTER (WHERE entry_type = 'DEBIT'), 0)::BIGINT AS total_debits,
                       COALESCE(SUM(amount) FILTER (WHERE entry_type = 'CREDIT'), 0)::BIGINT AS total_credits
                FROM ledger_entries
                WHERE status = 'COMPLETED'
                GROUP BY trace_id
            ) totals
            WHERE total_debits <> total_credits
            ORDER BY trace_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(trace_id, total_debits, total_credits)| TraceImbalance {
                trace_id,
                total_debits,
                total_credits,
            })
            .collect())
    }

    async fn transfer_by_reference(&self, reference: &str) -> RepositoryResult<Option<Transfer>> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE reference = $1",
            TRANSFER_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransferRow::into_domain).transpose()
    }

    async fn transfers_by_trace(&self, trace_id: &str) -> RepositoryResult<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE trace_id = $1 ORDER BY created_at ASC",
            TRANSFER_COLUMNS
        ))
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransferRow::into_domain).collect()
    }

    async fn stale_transfers(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE status = 'PENDING' AND created_at <= $1 \
             ORDER BY created_at ASC LIMIT $2",
            TRANSFER_COLUMNS
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransferRow::into_domain).collect()
    }

    async fn business_record(&self, id: Uuid) -> RepositoryResult<Option<BusinessRecord>> {
        let row = sqlx::query_as::<_, BusinessRow>(&format!(
            "SELECT {} FROM business_records WHERE id = $1",
            BUSINESS_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BusinessRow::into_domain).transpose()
    }

    async fn stale_business_records(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<BusinessRecord>> {
        let rows = sqlx::query_as::<_, BusinessRow>(&format!(
            "SELECT {} FROM business_records WHERE status = 'PENDING' AND created_at <= $1 \
             ORDER BY created_at ASC LIMIT $2",
            BUSINESS_COLUMNS
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BusinessRow::into_domain).collect()
    }

    async fn business_records_needing_review(&self) -> RepositoryResult<Vec<BusinessRecord>> {
        let rows = sqlx::query_as::<_, BusinessRow>(&format!(
            "SELECT {} FROM business_records WHERE needs_review ORDER BY created_at ASC",
            BUSINESS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BusinessRow::into_domain).collect()
    }

    async fn find_idempotency(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
            "SELECT {} FROM idempotency_records WHERE key = $1 AND expires_at > $2",
            IDEMPOTENCY_COLUMNS
        ))
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(IdempotencyRow::into_domain))
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn cached_balance(&self, user_id: &str) -> RepositoryResult<Option<i64>> {
        let balance =
            sqlx::query_scalar::<_, i64>("SELECT balance FROM wallet_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(balance)
    }

    async fn cached_balances(&self) -> RepositoryResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT user_id, balance FROM wallet_balances ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// One database transaction. Dropped without commit, sqlx rolls it back.
pub struct PostgresUnitOfWork {
    tx: SqlxTransaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, trace_id, account, entry_type, category, subtype, amount,
                currency, status, related_to, meta, created_at, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.trace_id)
        .bind(&entry.account)
        .bind(entry.entry_type.as_str())
        .bind(entry.category.as_str())
        .bind(&entry.subtype)
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(entry.status.as_str())
        .bind(&entry.related_to)
        .bind(&entry.meta)
        .bind(entry.created_at)
        .bind(entry.processed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn entry(&mut self, id: Uuid) -> RepositoryResult<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE id = $1",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(EntryRow::into_domain).transpose()
    }

    async fn entries_by_trace(&mut self, trace_id: &str) -> RepositoryResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM ledger_entries WHERE trace_id = $1 ORDER BY seq ASC FOR UPDATE",
            ENTRY_COLUMNS
        ))
        .bind(trace_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(EntryRow::into_domain).collect()
    }

    async fn settle_entry(
        &mut self,
        id: Uuid,
        status: EntryStatus,
        processed_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "UPDATE ledger_entries SET status = $2, processed_at = $3 \
             WHERE id = $1 AND status = 'PENDING' RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(processed_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(EntryRow::into_domain).transpose()
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, trace_id, user_id, from_account, to_account, amount, currency,
                transfer_type, category, subtype, status, reference, provider_ref, narration,
                failure_reason, meta, created_at, updated_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(transfer.id)
        .bind(&transfer.trace_id)
        .bind(&transfer.user_id)
        .bind(&transfer.from_account)
        .bind(&transfer.to_account)
        .bind(transfer.amount)
        .bind(&transfer.currency)
        .bind(transfer.transfer_type.as_str())
        .bind(transfer.category.as_str())
        .bind(&transfer.subtype)
        .bind(transfer.status.as_str())
        .bind(&transfer.reference)
        .bind(&transfer.provider_ref)
        .bind(&transfer.narration)
        .bind(&transfer.failure_reason)
        .bind(&transfer.meta)
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .bind(transfer.completed_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn transfer_by_reference(
        &mut self,
        reference: &str,
    ) -> RepositoryResult<Option<Transfer>> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE reference = $1 FOR UPDATE",
            TRANSFER_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TransferRow::into_domain).transpose()
    }

    async fn settle_transfer(
        &mut self,
        reference: &str,
        settlement: &TransferSettlement,
    ) -> RepositoryResult<Option<Transfer>> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            r#"
            UPDATE transfers
            SET status = $2,
                provider_ref = COALESCE($3, provider_ref),
                failure_reason = COALESCE($4, failure_reason),
                updated_at = $5,
                completed_at = CASE WHEN $2 = 'COMPLETED' THEN $5 ELSE completed_at END
            WHERE reference = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(reference)
        .bind(settlement.status.as_str())
        .bind(&settlement.provider_ref)
        .bind(&settlement.failure_reason)
        .bind(settlement.at)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TransferRow::into_domain).transpose()
    }

    async fn insert_business_record(&mut self, record: &BusinessRecord) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO business_records (
                id, kind, subtype, user_id, trace_id, amount, currency, status, reference,
                idempotency_key, request_hash, needs_review, failure_reason, details,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(record.id)
        .bind(record.kind.as_str())
        .bind(&record.subtype)
        .bind(&record.user_id)
        .bind(&record.trace_id)
        .bind(record.amount)
        .bind(&record.currency)
        .bind(record.status.as_str())
        .bind(&record.reference)
        .bind(&record.idempotency_key)
        .bind(&record.request_hash)
        .bind(record.needs_review)
        .bind(&record.failure_reason)
        .bind(&record.details)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn settle_business_record(
        &mut self,
        id: Uuid,
        settlement: &BusinessSettlement,
    ) -> RepositoryResult<Option<BusinessRecord>> {
        let row = sqlx::query_as::<_, BusinessRow>(&format!(
            r#"
            UPDATE business_records
            SET status = $2,
                reference = COALESCE($3, reference),
                needs_review = $4,
                failure_reason = COALESCE($5, failure_reason),
                details = COALESCE($6, details),
                updated_at = $7
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            BUSINESS_COLUMNS
        ))
        .bind(id)
        .bind(settlement.status.as_str())
        .bind(&settlement.reference)
        .bind(settlement.needs_review)
        .bind(&settlement.failure_reason)
        .bind(&settlement.details)
        .bind(settlement.at)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(BusinessRow::into_domain).transpose()
    }

    async fn adjust_cached_balance(&mut self, user_id: &str, delta: i64) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_balances (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET balance = wallet_balances.balance + EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn set_cached_balance(&mut self, user_id: &str, balance: i64) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_balances (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET balance = EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(balance)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn find_idempotency(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<IdempotencyRecord>> {
        let row = sqlx::query_as::<_, IdempotencyRow>(&format!(
            "SELECT {} FROM idempotency_records WHERE key = $1 AND expires_at > $2",
            IDEMPOTENCY_COLUMNS
        ))
        .bind(key)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(IdempotencyRow::into_domain))
    }

    async fn save_idempotency(&mut self, record: &IdempotencyRecord) -> RepositoryResult<()> {
        // An expired row that the sweep has not reached yet may be replaced.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, user_id, request_hash, response, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                request_hash = EXCLUDED.request_hash,
                response = EXCLUDED.response,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_records.expires_at <= EXCLUDED.created_at
            "#,
        )
        .bind(&record.key)
        .bind(&record.user_id)
        .bind(&record.request_hash)
        .bind(&record.response)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "idempotency key {}",
                record.key
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepositoryResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepositoryResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Internal row types for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    trace_id: String,
    account: String,
    entry_type: String,
    category: String,
    subtype: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    related_to: Option<String>,
    meta: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl EntryRow {
    fn into_domain(self) -> RepositoryResult<LedgerEntry> {
        Ok(LedgerEntry {
            id: self.id,
            trace_id: self.trace_id,
            account: self.account,
            entry_type: self.entry_type.parse()?,
            category: self.category.parse()?,
            subtype: self.subtype,
            amount: self.amount,
            currency: self.currency,
            status: self.status.parse()?,
            related_to: self.related_to,
            meta: self.meta,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransferRow {
    id: Uuid,
    trace_id: String,
    user_id: String,
    from_account: String,
    to_account: String,
    amount: i64,
    currency: String,
    transfer_type: String,
    category: String,
    subtype: Option<String>,
    status: String,
    reference: String,
    provider_ref: Option<String>,
    narration: Option<String>,
    failure_reason: Option<String>,
    meta: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TransferRow {
    fn into_domain(self) -> RepositoryResult<Transfer> {
        Ok(Transfer {
            id: self.id,
            trace_id: self.trace_id,
            user_id: self.user_id,
            from_account: self.from_account,
            to_account: self.to_account,
            amount: self.amount,
            currency: self.currency,
            transfer_type: self.transfer_type.parse()?,
            category: self.category.parse()?,
            subtype: self.subtype,
            status: self.status.parse()?,
            reference: self.reference,
            provider_ref: self.provider_ref,
            narration: self.narration,
            failure_reason: self.failure_reason,
            meta: self.meta,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BusinessRow {
    id: Uuid,
    kind: String,
    subtype: String,
    user_id: String,
    trace_id: String,
    amount: i64,
    currency: String,
    status: String,
    reference: Option<String>,
    idempotency_key: String,
    request_hash: String,
    needs_review: bool,
    failure_reason: Option<String>,
    details: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BusinessRow {
    fn into_domain(self) -> RepositoryResult<BusinessRecord> {
        Ok(BusinessRecord {
            id: self.id,
            kind: self.kind.parse()?,
            subtype: self.subtype,
            user_id: self.user_id,
            trace_id: self.trace_id,
            amount: self.amount,
            currency: self.currency,
            status: self.status.parse()?,
            reference: self.reference,
            idempotency_key: self.idempotency_key,
            request_hash: self.request_hash,
            needs_review: self.needs_review,
            failure_reason: self.failure_reason,
            details: self.details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    user_id: String,
    request_hash: String,
    response: serde_json::Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl IdempotencyRow {
    fn into_domain(self) -> IdempotencyRecord {
        IdempotencyRecord {
            key: self.key,
            user_id: self.user_id,
            request_hash: self.request_hash,
            response: self.response,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}
