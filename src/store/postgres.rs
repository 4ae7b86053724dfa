//! PostgreSQL store backend - the source of truth in production.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::models::{
    AccountProjection, DeliveryState, DeliveryStatus, EventKind, LedgerEvent, PoolPoint,
    ReconCounts, ReconResult, ReconStatus, SettlementFilter,
};
use super::SettlementStore;
use crate::error::{AppError, AppResult};

pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn amount_to_db(amount: u64) -> AppResult<i64> {
    i64::try_from(amount)
        .map_err(|_| AppError::InvalidInput(format!("amount {} exceeds storable range", amount)))
}

fn amount_from_db(amount: i64) -> AppResult<u64> {
    u64::try_from(amount)
        .map_err(|_| AppError::Internal(format!("negative amount {} in storage", amount)))
}

fn row_to_delivery(row: &PgRow) -> AppResult<DeliveryState> {
    let status_str: String = row.try_get("status")?;
    let status = DeliveryStatus::parse(&status_str)
        .ok_or_else(|| AppError::Internal(format!("unknown delivery status '{}'", status_str)))?;

    Ok(DeliveryState {
        ref_id: row.try_get("ref_id")?,
        broker_id: row.try_get("broker_id")?,
        account: row.try_get("account")?,
        amount: row.try_get::<Decimal, _>("amount")?,
        status,
        attempts: row.try_get("attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        tx_ref: row.try_get("tx_ref")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_event(row: &PgRow) -> AppResult<LedgerEvent> {
    let kind_str: String = row.try_get("kind")?;
    let kind = EventKind::parse(&kind_str)
        .ok_or_else(|| AppError::Internal(format!("unknown event kind '{}'", kind_str)))?;

    Ok(LedgerEvent {
        tx_hash: row.try_get("tx_hash")?,
        log_index: row.try_get("log_index")?,
        block_number: row.try_get("block_number")?,
        kind,
        account: row.try_get("account")?,
        amount: amount_from_db(row.try_get("amount")?)?,
        ref_id: row.try_get("ref_id")?,
        timestamp: row.try_get("event_at")?,
    })
}

fn row_to_recon(row: &PgRow) -> AppResult<ReconResult> {
    let status_str: String = row.try_get("status")?;
    let status = ReconStatus::parse(&status_str)
        .ok_or_else(|| AppError::Internal(format!("unknown recon status '{}'", status_str)))?;

    let chain_kind = match row.try_get::<Option<String>, _>("chain_kind")? {
        Some(k) => Some(
            EventKind::parse(&k)
                .ok_or_else(|| AppError::Internal(format!("unknown event kind '{}'", k)))?,
        ),
        None => None,
    };
    let chain_amount = match row.try_get::<Option<i64>, _>("chain_amount")? {
        Some(a) => Some(amount_from_db(a)?),
        None => None,
    };

    Ok(ReconResult {
        ref_id: row.try_get("ref_id")?,
        status,
        broker_timestamp: row.try_get("broker_timestamp")?,
        chain_timestamp: row.try_get("chain_timestamp")?,
        chain_amount,
        chain_kind,
        checked_at: row.try_get("checked_at")?,
    })
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn upsert_delivery(&self, state: &DeliveryState) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_states
                (ref_id, broker_id, account, amount, status, attempts,
                 last_attempt_at, tx_ref, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (ref_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_attempt_at = EXCLUDED.last_attempt_at,
                tx_ref = EXCLUDED.tx_ref,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(&state.ref_id)
        .bind(&state.broker_id)
        .bind(&state.account)
        .bind(state.amount)
        .bind(state.status.as_str())
        .bind(state.attempts)
        .bind(state.last_attempt_at)
        .bind(&state.tx_ref)
        .bind(&state.last_error)
        .bind(state.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_delivery(&self, ref_id: &str) -> AppResult<Option<DeliveryState>> {
        let row = sqlx::query(
            r#"
            SELECT ref_id, broker_id, account, amount, status, attempts,
                   last_attempt_at, tx_ref, last_error, created_at
            FROM delivery_states
            WHERE ref_id = $1
            "#,
        )
        .bind(ref_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_delivery).transpose()
    }

    async fn list_deliveries(&self, filter: &SettlementFilter) -> AppResult<Vec<DeliveryState>> {
        let rows = sqlx::query(
            r#"
            SELECT ref_id, broker_id, account, amount, status, attempts,
                   last_attempt_at, tx_ref, last_error, created_at
            FROM delivery_states
            WHERE ($1::TEXT IS NULL OR account = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(&filter.account)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.limit.max(0))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_delivery).collect()
    }

    async fn all_deliveries(&self) -> AppResult<Vec<DeliveryState>> {
        let rows = sqlx::query(
            r#"
            SELECT ref_id, broker_id, account, amount, status, attempts,
                   last_attempt_at, tx_ref, last_error, created_at
            FROM delivery_states
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_delivery).collect()
    }

    async fn insert_event(&self, event: &LedgerEvent) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_events
                (tx_hash, log_index, block_number, kind, account, amount, ref_id, event_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(&event.tx_hash)
        .bind(event.log_index)
        .bind(event.block_number)
        .bind(event.kind.as_str())
        .bind(&event.account)
        .bind(amount_to_db(event.amount)?)
        .bind(&event.ref_id)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn events_for_account(&self, account: &str) -> AppResult<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, log_index, block_number, kind, account, amount, ref_id, event_at
            FROM ledger_events
            WHERE account = $1
            ORDER BY block_number, log_index
            "#,
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn all_events(&self) -> AppResult<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, log_index, block_number, kind, account, amount, ref_id, event_at
            FROM ledger_events
            ORDER BY block_number, log_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn events_with_ref(&self) -> AppResult<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_hash, log_index, block_number, kind, account, amount, ref_id, event_at
            FROM ledger_events
            WHERE ref_id IS NOT NULL
            ORDER BY block_number, log_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn upsert_projection(&self, projection: &AccountProjection) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO account_projections (account, collateral, pnl, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account) DO UPDATE SET
                collateral = EXCLUDED.collateral,
                pnl = EXCLUDED.pnl,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&projection.account)
        .bind(amount_to_db(projection.collateral)?)
        .bind(amount_to_db(projection.pnl)?)
        .bind(projection.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_projection(&self, account: &str) -> AppResult<Option<AccountProjection>> {
        let row = sqlx::query(
            r#"
            SELECT account, collateral, pnl, updated_at
            FROM account_projections
            WHERE account = $1
            "#,
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(AccountProjection {
                account: row.try_get("account")?,
                collateral: amount_from_db(row.try_get("collateral")?)?,
                pnl: amount_from_db(row.try_get("pnl")?)?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_pool_point(&self, point: &PoolPoint) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pool_history (block_number, balance, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (block_number) DO UPDATE SET
                balance = EXCLUDED.balance,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(point.block_number)
        .bind(amount_to_db(point.balance)?)
        .bind(point.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_pool_point(&self) -> AppResult<Option<PoolPoint>> {
        let row = sqlx::query(
            r#"
            SELECT block_number, balance, updated_at
            FROM pool_history
            ORDER BY block_number DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(PoolPoint {
                block_number: row.try_get("block_number")?,
                balance: amount_from_db(row.try_get("balance")?)?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn pool_history(&self, limit: i64) -> AppResult<Vec<PoolPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT block_number, balance, updated_at
            FROM pool_history
            ORDER BY block_number DESC
            LIMIT $1
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PoolPoint {
                    block_number: row.try_get("block_number")?,
                    balance: amount_from_db(row.try_get("balance")?)?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn upsert_recon(&self, result: &ReconResult) -> AppResult<()> {
        let chain_amount = result.chain_amount.map(amount_to_db).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO recon_results
                (ref_id, status, broker_timestamp, chain_timestamp,
                 chain_amount, chain_kind, checked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (ref_id) DO UPDATE SET
                status = EXCLUDED.status,
                broker_timestamp = EXCLUDED.broker_timestamp,
                chain_timestamp = EXCLUDED.chain_timestamp,
                chain_amount = EXCLUDED.chain_amount,
                chain_kind = EXCLUDED.chain_kind,
                checked_at = EXCLUDED.checked_at
            "#,
        )
        .bind(&result.ref_id)
        .bind(result.status.as_str())
        .bind(result.broker_timestamp)
        .bind(result.chain_timestamp)
        .bind(chain_amount)
        .bind(result.chain_kind.map(|k| k.as_str()))
        .bind(result.checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_recon(&self, ref_id: &str) -> AppResult<Option<ReconResult>> {
        let row = sqlx::query(
            r#"
            SELECT ref_id, status, broker_timestamp, chain_timestamp,
                   chain_amount, chain_kind, checked_at
            FROM recon_results
            WHERE ref_id = $1
            "#,
        )
        .bind(ref_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_recon).transpose()
    }

    async fn recon_counts(&self) -> AppResult<ReconCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM recon_results
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ReconCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match ReconStatus::parse(&status) {
                Some(ReconStatus::Ok) => counts.ok = n,
                Some(ReconStatus::Pending) => counts.pending = n,
                Some(ReconStatus::Failed) => counts.failed = n,
                Some(ReconStatus::Break) => counts.breaks = n,
                None => {
                    return Err(AppError::Internal(format!(
                        "unknown recon status '{}' in storage",
                        status
                    )))
                }
            }
        }
        Ok(counts)
    }

    async fn list_breaks(&self) -> AppResult<Vec<ReconResult>> {
        let rows = sqlx::query(
            r#"
            SELECT ref_id, status, broker_timestamp, chain_timestamp,
                   chain_amount, chain_kind, checked_at
            FROM recon_results
            WHERE status = 'break'
            ORDER BY broker_timestamp NULLS LAST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_recon).collect()
    }

    async fn get_cursor(&self, name: &str) -> AppResult<Option<i64>> {
        let row = sqlx::query("SELECT position FROM cursors WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get::<i64, _>("position")?),
            None => None,
        })
    }

    async fn set_cursor(&self, name: &str, position: i64) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (name, position)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET position = EXCLUDED.position
            "#,
        )
        .bind(name)
        .bind(position)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
