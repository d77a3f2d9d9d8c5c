// 充值数据访问 Repository
//
// 所有状态更新都以期望的源状态为条件（`WHERE status = ...`），
// 返回 false 表示记录已被其他执行者推进，调用方应放弃本次操作。

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::deposit::{Asset, Deposit, DepositStatus, NewDeposit, SweepResolution};

// ============ Repository Trait ============

#[async_trait]
pub trait DepositRepository: Send + Sync {
    /// 批量写入（单事务）；`(network, source_tx_hash, asset)` 已存在的记录静默跳过
    ///
    /// 返回实际新增条数。
    async fn insert_many(&self, deposits: &[NewDeposit]) -> Result<u64>;

    /// 某网络已持久化充值的最大区块号（扫描检查点来源）
    async fn max_block_number(&self, network: &str) -> Result<Option<u64>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deposit>>;

    /// 按检测顺序（最早优先）列出某状态的充值
    async fn list_by_status(
        &self,
        network: &str,
        status: DepositStatus,
        limit: u32,
    ) -> Result<Vec<Deposit>>;

    /// 同一地址同一资产在 `since` 之后完成的最近一次归集
    ///
    /// 归集转出的是地址全部余额，之后的兄弟记录可能已被顺带归集。
    async fn find_completed_sweep_since(
        &self,
        network: &str,
        child_address: &str,
        asset: &Asset,
        since: DateTime<Utc>,
    ) -> Result<Option<Deposit>>;

    /// 原子认领：pending → in_progress，attempts + 1
    async fn claim(&self, id: Uuid) -> Result<bool>;

    /// 广播后立即记录归集交易哈希与金额（仅 in_progress）
    async fn record_sweep_tx(&self, id: Uuid, sweep_tx_hash: &str, amount: u128) -> Result<bool>;

    /// in_progress → completed | failed | uneconomical
    async fn resolve(&self, id: Uuid, resolution: &SweepResolution) -> Result<bool>;

    /// 认领时间早于 `claimed_before` 的 in_progress 记录
    async fn list_stale_claims(
        &self,
        network: &str,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Deposit>>;

    /// in_progress → pending（对账回收），附带原因
    async fn release_claim(&self, id: Uuid, reason: &str) -> Result<bool>;

    /// failed → pending：`attempts <= max_retries` 且退避时间已过
    ///
    /// 退避 = `backoff_secs * 2^(attempts-1)`，从最近一次失败（updated_at）起算。
    async fn requeue_failed(
        &self,
        network: &str,
        max_retries: u32,
        backoff_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

// ============ PostgreSQL 实现 ============

#[derive(sqlx::FromRow)]
struct DepositRow {
    id: Uuid,
    user_id: String,
    child_address: String,
    network: String,
    asset: String,
    amount: String, // u128 as TEXT
    source_tx_hash: String,
    block_number: i64,
    status: String,
    sweep_tx_hash: Option<String>,
    sweep_amount: Option<String>,
    error: Option<String>,
    attempts: i32,
    detected_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    swept_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DepositRow> for Deposit {
    type Error = anyhow::Error;

    fn try_from(row: DepositRow) -> Result<Self> {
        let status = DepositStatus::from_db_str(&row.status)
            .with_context(|| format!("Unknown deposit status '{}' on {}", row.status, row.id))?;
        let amount = row
            .amount
            .parse::<u128>()
            .with_context(|| format!("Corrupt amount '{}' on deposit {}", row.amount, row.id))?;
        let sweep_amount = row
            .sweep_amount
            .as_deref()
            .map(str::parse::<u128>)
            .transpose()
            .with_context(|| format!("Corrupt sweep_amount on deposit {}", row.id))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            child_address: row.child_address,
            network: row.network,
            asset: Asset::from_db_str(&row.asset),
            amount,
            source_tx_hash: row.source_tx_hash,
            block_number: u64::try_from(row.block_number).unwrap_or_default(),
            status,
            sweep_tx_hash: row.sweep_tx_hash,
            sweep_amount,
            error: row.error,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            detected_at: row.detected_at,
            claimed_at: row.claimed_at,
            swept_at: row.swept_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, user_id, child_address, network, asset, amount, \
     source_tx_hash, block_number, status, sweep_tx_hash, sweep_amount, error, attempts, \
     detected_at, claimed_at, swept_at, updated_at";

pub struct PgDepositRepository {
    pool: PgPool,
}

impl PgDepositRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DepositRepository for PgDepositRepository {
    async fn insert_many(&self, deposits: &[NewDeposit]) -> Result<u64> {
        if deposits.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin deposit batch")?;
        let mut inserted = 0u64;

        for deposit in deposits {
            let (network, tx_hash, asset) = deposit.dedup_key();
            let result = sqlx::query(
                "INSERT INTO custody_deposits \
                     (id, user_id, child_address, network, asset, amount, \
                      source_tx_hash, block_number, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending') \
                 ON CONFLICT (network, source_tx_hash, asset) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(&deposit.user_id)
            .bind(&deposit.child_address)
            .bind(&network)
            .bind(&asset)
            .bind(deposit.amount.to_string())
            .bind(&tx_hash)
            .bind(i64::try_from(deposit.block_number).context("block number overflow")?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert deposit {}/{}", network, tx_hash))?;

            if result.rows_affected() == 0 {
                tracing::debug!(
                    network = %network,
                    tx_hash = %tx_hash,
                    asset = %asset,
                    "Duplicate deposit skipped"
                );
            }
            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit deposit batch")?;
        Ok(inserted)
    }

    async fn max_block_number(&self, network: &str) -> Result<Option<u64>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_number) FROM custody_deposits WHERE network = $1")
                .bind(network)
                .fetch_one(&self.pool)
                .await
                .context("Failed to query max deposit block")?;

        Ok(max.and_then(|n| u64::try_from(n).ok()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deposit>> {
        let sql = format!("SELECT {} FROM custody_deposits WHERE id = $1", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, DepositRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query deposit")?;

        row.map(Deposit::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        network: &str,
        status: DepositStatus,
        limit: u32,
    ) -> Result<Vec<Deposit>> {
        let sql = format!(
            "SELECT {} FROM custody_deposits \
             WHERE network = $1 AND status = $2 \
             ORDER BY detected_at ASC, block_number ASC \
             LIMIT $3",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DepositRow>(&sql)
            .bind(network)
            .bind(status.to_db_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list deposits")?;

        rows.into_iter().map(Deposit::try_from).collect()
    }

    async fn find_completed_sweep_since(
        &self,
        network: &str,
        child_address: &str,
        asset: &Asset,
        since: DateTime<Utc>,
    ) -> Result<Option<Deposit>> {
        let sql = format!(
            "SELECT {} FROM custody_deposits \
             WHERE network = $1 AND child_address = $2 AND asset = $3 \
               AND status = 'completed' AND swept_at >= $4 \
             ORDER BY swept_at DESC \
             LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, DepositRow>(&sql)
            .bind(network)
            .bind(child_address)
            .bind(asset.to_db_string())
            .bind(since)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query sibling sweep")?;

        row.map(Deposit::try_from).transpose()
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE custody_deposits \
             SET status = 'in_progress', attempts = attempts + 1, \
                 claimed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP, \
                 sweep_tx_hash = NULL, sweep_amount = NULL \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to claim deposit")?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_sweep_tx(&self, id: Uuid, sweep_tx_hash: &str, amount: u128) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE custody_deposits \
             SET sweep_tx_hash = $2, sweep_amount = $3, updated_at = CURRENT_TIMESTAMP \
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(id)
        .bind(sweep_tx_hash)
        .bind(amount.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to record sweep tx")?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve(&self, id: Uuid, resolution: &SweepResolution) -> Result<bool> {
        let query = match resolution {
            SweepResolution::Completed { sweep_tx_hash } => sqlx::query(
                "UPDATE custody_deposits \
                 SET status = 'completed', sweep_tx_hash = $2, error = NULL, \
                     swept_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP \
                 WHERE id = $1 AND status = 'in_progress'",
            )
            .bind(id)
            .bind(sweep_tx_hash),
            SweepResolution::Failed { error } => sqlx::query(
                "UPDATE custody_deposits \
                 SET status = 'failed', error = $2, updated_at = CURRENT_TIMESTAMP \
                 WHERE id = $1 AND status = 'in_progress'",
            )
            .bind(id)
            .bind(error),
            SweepResolution::Uneconomical { reason } => sqlx::query(
                "UPDATE custody_deposits \
                 SET status = 'uneconomical', error = $2, updated_at = CURRENT_TIMESTAMP \
                 WHERE id = $1 AND status = 'in_progress'",
            )
            .bind(id)
            .bind(reason),
        };

        let result = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to resolve deposit {} as {}", id, resolution.status()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_stale_claims(
        &self,
        network: &str,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Deposit>> {
        let sql = format!(
            "SELECT {} FROM custody_deposits \
             WHERE network = $1 AND status = 'in_progress' AND claimed_at < $2 \
             ORDER BY claimed_at ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DepositRow>(&sql)
            .bind(network)
            .bind(claimed_before)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list stale claims")?;

        rows.into_iter().map(Deposit::try_from).collect()
    }

    async fn release_claim(&self, id: Uuid, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE custody_deposits \
             SET status = 'pending', error = $2, claimed_at = NULL, \
                 updated_at = CURRENT_TIMESTAMP \
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to release deposit claim")?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue_failed(
        &self,
        network: &str,
        max_retries: u32,
        backoff_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE custody_deposits \
             SET status = 'pending', claimed_at = NULL, updated_at = $4 \
             WHERE network = $1 AND status = 'failed' \
               AND attempts <= $2 \
               AND updated_at + make_interval(secs => $3 * power(2, GREATEST(attempts - 1, 0))) <= $4",
        )
        .bind(network)
        .bind(i32::try_from(max_retries).unwrap_or(i32::MAX))
        .bind(backoff_secs as f64)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to requeue failed deposits")?;

        Ok(result.rows_affected())
    }
}

/// 重试判定（与 `requeue_failed` 的 SQL 条件一致，内存实现与测试共用）
pub fn is_due_for_retry(
    deposit: &Deposit,
    max_retries: u32,
    backoff_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    if deposit.status != DepositStatus::Failed || deposit.attempts > max_retries {
        return false;
    }
    let exponent = deposit.attempts.saturating_sub(1).min(20);
    let wait = backoff_secs.saturating_mul(1u64 << exponent);
    let wait = chrono::Duration::seconds(i64::try_from(wait).unwrap_or(i64::MAX / 1000));
    deposit.updated_at + wait <= now
}
