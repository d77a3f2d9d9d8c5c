// 资金流水 Repository（只追加，不提供更新/删除）

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::deposit::Asset;
use crate::domain::ledger::{LedgerEntry, LedgerKind};

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// 某笔充值关联的全部流水（按时间顺序）
    async fn list_by_deposit(&self, deposit_id: Uuid) -> Result<Vec<LedgerEntry>>;
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    network: String,
    user_id: String,
    address: String,
    deposit_id: Option<Uuid>,
    asset: String,
    amount: String,
    tx_hash: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = anyhow::Error;

    fn try_from(row: LedgerRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            network: row.network,
            user_id: row.user_id,
            address: row.address,
            deposit_id: row.deposit_id,
            asset: Asset::from_db_str(&row.asset),
            amount: row
                .amount
                .parse()
                .with_context(|| format!("Corrupt ledger amount '{}'", row.amount))?,
            tx_hash: row.tx_hash,
            kind: LedgerKind::from_db_str(&row.kind)
                .with_context(|| format!("Unknown ledger kind '{}'", row.kind))?,
            created_at: row.created_at,
        })
    }
}

pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO custody_ledger \
                 (id, network, user_id, address, deposit_id, asset, amount, tx_hash, kind, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id)
        .bind(&entry.network)
        .bind(&entry.user_id)
        .bind(&entry.address)
        .bind(entry.deposit_id)
        .bind(entry.asset.to_db_string())
        .bind(entry.amount.to_string())
        .bind(&entry.tx_hash)
        .bind(entry.kind.to_db_string())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to append {} ledger entry", entry.kind.to_db_string()))?;

        Ok(())
    }

    async fn list_by_deposit(&self, deposit_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT id, network, user_id, address, deposit_id, asset, amount, tx_hash, kind, created_at \
             FROM custody_ledger WHERE deposit_id = $1 ORDER BY created_at ASC",
        )
        .bind(deposit_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list ledger entries")?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}
