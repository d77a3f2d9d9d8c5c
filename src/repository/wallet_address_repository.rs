// 托管地址数据访问 Repository
//
// 这张表是缓存 + 扫描反查索引，不是地址归属的来源：
// 丢失后可以用主种子按 derive_index(user_id) 重建。

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

// ============ 领域模型 ============

#[derive(Clone)]
pub struct UserWalletAddress {
    pub id: Uuid,
    pub user_id: String,
    pub network: String,
    pub derivation_index: u32,
    pub derivation_path: String,
    /// 网络格式地址（EVM 为 EIP-55 校验和形式）
    pub address: String,
    /// 规范化地址，唯一索引与反查使用
    pub address_key: String,
    pub encrypted_private_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for UserWalletAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserWalletAddress")
            .field("user_id", &self.user_id)
            .field("network", &self.network)
            .field("derivation_index", &self.derivation_index)
            .field("address", &self.address)
            .field("encrypted_private_key", &"<redacted>")
            .finish()
    }
}

// ============ Repository Trait ============

#[async_trait]
pub trait WalletAddressRepository: Send + Sync {
    /// 查询用户在某网络上的地址
    async fn find(&self, user_id: &str, network: &str) -> Result<Option<UserWalletAddress>>;

    /// 写入地址；(network, user_id) 已存在时返回已有记录
    ///
    /// 不同用户落到同一地址（索引碰撞）时违反唯一约束，返回错误。
    async fn insert_or_get(&self, record: UserWalletAddress) -> Result<UserWalletAddress>;

    /// 批量反查：规范化地址 → 记录
    async fn find_by_addresses(
        &self,
        network: &str,
        address_keys: &[String],
    ) -> Result<HashMap<String, UserWalletAddress>>;
}

// ============ PostgreSQL 实现 ============

#[derive(sqlx::FromRow)]
struct WalletAddressRow {
    id: Uuid,
    user_id: String,
    network: String,
    derivation_index: i64,
    derivation_path: String,
    address: String,
    address_key: String,
    encrypted_private_key: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl TryFrom<WalletAddressRow> for UserWalletAddress {
    type Error = anyhow::Error;

    fn try_from(row: WalletAddressRow) -> Result<Self> {
        let derivation_index = u32::try_from(row.derivation_index)
            .with_context(|| format!("Corrupt derivation_index {}", row.derivation_index))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            network: row.network,
            derivation_index,
            derivation_path: row.derivation_path,
            address: row.address,
            address_key: row.address_key,
            encrypted_private_key: row.encrypted_private_key,
            created_at: row.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, user_id, network, derivation_index, derivation_path, \
     address, address_key, encrypted_private_key, created_at";

pub struct PgWalletAddressRepository {
    pool: PgPool,
}

impl PgWalletAddressRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WalletAddressRepository for PgWalletAddressRepository {
    async fn find(&self, user_id: &str, network: &str) -> Result<Option<UserWalletAddress>> {
        let sql = format!(
            "SELECT {} FROM custody_wallet_addresses WHERE network = $1 AND user_id = $2",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, WalletAddressRow>(&sql)
            .bind(network)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query custody wallet address")?;

        row.map(UserWalletAddress::try_from).transpose()
    }

    async fn insert_or_get(&self, record: UserWalletAddress) -> Result<UserWalletAddress> {
        let sql = format!(
            "INSERT INTO custody_wallet_addresses \
                 (id, user_id, network, derivation_index, derivation_path, \
                  address, address_key, encrypted_private_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (network, user_id) DO NOTHING \
             RETURNING {}",
            SELECT_COLUMNS
        );
        let inserted = sqlx::query_as::<_, WalletAddressRow>(&sql)
            .bind(record.id)
            .bind(&record.user_id)
            .bind(&record.network)
            .bind(i64::from(record.derivation_index))
            .bind(&record.derivation_path)
            .bind(&record.address)
            .bind(&record.address_key)
            .bind(&record.encrypted_private_key)
            .bind(record.created_at)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| {
                format!(
                    "Failed to insert custody address {} for user {} on {}",
                    record.address, record.user_id, record.network
                )
            })?;

        match inserted {
            Some(row) => UserWalletAddress::try_from(row),
            // 并发写入：另一方已写入，读取已有记录
            None => self
                .find(&record.user_id, &record.network)
                .await?
                .context("Custody address vanished after conflict"),
        }
    }

    async fn find_by_addresses(
        &self,
        network: &str,
        address_keys: &[String],
    ) -> Result<HashMap<String, UserWalletAddress>> {
        if address_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT {} FROM custody_wallet_addresses \
             WHERE network = $1 AND address_key = ANY($2)",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, WalletAddressRow>(&sql)
            .bind(network)
            .bind(address_keys)
            .fetch_all(&self.pool)
            .await
            .context("Failed to look up custody addresses")?;

        rows.into_iter()
            .map(|row| {
                let record = UserWalletAddress::try_from(row)?;
                Ok((record.address_key.clone(), record))
            })
            .collect()
    }
}
