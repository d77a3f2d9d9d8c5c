//! 充值记录与状态机
//!
//! 扫描器只创建 `pending`，之后的状态只由归集器推进：
//!
//! ```text
//! pending ──claim──▶ in_progress ──▶ completed | failed | uneconomical
//!    ▲                    │
//!    └──── reclaim ───────┘        failed ──retry──▶ pending
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 充值资产
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// 原生币 (ETH / BNB / MATIC / TRX)
    Native,
    /// 代币，值为合约地址（规范化后）
    Token(String),
}

impl Asset {
    /// 数据库存储形式：`native` 或合约地址
    pub fn to_db_string(&self) -> String {
        match self {
            Self::Native => "native".to_string(),
            Self::Token(contract) => contract.clone(),
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("native") {
            Self::Native
        } else {
            Self::Token(s.to_string())
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_db_string())
    }
}

/// 充值状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// 已检测，等待归集
    Pending,
    /// 已被某个归集器原子认领
    InProgress,
    /// 归集交易已确认
    Completed,
    /// 本次归集失败（可按重试策略回到 pending）
    Failed,
    /// 余额不足以覆盖手续费，不再单独归集
    Uneconomical,
}

impl DepositStatus {
    /// 最终状态（不可再转换）
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Uneconomical)
    }

    /// 验证状态转换合法性
    pub fn can_transition_to(&self, target: &Self) -> bool {
        use DepositStatus::*;

        match (self, target) {
            (Pending, InProgress) => true,

            (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Uneconomical)
            | (InProgress, Pending) => true,

            // 有界重试
            (Failed, Pending) => true,

            _ => false,
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Uneconomical => "uneconomical",
        }
    }

    /// 未知值返回 None，由调用方决定如何处理脏数据
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "uneconomical" => Some(Self::Uneconomical),
            _ => None,
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// 扫描器产出的新充值（尚未持久化）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeposit {
    pub user_id: String,
    pub child_address: String,
    pub network: String,
    pub asset: Asset,
    /// 最小单位
    pub amount: u128,
    pub source_tx_hash: String,
    pub block_number: u64,
}

impl NewDeposit {
    /// 唯一键 (network, source_tx_hash, asset)
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.network.clone(),
            self.source_tx_hash.to_lowercase(),
            self.asset.to_db_string(),
        )
    }
}

/// 已持久化的充值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub id: Uuid,
    pub user_id: String,
    pub child_address: String,
    pub network: String,
    pub asset: Asset,
    pub amount: u128,
    pub source_tx_hash: String,
    pub block_number: u64,
    pub status: DepositStatus,
    pub sweep_tx_hash: Option<String>,
    /// 广播时的归集金额（对账时写流水用）
    pub sweep_amount: Option<u128>,
    pub error: Option<String>,
    /// 已尝试归集次数
    pub attempts: u32,
    pub detected_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub swept_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    /// 由新充值构造初始记录（status = pending）
    pub fn from_new(new: NewDeposit, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            child_address: new.child_address,
            network: new.network,
            asset: new.asset,
            amount: new.amount,
            source_tx_hash: new.source_tx_hash,
            block_number: new.block_number,
            status: DepositStatus::Pending,
            sweep_tx_hash: None,
            sweep_amount: None,
            error: None,
            attempts: 0,
            detected_at: now,
            claimed_at: None,
            swept_at: None,
            updated_at: now,
        }
    }
}

/// 归集结果（写回仓储的终态）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepResolution {
    Completed { sweep_tx_hash: String },
    Failed { error: String },
    Uneconomical { reason: String },
}

impl SweepResolution {
    pub fn status(&self) -> DepositStatus {
        match self {
            Self::Completed { .. } => DepositStatus::Completed,
            Self::Failed { .. } => DepositStatus::Failed,
            Self::Uneconomical { .. } => DepositStatus::Uneconomical,
        }
    }
}
