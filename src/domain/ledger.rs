//! 资金流水（只追加）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::deposit::Asset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// 金库 → 子地址补 gas
    GasTopup,
    /// 子地址 → 金库归集
    Sweep,
}

impl LedgerKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::GasTopup => "gas_topup",
            Self::Sweep => "sweep",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "gas_topup" => Some(Self::GasTopup),
            "sweep" => Some(Self::Sweep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub network: String,
    pub user_id: String,
    /// 子地址
    pub address: String,
    pub deposit_id: Option<Uuid>,
    pub asset: Asset,
    pub amount: u128,
    pub tx_hash: String,
    pub kind: LedgerKind,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn gas_topup(
        network: &str,
        user_id: &str,
        address: &str,
        deposit_id: Uuid,
        amount: u128,
        tx_hash: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            network: network.to_string(),
            user_id: user_id.to_string(),
            address: address.to_string(),
            deposit_id: Some(deposit_id),
            asset: Asset::Native,
            amount,
            tx_hash: tx_hash.to_string(),
            kind: LedgerKind::GasTopup,
            created_at: Utc::now(),
        }
    }

    pub fn sweep(
        network: &str,
        user_id: &str,
        address: &str,
        deposit_id: Uuid,
        asset: Asset,
        amount: u128,
        tx_hash: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            network: network.to_string(),
            user_id: user_id.to_string(),
            address: address.to_string(),
            deposit_id: Some(deposit_id),
            asset,
            amount,
            tx_hash: tx_hash.to_string(),
            kind: LedgerKind::Sweep,
            created_at: Utc::now(),
        }
    }
}
