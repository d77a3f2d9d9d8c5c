//! 托管错误分类
//!
//! 领域错误使用 `CustodyError`，仓储与链客户端统一返回 `anyhow::Result`，
//! 需要区分错误类型时通过 `downcast_ref::<CustodyError>()` 取回。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CustodyError {
    /// 网络不在注册表中
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// 密文被篡改、截断或上下文不匹配
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// RPC 暂时不可用（下一个 tick 重试）
    #[error("rpc unavailable on {network}: {message}")]
    RpcUnavailable { network: String, message: String },

    /// 余额不足以覆盖手续费（良性跳过）
    #[error("sweep value {balance} does not cover fee {fee}")]
    InsufficientSweepValue { balance: u128, fee: u128 },

    /// 广播被拒绝、确认超时或链上执行失败
    #[error("sweep broadcast failed: {0}")]
    SweepBroadcastFailed(String),

    /// 重复入账（仓储内部吞掉，不向上抛出）
    #[error("duplicate deposit {network}/{tx_hash}/{asset}")]
    DuplicateDeposit {
        network: String,
        tx_hash: String,
        asset: String,
    },

    #[error("invalid master seed: {0}")]
    InvalidSeed(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CustodyError {
    pub fn rpc(network: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::RpcUnavailable {
            network: network.into(),
            message: err.to_string(),
        }
    }

    /// 是否为暂时性错误（下一轮自动重试即可）
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcUnavailable { .. })
    }

    /// 错误码（写入 deposit.error 前缀，便于运维检索）
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedNetwork(_) => "unsupported_network",
            Self::InvalidCiphertext => "invalid_ciphertext",
            Self::RpcUnavailable { .. } => "rpc_unavailable",
            Self::InsufficientSweepValue { .. } => "insufficient_sweep_value",
            Self::SweepBroadcastFailed(_) => "sweep_broadcast_failed",
            Self::DuplicateDeposit { .. } => "duplicate_deposit",
            Self::InvalidSeed(_) => "invalid_seed",
            Self::Derivation(_) => "derivation_failed",
            Self::InvalidAddress(_) => "invalid_address",
            Self::Encryption(_) => "encryption_failed",
            Self::Config(_) => "config_error",
        }
    }
}

pub type CustodyResult<T> = Result<T, CustodyError>;
