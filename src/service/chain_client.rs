// 链客户端抽象
//
// 每条网络一个实例。扫描器和归集器只依赖这个 trait，
// 生产环境由 EvmChainClient 实现，测试使用脚本化的模拟链。
//
// 地址与哈希统一为 0x 小写十六进制字符串，金额为最小单位 u128。

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::CustodyError;

/// 区块（含完整交易）
#[derive(Debug, Clone, Default)]
pub struct ChainBlock {
    pub number: u64,
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: String,
    pub from: String,
    /// 合约创建交易为 None
    pub to: Option<String>,
    pub value: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    /// 发出事件的合约
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReceipt {
    pub tx_hash: String,
    /// 执行成功
    pub status: bool,
    pub block_number: Option<u64>,
    pub logs: Vec<ChainLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: u128,
}

impl FeeData {
    /// 简单交易手续费上限 = gas_price × gas_limit
    pub fn fee_for(&self, gas_limit: u64) -> u128 {
        self.gas_price.saturating_mul(u128::from(gas_limit))
    }
}

/// 待签名交易
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSpec {
    pub to: String,
    pub value: u128,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_price: u128,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// 网络标识（与 NetworkConfig.key 一致）
    fn network(&self) -> &str;

    async fn block_number(&self) -> Result<u64>;

    /// 区块尚未产生时返回 None
    async fn block_with_transactions(&self, number: u64) -> Result<Option<ChainBlock>>;

    /// 交易未上链时返回 None
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ChainReceipt>>;

    /// 原生币余额
    async fn balance(&self, address: &str) -> Result<u128>;

    /// 代币余额（balanceOf）
    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128>;

    async fn fee_data(&self) -> Result<FeeData>;

    /// 用私钥签名并广播，返回交易哈希（不等待确认）
    async fn send_transaction(&self, private_key: &[u8], tx: TxSpec) -> Result<String>;

    fn receipt_poll_interval(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// 轮询等待回执；超时或链上执行失败返回 `SweepBroadcastFailed`
    async fn wait_for_receipt(&self, tx_hash: &str, timeout: Duration) -> Result<ChainReceipt> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(receipt) = self.transaction_receipt(tx_hash).await? {
                if !receipt.status {
                    return Err(CustodyError::SweepBroadcastFailed(format!(
                        "transaction {} reverted",
                        tx_hash
                    ))
                    .into());
                }
                return Ok(receipt);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CustodyError::SweepBroadcastFailed(format!(
                    "transaction {} not confirmed within {}s",
                    tx_hash,
                    timeout.as_secs()
                ))
                .into());
            }

            tokio::time::sleep(self.receipt_poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_for_gas_limit() {
        let fee = FeeData {
            gas_price: 10_000_000_000,
        };
        assert_eq!(fee.fee_for(21_000), 210_000_000_000_000);

        let huge = FeeData { gas_price: u128::MAX };
        assert_eq!(huge.fee_for(2), u128::MAX);
    }
}
