// 充值扫描器
//
// 每条网络一个实例，定时轮询：
// - 区块严格按序处理，整块持久化成功后才推进检查点
// - 任一 RPC 失败放弃整块，下个 tick 从同一检查点重试
// - 写入以 (network, source_tx_hash, asset) 去重，重扫无副作用
//
// 检查点只保存在内存中，启动时由已持久化充值的最大区块号推出
// （没有任何充值时取链头 - 1）。
//
// 金库发出的原生币转账（补 gas）不是用户充值，一律跳过。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ScannerConfig;
use crate::domain::deposit::{Asset, NewDeposit};
use crate::domain::derivation::normalize_address;
use crate::domain::erc20;
use crate::domain::network::NetworkConfig;
use crate::error::CustodyError;
use crate::repository::{DepositRepository, WalletAddressRepository};
use crate::service::chain_client::ChainClient;

/// 单次 tick 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// 本轮开始前的检查点
    pub from_checkpoint: u64,
    /// 本轮结束后的检查点
    pub to_checkpoint: u64,
    pub blocks_scanned: u64,
    pub deposits_found: usize,
    pub deposits_inserted: u64,
}

/// 候选入账（地址尚未反查）
struct Candidate {
    tx_hash: String,
    recipient_key: String,
    asset: Asset,
    amount: u128,
}

pub struct DepositScanner {
    network: NetworkConfig,
    client: Arc<dyn ChainClient>,
    deposits: Arc<dyn DepositRepository>,
    addresses: Arc<dyn WalletAddressRepository>,
    /// 金库地址（规范形式）
    treasury_key: String,
    config: ScannerConfig,
    checkpoint: Option<u64>,
}

impl DepositScanner {
    pub fn new(
        network: NetworkConfig,
        client: Arc<dyn ChainClient>,
        deposits: Arc<dyn DepositRepository>,
        addresses: Arc<dyn WalletAddressRepository>,
        treasury_address: &str,
        config: ScannerConfig,
    ) -> Self {
        let treasury_key = normalize_address(network.address_format, treasury_address);
        Self {
            network,
            client,
            deposits,
            addresses,
            treasury_key,
            config,
            checkpoint: None,
        }
    }

    /// 已完整处理的最高区块；首个 tick 之前为 None
    pub fn checkpoint(&self) -> Option<u64> {
        self.checkpoint
    }

    async fn load_checkpoint(&mut self, head: u64) -> Result<u64> {
        if let Some(checkpoint) = self.checkpoint {
            return Ok(checkpoint);
        }

        let checkpoint = match self.deposits.max_block_number(&self.network.key).await? {
            Some(block) => block,
            None => head.saturating_sub(1),
        };

        tracing::info!(
            network = %self.network.key,
            checkpoint = checkpoint,
            head = head,
            "Scan checkpoint initialized"
        );
        self.checkpoint = Some(checkpoint);
        Ok(checkpoint)
    }

    /// 追赶一轮：处理 `checkpoint+1 ..= min(head - confirmations, checkpoint + max_blocks_per_tick)`
    pub async fn tick(&mut self) -> Result<ScanReport> {
        let head = self.client.block_number().await?;
        let safe_head = head.saturating_sub(self.config.confirmations);
        let checkpoint = self.load_checkpoint(safe_head).await?;

        let mut report = ScanReport {
            from_checkpoint: checkpoint,
            to_checkpoint: checkpoint,
            ..Default::default()
        };

        if safe_head <= checkpoint {
            return Ok(report);
        }

        let target = safe_head.min(checkpoint.saturating_add(self.config.max_blocks_per_tick));

        for number in (checkpoint + 1)..=target {
            let found = self.scan_block(number).await?;
            let inserted = self.deposits.insert_many(&found).await?;

            // 整块持久化后才推进
            self.checkpoint = Some(number);
            report.to_checkpoint = number;
            report.blocks_scanned += 1;
            report.deposits_found += found.len();
            report.deposits_inserted += inserted;

            if !found.is_empty() {
                tracing::info!(
                    network = %self.network.key,
                    block = number,
                    found = found.len(),
                    inserted = inserted,
                    "Deposits detected"
                );
            }
        }

        if target < safe_head {
            tracing::debug!(
                network = %self.network.key,
                checkpoint = target,
                head = safe_head,
                "Scanner behind head, continuing next tick"
            );
        }

        Ok(report)
    }

    /// 扫描单个区块，返回其中所有入账（不写库）
    pub async fn scan_block(&self, number: u64) -> Result<Vec<NewDeposit>> {
        let block = self
            .client
            .block_with_transactions(number)
            .await?
            .ok_or_else(|| {
                CustodyError::rpc(&self.network.key, format!("block {} not available", number))
            })?;

        let format = self.network.address_format;
        let mut candidates = Vec::new();

        for tx in &block.transactions {
            let Some(to) = tx.to.as_deref() else {
                continue;
            };

            if tx.value > 0 && !self.is_treasury(&tx.from) {
                candidates.push(Candidate {
                    tx_hash: tx.hash.to_lowercase(),
                    recipient_key: normalize_address(format, to),
                    asset: Asset::Native,
                    amount: tx.value,
                });
            }

            if self.network.is_token_contract(to) {
                if let Some(candidate) = self.token_candidate(&tx.hash, number).await? {
                    candidates.push(candidate);
                }
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = candidates
            .iter()
            .map(|c| c.recipient_key.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let owners = self
            .addresses
            .find_by_addresses(&self.network.key, &keys)
            .await?;

        Ok(candidates
            .into_iter()
            .filter_map(|candidate| {
                let owner = owners.get(&candidate.recipient_key)?;
                Some(NewDeposit {
                    user_id: owner.user_id.clone(),
                    child_address: owner.address.clone(),
                    network: self.network.key.clone(),
                    asset: candidate.asset,
                    amount: candidate.amount,
                    source_tx_hash: candidate.tx_hash,
                    block_number: number,
                })
            })
            .collect())
    }

    fn is_treasury(&self, from: &str) -> bool {
        normalize_address(self.network.address_format, from) == self.treasury_key
    }

    /// 调用代币合约的交易：从回执中解码 Transfer 事件
    ///
    /// 只认配置的代币合约发出的事件；同一交易给多个托管地址转账时，
    /// 唯一键 (tx, asset) 只能容纳一条，取第一条并告警。
    async fn token_candidate(&self, tx_hash: &str, block: u64) -> Result<Option<Candidate>> {
        let Some(contract) = self.network.token_contract_address.as_deref() else {
            return Ok(None);
        };

        let receipt = self.client.transaction_receipt(tx_hash).await?.ok_or_else(|| {
            CustodyError::rpc(
                &self.network.key,
                format!("receipt for {} in block {} not available", tx_hash, block),
            )
        })?;

        if !receipt.status {
            return Ok(None);
        }

        let transfers: Vec<_> = receipt
            .logs
            .iter()
            .filter(|log| self.network.is_token_contract(&log.address))
            .filter_map(|log| erc20::decode_transfer(&log.topics, &log.data))
            .filter(|transfer| transfer.value > 0)
            .collect();

        // 先反查，确保取的是第一条"转给托管地址"的事件
        let keys: Vec<String> = transfers
            .iter()
            .map(|t| normalize_address(self.network.address_format, &t.to))
            .collect();
        let owners: HashMap<_, _> = if keys.is_empty() {
            HashMap::new()
        } else {
            self.addresses
                .find_by_addresses(&self.network.key, &keys)
                .await?
        };

        let mut matched = keys
            .into_iter()
            .zip(transfers)
            .filter(|(key, _)| owners.contains_key(key));

        let Some((recipient_key, transfer)) = matched.next() else {
            return Ok(None);
        };

        let skipped = matched.count();
        if skipped > 0 {
            tracing::warn!(
                network = %self.network.key,
                tx_hash = %tx_hash,
                skipped = skipped,
                "Multiple custody token transfers in one transaction, only the first is credited"
            );
        }

        Ok(Some(Candidate {
            tx_hash: tx_hash.to_lowercase(),
            recipient_key,
            asset: Asset::Token(normalize_address(self.network.address_format, contract)),
            amount: transfer.value,
        }))
    }

    /// 后台运行，直到 `shutdown` 置位；进行中的 tick 会先完成
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            network = %self.network.key,
            interval_secs = self.config.poll_interval_secs,
            max_blocks_per_tick = self.config.max_blocks_per_tick,
            confirmations = self.config.confirmations,
            "Deposit scanner started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    // 发送端已释放，视为停止
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) => {
                    if report.blocks_scanned > 0 {
                        tracing::debug!(
                            network = %self.network.key,
                            checkpoint = report.to_checkpoint,
                            blocks = report.blocks_scanned,
                            inserted = report.deposits_inserted,
                            "Scan tick completed"
                        );
                    }
                }
                Err(e) => {
                    let transient = e
                        .downcast_ref::<CustodyError>()
                        .map(CustodyError::is_transient)
                        .unwrap_or(false);
                    if transient {
                        tracing::warn!(
                            network = %self.network.key,
                            checkpoint = ?self.checkpoint,
                            error = %e,
                            "Chain unavailable, retrying next tick"
                        );
                    } else {
                        tracing::error!(
                            network = %self.network.key,
                            checkpoint = ?self.checkpoint,
                            error = ?e,
                            "Scan tick failed"
                        );
                    }
                }
            }
        }

        tracing::info!(
            network = %self.network.key,
            checkpoint = ?self.checkpoint,
            "Deposit scanner stopped"
        );
    }
}
