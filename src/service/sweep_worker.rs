// 归集器
//
// 每条网络一个实例，严格串行：
// 1. 对账：认领超时的 in_progress 记录，已有成功回执的补记完成，否则退回 pending
// 2. 重试：失败记录在重试次数与退避时间允许时退回 pending
// 3. 归集：按检测顺序逐笔 原子认领 → 补 gas → 广播 → 等待确认 → 写结果
//
// 归集转出地址的全部余额。同一地址的后一笔充值若发现余额已空，
// 且检测之后该地址有过完成的归集，则视为已被那笔归集带走。
//
// 金库是唯一的补 gas 签名者，每笔金库交易都等到确认后才发下一笔，
// 同一网络内不会出现两笔未确认的金库交易。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SweeperConfig;
use crate::domain::deposit::{Asset, Deposit, DepositStatus, SweepResolution};
use crate::domain::derivation::DerivedWallet;
use crate::domain::erc20;
use crate::domain::ledger::LedgerEntry;
use crate::domain::network::NetworkConfig;
use crate::error::CustodyError;
use crate::repository::{DepositRepository, LedgerRepository};
use crate::service::chain_client::{ChainClient, TxSpec};
use crate::service::custody_wallet::CustodyWalletService;

/// 单笔归集结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed { sweep_tx_hash: String, amount: u128 },
    /// 余额已被同地址同资产的另一笔归集转走
    SweptBySibling { sibling_id: Uuid, sweep_tx_hash: String },
    /// 余额不足以支付手续费，记为终态 uneconomical
    Uneconomical { balance: u128, fee: u128 },
    Failed { error: String },
    /// 暂时性错误且尚未广播任何交易，已退回 pending
    Released { error: String },
    /// 认领失败，已被其他执行者处理
    Skipped,
}

/// 单次 tick 的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reconciled_completed: usize,
    pub reconciled_released: usize,
    pub requeued: u64,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub uneconomical: usize,
    pub released: usize,
    pub skipped: usize,
}

/// `execute` 的成功结果
enum Swept {
    Broadcast { sweep_tx_hash: String, amount: u128 },
    BySibling { sibling_id: Uuid, sweep_tx_hash: String },
}

/// 单次尝试中已广播的交易
#[derive(Debug, Default)]
struct SweepProgress {
    gas_topup_tx: Option<String>,
    sweep_tx: Option<String>,
}

impl SweepProgress {
    fn broadcast_any(&self) -> bool {
        self.gas_topup_tx.is_some() || self.sweep_tx.is_some()
    }
}

pub struct SweepWorker {
    network: NetworkConfig,
    client: Arc<dyn ChainClient>,
    deposits: Arc<dyn DepositRepository>,
    ledger: Arc<dyn LedgerRepository>,
    wallets: Arc<CustodyWalletService>,
    config: SweeperConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SweepWorker {
    pub fn new(
        network: NetworkConfig,
        client: Arc<dyn ChainClient>,
        deposits: Arc<dyn DepositRepository>,
        ledger: Arc<dyn LedgerRepository>,
        wallets: Arc<CustodyWalletService>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            network,
            client,
            deposits,
            ledger,
            wallets,
            config,
            shutdown: None,
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.confirmation_timeout_secs)
    }

    pub async fn tick(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        self.reconcile_stale_claims(&mut report).await?;

        report.requeued = self
            .deposits
            .requeue_failed(
                &self.network.key,
                self.config.max_retries,
                self.config.retry_backoff_secs,
                Utc::now(),
            )
            .await?;
        if report.requeued > 0 {
            tracing::info!(
                network = %self.network.key,
                count = report.requeued,
                "Failed deposits re-queued for retry"
            );
        }

        let pending = self
            .deposits
            .list_by_status(&self.network.key, DepositStatus::Pending, self.config.batch_size)
            .await?;

        for (i, deposit) in pending.iter().enumerate() {
            if self.stopping() {
                break;
            }
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delay_between_sweeps_ms))
                    .await;
            }

            // 单笔失败不影响后续
            let outcome = match self.sweep_deposit(deposit).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        network = %self.network.key,
                        deposit_id = %deposit.id,
                        error = ?e,
                        "Failed to record sweep outcome"
                    );
                    continue;
                }
            };

            match outcome {
                SweepOutcome::Skipped => {
                    report.skipped += 1;
                    continue;
                }
                SweepOutcome::Completed { .. } | SweepOutcome::SweptBySibling { .. } => {
                    report.completed += 1
                }
                SweepOutcome::Uneconomical { .. } => report.uneconomical += 1,
                SweepOutcome::Failed { .. } => report.failed += 1,
                SweepOutcome::Released { .. } => report.released += 1,
            }
            report.attempted += 1;
        }

        Ok(report)
    }

    /// 对账：处理认领超时（进程崩溃或卡死）的记录
    async fn reconcile_stale_claims(&self, report: &mut SweepReport) -> Result<()> {
        let claimed_before =
            Utc::now() - chrono::Duration::seconds(self.config.claim_timeout_secs as i64);
        let stale = self
            .deposits
            .list_stale_claims(&self.network.key, claimed_before)
            .await?;

        // 单条对账失败不阻塞其余记录与本轮归集
        for deposit in stale {
            if let Err(e) = self.reconcile_claim(&deposit, report).await {
                tracing::error!(
                    network = %self.network.key,
                    deposit_id = %deposit.id,
                    sweep_tx_hash = ?deposit.sweep_tx_hash,
                    error = ?e,
                    "Failed to reconcile stale claim"
                );
            }
        }

        Ok(())
    }

    async fn reconcile_claim(&self, deposit: &Deposit, report: &mut SweepReport) -> Result<()> {
        let receipt = match deposit.sweep_tx_hash.as_deref() {
            Some(hash) => self.client.transaction_receipt(hash).await?,
            None => None,
        };

        match (deposit.sweep_tx_hash.as_deref(), receipt) {
            (Some(hash), Some(receipt)) if receipt.status => {
                let resolution = SweepResolution::Completed {
                    sweep_tx_hash: hash.to_string(),
                };
                if self.deposits.resolve(deposit.id, &resolution).await? {
                    let amount = deposit.sweep_amount.unwrap_or(deposit.amount);
                    self.append_sweep_ledger(deposit, hash, amount).await;
                    report.reconciled_completed += 1;
                    tracing::info!(
                        network = %self.network.key,
                        deposit_id = %deposit.id,
                        sweep_tx_hash = %hash,
                        "Stale claim reconciled as completed"
                    );
                }
            }
            (hash, _) => {
                let reason = match hash {
                    Some(hash) => format!("claim expired, sweep tx {} unconfirmed", hash),
                    None => "claim expired before broadcast".to_string(),
                };
                if self.deposits.release_claim(deposit.id, &reason).await? {
                    report.reconciled_released += 1;
                    tracing::warn!(
                        network = %self.network.key,
                        deposit_id = %deposit.id,
                        reason = %reason,
                        "Stale claim released to pending"
                    );
                }
            }
        }

        Ok(())
    }

    /// 归集单笔充值
    ///
    /// 返回 Err 仅表示结果写库失败；链上错误都体现在 `SweepOutcome` 中。
    pub async fn sweep_deposit(&self, deposit: &Deposit) -> Result<SweepOutcome> {
        if !self.deposits.claim(deposit.id).await? {
            tracing::debug!(deposit_id = %deposit.id, "Deposit already claimed, skipping");
            return Ok(SweepOutcome::Skipped);
        }

        let mut progress = SweepProgress::default();
        let result = self.execute(deposit, &mut progress).await;

        match result {
            Ok(Swept::Broadcast {
                sweep_tx_hash,
                amount,
            }) => {
                let resolution = SweepResolution::Completed {
                    sweep_tx_hash: sweep_tx_hash.clone(),
                };
                if !self.deposits.resolve(deposit.id, &resolution).await? {
                    tracing::warn!(
                        network = %self.network.key,
                        deposit_id = %deposit.id,
                        sweep_tx_hash = %sweep_tx_hash,
                        "Claim lost before sweep was recorded, leaving it to reconciliation"
                    );
                    return Ok(SweepOutcome::Skipped);
                }
                self.append_sweep_ledger(deposit, &sweep_tx_hash, amount).await;

                tracing::info!(
                    network = %self.network.key,
                    deposit_id = %deposit.id,
                    asset = %deposit.asset,
                    amount = %amount,
                    sweep_tx_hash = %sweep_tx_hash,
                    "Deposit swept"
                );
                Ok(SweepOutcome::Completed {
                    sweep_tx_hash,
                    amount,
                })
            }
            Ok(Swept::BySibling {
                sibling_id,
                sweep_tx_hash,
            }) => {
                // 金额已记在那笔归集的流水里，这里不再追加
                let resolution = SweepResolution::Completed {
                    sweep_tx_hash: sweep_tx_hash.clone(),
                };
                if !self.deposits.resolve(deposit.id, &resolution).await? {
                    return Ok(SweepOutcome::Skipped);
                }
                tracing::info!(
                    network = %self.network.key,
                    deposit_id = %deposit.id,
                    sibling_id = %sibling_id,
                    sweep_tx_hash = %sweep_tx_hash,
                    "Deposit already swept together with an earlier deposit"
                );
                Ok(SweepOutcome::SweptBySibling {
                    sibling_id,
                    sweep_tx_hash,
                })
            }
            Err(e) => self.record_failure(deposit, &progress, e).await,
        }
    }

    async fn record_failure(
        &self,
        deposit: &Deposit,
        progress: &SweepProgress,
        err: anyhow::Error,
    ) -> Result<SweepOutcome> {
        let custody_err = err.downcast_ref::<CustodyError>();

        if let Some(CustodyError::InsufficientSweepValue { balance, fee }) = custody_err {
            let (balance, fee) = (*balance, *fee);
            let resolution = SweepResolution::Uneconomical {
                reason: err.to_string(),
            };
            self.deposits.resolve(deposit.id, &resolution).await?;
            tracing::info!(
                network = %self.network.key,
                deposit_id = %deposit.id,
                balance = %balance,
                fee = %fee,
                "Deposit below sweep fee, marked uneconomical"
            );
            return Ok(SweepOutcome::Uneconomical { balance, fee });
        }

        let code = custody_err.map(CustodyError::code).unwrap_or("sweep_error");
        let error = format!("{}: {:#}", code, err);

        if custody_err.map(CustodyError::is_transient).unwrap_or(false) && !progress.broadcast_any()
        {
            self.deposits.release_claim(deposit.id, &error).await?;
            tracing::warn!(
                network = %self.network.key,
                deposit_id = %deposit.id,
                error = %error,
                "Chain unavailable before broadcast, deposit released"
            );
            return Ok(SweepOutcome::Released { error });
        }

        self.deposits
            .resolve(
                deposit.id,
                &SweepResolution::Failed {
                    error: error.clone(),
                },
            )
            .await?;
        tracing::error!(
            network = %self.network.key,
            deposit_id = %deposit.id,
            attempts = deposit.attempts + 1,
            gas_topup_tx = ?progress.gas_topup_tx,
            sweep_tx = ?progress.sweep_tx,
            error = %error,
            "Sweep failed"
        );
        Ok(SweepOutcome::Failed { error })
    }

    async fn execute(&self, deposit: &Deposit, progress: &mut SweepProgress) -> Result<Swept> {
        let treasury = self.wallets.treasury(&self.network.key)?;
        let fee_data = self.client.fee_data().await?;

        let (tx, amount) = match &deposit.asset {
            Asset::Native => {
                let gas_limit = self.config.native_transfer_gas_limit;
                let fee = fee_data.fee_for(gas_limit);
                let balance = self.client.balance(&deposit.child_address).await?;
                if balance <= fee {
                    if let Some(swept) = self.swept_by_sibling(deposit).await? {
                        return Ok(swept);
                    }
                    return Err(CustodyError::InsufficientSweepValue { balance, fee }.into());
                }

                // 转出全部余额减手续费，之前标记为 uneconomical 的零头一并归集
                let amount = balance - fee;
                let tx = TxSpec {
                    to: treasury.address.clone(),
                    value: amount,
                    data: Vec::new(),
                    gas_limit,
                    gas_price: fee_data.gas_price,
                };
                (tx, amount)
            }
            Asset::Token(contract) => {
                let amount = self
                    .client
                    .token_balance(contract, &deposit.child_address)
                    .await?;
                if amount == 0 {
                    if let Some(swept) = self.swept_by_sibling(deposit).await? {
                        return Ok(swept);
                    }
                    return Err(CustodyError::SweepBroadcastFailed(format!(
                        "token balance of {} is zero",
                        deposit.child_address
                    ))
                    .into());
                }

                let gas_limit = self.config.token_transfer_gas_limit;
                let fee = fee_data.fee_for(gas_limit);
                self.ensure_gas(deposit, &treasury, fee, fee_data.gas_price, progress)
                    .await?;

                let tx = TxSpec {
                    to: contract.clone(),
                    value: 0,
                    data: erc20::transfer_calldata(&treasury.address, amount)?,
                    gas_limit,
                    gas_price: fee_data.gas_price,
                };
                (tx, amount)
            }
        };

        let signing_key = self
            .wallets
            .signing_key(&deposit.user_id, &self.network.key, &deposit.child_address)
            .await?;

        let sweep_tx_hash = self.client.send_transaction(&signing_key, tx).await?;
        drop(signing_key);
        progress.sweep_tx = Some(sweep_tx_hash.clone());

        // 先落哈希再等确认，崩溃后对账可据此补记
        self.deposits
            .record_sweep_tx(deposit.id, &sweep_tx_hash, amount)
            .await?;

        self.client
            .wait_for_receipt(&sweep_tx_hash, self.confirmation_timeout())
            .await?;

        Ok(Swept::Broadcast {
            sweep_tx_hash,
            amount,
        })
    }

    /// 本笔检测之后，同地址同资产已有完成的归集
    async fn swept_by_sibling(&self, deposit: &Deposit) -> Result<Option<Swept>> {
        let sibling = self
            .deposits
            .find_completed_sweep_since(
                &self.network.key,
                &deposit.child_address,
                &deposit.asset,
                deposit.detected_at,
            )
            .await?;

        Ok(sibling.and_then(|s| {
            s.sweep_tx_hash.map(|sweep_tx_hash| Swept::BySibling {
                sibling_id: s.id,
                sweep_tx_hash,
            })
        }))
    }

    /// 代币归集前补 gas：子地址原生币余额低于阈值（或不足本次手续费）时由金库转入
    async fn ensure_gas(
        &self,
        deposit: &Deposit,
        treasury: &DerivedWallet,
        sweep_fee: u128,
        gas_price: u128,
        progress: &mut SweepProgress,
    ) -> Result<()> {
        let native = self.client.balance(&deposit.child_address).await?;
        let threshold = u128::from(self.network.gas_topup_threshold).max(sweep_fee);
        if native >= threshold {
            return Ok(());
        }

        let topup = u128::from(self.network.gas_topup_amount).max(sweep_fee - native.min(sweep_fee));
        let tx = TxSpec {
            to: deposit.child_address.clone(),
            value: topup,
            data: Vec::new(),
            gas_limit: self.config.native_transfer_gas_limit,
            gas_price,
        };

        tracing::info!(
            network = %self.network.key,
            deposit_id = %deposit.id,
            address = %deposit.child_address,
            balance = %native,
            topup = %topup,
            "Topping up gas from treasury"
        );

        let topup_tx_hash = self
            .client
            .send_transaction(&treasury.private_key, tx)
            .await?;
        progress.gas_topup_tx = Some(topup_tx_hash.clone());

        self.client
            .wait_for_receipt(&topup_tx_hash, self.confirmation_timeout())
            .await?;

        self.append_ledger(LedgerEntry::gas_topup(
            &self.network.key,
            &deposit.user_id,
            &deposit.child_address,
            deposit.id,
            topup,
            &topup_tx_hash,
        ))
        .await;
        Ok(())
    }

    async fn append_sweep_ledger(&self, deposit: &Deposit, sweep_tx_hash: &str, amount: u128) {
        self.append_ledger(LedgerEntry::sweep(
            &self.network.key,
            &deposit.user_id,
            &deposit.child_address,
            deposit.id,
            deposit.asset.clone(),
            amount,
            sweep_tx_hash,
        ))
        .await;
    }

    /// 资金已在链上移动，流水写入失败只记录错误，不回滚状态
    async fn append_ledger(&self, entry: LedgerEntry) {
        if let Err(e) = self.ledger.append(&entry).await {
            tracing::error!(
                network = %entry.network,
                deposit_id = ?entry.deposit_id,
                kind = entry.kind.to_db_string(),
                tx_hash = %entry.tx_hash,
                amount = %entry.amount,
                error = ?e,
                "Failed to append ledger entry"
            );
        }
    }

    /// 后台运行，直到 `shutdown` 置位；进行中的那笔归集会先完成
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown.clone());

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            network = %self.network.key,
            interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Sweep worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
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
                    if report.attempted > 0 || report.reconciled_completed > 0 {
                        tracing::info!(
                            network = %self.network.key,
                            completed = report.completed,
                            failed = report.failed,
                            uneconomical = report.uneconomical,
                            released = report.released,
                            reconciled = report.reconciled_completed,
                            "Sweep tick completed"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        network = %self.network.key,
                        error = ?e,
                        "Sweep tick failed"
                    );
                }
            }
        }

        tracing::info!(network = %self.network.key, "Sweep worker stopped");
    }
}
