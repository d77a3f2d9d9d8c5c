//! 测试辅助模块
//! 内存仓储 + 脚本化模拟链，扫描器与归集器测试共用

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use ironcustody::config::{ScannerConfig, SweeperConfig};
use ironcustody::domain::derivation::{address_from_private_key, normalize_address};
use ironcustody::domain::erc20;
use ironcustody::domain::{
    AddressFormat, Asset, Deposit, DepositStatus, LedgerEntry, MasterWallet, NetworkConfig,
    NetworkRegistry, NewDeposit, SweepResolution,
};
use ironcustody::error::CustodyError;
use ironcustody::infrastructure::encryption::{EncryptionKey, SecretCipher};
use ironcustody::repository::deposit_repository::is_due_for_retry;
use ironcustody::repository::{
    DepositRepository, LedgerRepository, UserWalletAddress, WalletAddressRepository,
};
use ironcustody::service::chain_client::{
    ChainBlock, ChainClient, ChainLog, ChainReceipt, ChainTransaction, FeeData, TxSpec,
};
use ironcustody::service::CustodyWalletService;

pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// 1 ETH
pub const ONE_ETH: u128 = 1_000_000_000_000_000_000;

pub const EXTERNAL_SENDER: &str = "0x28c6c06298d514db089934071355e5743bf21d60";

// ============ 内存仓储 ============

#[derive(Default)]
pub struct InMemoryDepositRepository {
    rows: Mutex<Vec<Deposit>>,
}

impl InMemoryDepositRepository {
    pub fn all(&self) -> Vec<Deposit> {
        self.rows.lock().unwrap().clone()
    }

    pub fn get(&self, id: Uuid) -> Deposit {
        self.all().into_iter().find(|d| d.id == id).unwrap()
    }

    /// 直接改写记录（模拟崩溃现场、时间流逝）
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Deposit)) {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.iter_mut().find(|d| d.id == id).unwrap();
        f(row);
    }
}

fn transition(row: &mut Deposit, to: DepositStatus) -> bool {
    if !row.status.can_transition_to(&to) {
        return false;
    }
    row.status = to;
    row.updated_at = Utc::now();
    true
}

#[async_trait]
impl DepositRepository for InMemoryDepositRepository {
    async fn insert_many(&self, deposits: &[NewDeposit]) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut inserted = 0;
        for new in deposits {
            let key = new.dedup_key();
            let exists = rows.iter().any(|d| {
                (d.network.clone(), d.source_tx_hash.clone(), d.asset.to_db_string()) == key
            });
            if exists {
                continue;
            }
            let mut normalized = new.clone();
            normalized.source_tx_hash = key.1;
            rows.push(Deposit::from_new(normalized, Utc::now()));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn max_block_number(&self, network: &str) -> Result<Option<u64>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.network == network)
            .map(|d| d.block_number)
            .max())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Deposit>> {
        Ok(self.all().into_iter().find(|d| d.id == id))
    }

    async fn list_by_status(
        &self,
        network: &str,
        status: DepositStatus,
        limit: u32,
    ) -> Result<Vec<Deposit>> {
        let mut rows: Vec<Deposit> = self
            .all()
            .into_iter()
            .filter(|d| d.network == network && d.status == status)
            .collect();
        rows.sort_by_key(|d| (d.detected_at, d.block_number));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn find_completed_sweep_since(
        &self,
        network: &str,
        child_address: &str,
        asset: &Asset,
        since: DateTime<Utc>,
    ) -> Result<Option<Deposit>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|d| {
                d.network == network
                    && d.child_address == child_address
                    && &d.asset == asset
                    && d.status == DepositStatus::Completed
                    && d.swept_at.map(|t| t >= since).unwrap_or(false)
            })
            .max_by_key(|d| d.swept_at))
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.iter_mut().find(|d| d.id == id) else {
            return Ok(false);
        };
        if row.status != DepositStatus::Pending {
            return Ok(false);
        }
        transition(row, DepositStatus::InProgress);
        row.attempts += 1;
        row.claimed_at = Some(Utc::now());
        row.sweep_tx_hash = None;
        row.sweep_amount = None;
        Ok(true)
    }

    async fn record_sweep_tx(&self, id: Uuid, sweep_tx_hash: &str, amount: u128) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows
            .iter_mut()
            .find(|d| d.id == id && d.status == DepositStatus::InProgress)
        {
            Some(row) => {
                row.sweep_tx_hash = Some(sweep_tx_hash.to_string());
                row.sweep_amount = Some(amount);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn resolve(&self, id: Uuid, resolution: &SweepResolution) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .iter_mut()
            .find(|d| d.id == id && d.status == DepositStatus::InProgress)
        else {
            return Ok(false);
        };
        transition(row, resolution.status());
        match resolution {
            SweepResolution::Completed { sweep_tx_hash } => {
                row.sweep_tx_hash = Some(sweep_tx_hash.clone());
                row.error = None;
                row.swept_at = Some(Utc::now());
            }
            SweepResolution::Failed { error } => row.error = Some(error.clone()),
            SweepResolution::Uneconomical { reason } => row.error = Some(reason.clone()),
        }
        Ok(true)
    }

    async fn list_stale_claims(
        &self,
        network: &str,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Deposit>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|d| {
                d.network == network
                    && d.status == DepositStatus::InProgress
                    && d.claimed_at.map(|t| t < claimed_before).unwrap_or(false)
            })
            .collect())
    }

    async fn release_claim(&self, id: Uuid, reason: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .iter_mut()
            .find(|d| d.id == id && d.status == DepositStatus::InProgress)
        else {
            return Ok(false);
        };
        transition(row, DepositStatus::Pending);
        row.error = Some(reason.to_string());
        row.claimed_at = None;
        Ok(true)
    }

    async fn requeue_failed(
        &self,
        network: &str,
        max_retries: u32,
        backoff_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut requeued = 0;
        for row in rows.iter_mut().filter(|d| d.network == network) {
            if is_due_for_retry(row, max_retries, backoff_secs, now) {
                transition(row, DepositStatus::Pending);
                row.claimed_at = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[derive(Default)]
pub struct InMemoryWalletAddressRepository {
    rows: Mutex<Vec<UserWalletAddress>>,
}

impl InMemoryWalletAddressRepository {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn remove(&self, user_id: &str, network: &str) {
        self.rows
            .lock()
            .unwrap()
            .retain(|r| !(r.user_id == user_id && r.network == network));
    }

    pub fn insert_raw(&self, record: UserWalletAddress) {
        self.rows.lock().unwrap().push(record);
    }
}

#[async_trait]
impl WalletAddressRepository for InMemoryWalletAddressRepository {
    async fn find(&self, user_id: &str, network: &str) -> Result<Option<UserWalletAddress>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id && r.network == network)
            .cloned())
    }

    async fn insert_or_get(&self, record: UserWalletAddress) -> Result<UserWalletAddress> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows
            .iter()
            .find(|r| r.user_id == record.user_id && r.network == record.network)
        {
            return Ok(existing.clone());
        }
        if rows
            .iter()
            .any(|r| r.network == record.network && r.address_key == record.address_key)
        {
            anyhow::bail!(
                "duplicate key value violates unique constraint \"uq_custody_wallet_address\""
            );
        }
        rows.push(record.clone());
        Ok(record)
    }

    async fn find_by_addresses(
        &self,
        network: &str,
        address_keys: &[String],
    ) -> Result<HashMap<String, UserWalletAddress>> {
        let wanted: HashSet<&String> = address_keys.iter().collect();
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.network == network && wanted.contains(&r.address_key))
            .map(|r| (r.address_key.clone(), r.clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryLedgerRepository {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedgerRepository {
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedgerRepository {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn list_by_deposit(&self, deposit_id: Uuid) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries()
            .into_iter()
            .filter(|e| e.deposit_id == Some(deposit_id))
            .collect())
    }
}

// ============ 模拟链 ============

/// 已广播交易
#[derive(Debug, Clone)]
pub struct SentTx {
    pub hash: String,
    pub from: String,
    pub spec: TxSpec,
}

#[derive(Default)]
struct MockState {
    head: u64,
    blocks: HashMap<u64, ChainBlock>,
    receipts: HashMap<String, ChainReceipt>,
    native: HashMap<String, u128>,
    tokens: HashMap<(String, String), u128>,
    gas_price: u128,
    failing_blocks: HashSet<u64>,
    failing_receipts: HashSet<String>,
    rpc_down: bool,
    hold_receipts: bool,
    block_requests: Vec<u64>,
    sent: Vec<SentTx>,
    nonce: u64,
}

/// 脚本化的 EVM 链：广播立即生效并产生成功回执
pub struct MockChain {
    network: String,
    state: Mutex<MockState>,
}

fn key(address: &str) -> String {
    address.to_lowercase()
}

impl MockChain {
    pub fn new(network: &str) -> Self {
        Self {
            network: network.to_string(),
            state: Mutex::new(MockState {
                gas_price: 10_000_000_000, // 10 gwei
                ..Default::default()
            }),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        self.state.lock().unwrap().gas_price = gas_price;
    }

    pub fn add_block(&self, number: u64, transactions: Vec<ChainTransaction>) {
        let mut state = self.state.lock().unwrap();
        state.blocks.insert(
            number,
            ChainBlock {
                number,
                transactions,
            },
        );
        state.head = state.head.max(number);
    }

    /// 空块填充 `from..=to`
    pub fn add_empty_blocks(&self, from: u64, to: u64) {
        for n in from..=to {
            if !self.state.lock().unwrap().blocks.contains_key(&n) {
                self.add_block(n, Vec::new());
            }
        }
    }

    pub fn add_receipt(&self, receipt: ChainReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(key(&receipt.tx_hash), receipt);
    }

    pub fn set_block_failure(&self, number: u64, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_blocks.insert(number);
        } else {
            state.failing_blocks.remove(&number);
        }
    }

    pub fn set_receipt_failure(&self, tx_hash: &str, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_receipts.insert(key(tx_hash));
        } else {
            state.failing_receipts.remove(&key(tx_hash));
        }
    }

    pub fn set_rpc_down(&self, down: bool) {
        self.state.lock().unwrap().rpc_down = down;
    }

    /// 广播后不产生回执（模拟长时间未确认）
    pub fn set_hold_receipts(&self, hold: bool) {
        self.state.lock().unwrap().hold_receipts = hold;
    }

    pub fn set_native_balance(&self, address: &str, amount: u128) {
        self.state
            .lock()
            .unwrap()
            .native
            .insert(key(address), amount);
    }

    pub fn set_token_balance(&self, token: &str, owner: &str, amount: u128) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert((key(token), key(owner)), amount);
    }

    pub fn native_balance(&self, address: &str) -> u128 {
        *self
            .state
            .lock()
            .unwrap()
            .native
            .get(&key(address))
            .unwrap_or(&0)
    }

    pub fn token_balance_of(&self, token: &str, owner: &str) -> u128 {
        *self
            .state
            .lock()
            .unwrap()
            .tokens
            .get(&(key(token), key(owner)))
            .unwrap_or(&0)
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn block_requests(&self) -> Vec<u64> {
        self.state.lock().unwrap().block_requests.clone()
    }

    fn check_up(&self, state: &MockState) -> Result<()> {
        if state.rpc_down {
            return Err(CustodyError::rpc(&self.network, "connection refused").into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn network(&self) -> &str {
        &self.network
    }

    async fn block_number(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        self.check_up(&state)?;
        Ok(state.head)
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<ChainBlock>> {
        let mut state = self.state.lock().unwrap();
        self.check_up(&state)?;
        if state.failing_blocks.contains(&number) {
            return Err(CustodyError::rpc(&self.network, format!("timeout reading block {}", number)).into());
        }
        state.block_requests.push(number);
        Ok(state.blocks.get(&number).cloned())
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ChainReceipt>> {
        let state = self.state.lock().unwrap();
        self.check_up(&state)?;
        if state.failing_receipts.contains(&key(tx_hash)) {
            return Err(CustodyError::rpc(&self.network, format!("timeout reading receipt {}", tx_hash)).into());
        }
        Ok(state.receipts.get(&key(tx_hash)).cloned())
    }

    async fn balance(&self, address: &str) -> Result<u128> {
        let state = self.state.lock().unwrap();
        self.check_up(&state)?;
        Ok(*state.native.get(&key(address)).unwrap_or(&0))
    }

    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128> {
        let state = self.state.lock().unwrap();
        self.check_up(&state)?;
        Ok(*state.tokens.get(&(key(token), key(owner))).unwrap_or(&0))
    }

    async fn fee_data(&self) -> Result<FeeData> {
        let state = self.state.lock().unwrap();
        self.check_up(&state)?;
        Ok(FeeData {
            gas_price: state.gas_price,
        })
    }

    async fn send_transaction(&self, private_key: &[u8], tx: TxSpec) -> Result<String> {
        let from = key(&address_from_private_key(AddressFormat::Evm, private_key)?);
        let mut state = self.state.lock().unwrap();
        self.check_up(&state)?;

        let fee = tx.gas_price * u128::from(tx.gas_limit);
        let sender_native = *state.native.get(&from).unwrap_or(&0);
        if sender_native < fee + tx.value {
            return Err(CustodyError::SweepBroadcastFailed(format!(
                "insufficient funds for gas * price + value: have {} want {}",
                sender_native,
                fee + tx.value
            ))
            .into());
        }
        state.native.insert(from.clone(), sender_native - fee - tx.value);
        *state.native.entry(key(&tx.to)).or_insert(0) += tx.value;

        let mut logs = Vec::new();
        if tx.data.len() == 68 && tx.data.starts_with(&[0xa9, 0x05, 0x9c, 0xbb]) {
            let recipient = format!("0x{}", hex::encode(&tx.data[16..36]));
            let amount = erc20::decode_uint(&tx.data[36..68])?;
            let token = key(&tx.to);
            let balance = *state.tokens.get(&(token.clone(), from.clone())).unwrap_or(&0);
            if balance < amount {
                return Err(CustodyError::SweepBroadcastFailed(
                    "execution reverted: transfer amount exceeds balance".into(),
                )
                .into());
            }
            state.tokens.insert((token.clone(), from.clone()), balance - amount);
            *state.tokens.entry((token.clone(), recipient.clone())).or_insert(0) += amount;
            logs.push(transfer_log(&token, &from, &recipient, amount));
        }

        state.nonce += 1;
        let hash = format!("0x{:064x}", 0xabc000 + state.nonce);
        state.sent.push(SentTx {
            hash: hash.clone(),
            from,
            spec: tx,
        });
        if !state.hold_receipts {
            let receipt = ChainReceipt {
                tx_hash: hash.clone(),
                status: true,
                block_number: Some(state.head + 1),
                logs,
            };
            state.receipts.insert(hash.clone(), receipt);
        }
        Ok(hash)
    }

    fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(1)
    }
}

// ============ 构造辅助 ============

pub fn tx_hash(n: u64) -> String {
    format!("0x{:064x}", n)
}

pub fn native_tx(hash: &str, to: &str, value: u128) -> ChainTransaction {
    ChainTransaction {
        hash: hash.to_string(),
        from: EXTERNAL_SENDER.to_string(),
        to: Some(to.to_string()),
        value,
    }
}

/// 调用代币合约的交易（金额在回执日志中）
pub fn token_call_tx(hash: &str, token: &str) -> ChainTransaction {
    ChainTransaction {
        hash: hash.to_string(),
        from: EXTERNAL_SENDER.to_string(),
        to: Some(token.to_string()),
        value: 0,
    }
}

pub fn transfer_log(token: &str, from: &str, to: &str, amount: u128) -> ChainLog {
    let mut data = vec![0u8; 32];
    data[16..].copy_from_slice(&amount.to_be_bytes());
    ChainLog {
        address: key(token),
        topics: vec![
            format!("{:?}", erc20::transfer_topic()),
            erc20::address_topic(from).unwrap(),
            erc20::address_topic(to).unwrap(),
        ],
        data,
    }
}

pub fn receipt(hash: &str, logs: Vec<ChainLog>) -> ChainReceipt {
    ChainReceipt {
        tx_hash: hash.to_string(),
        status: true,
        block_number: None,
        logs,
    }
}

pub fn ethereum() -> NetworkConfig {
    NetworkRegistry::new().get("ethereum").unwrap().clone()
}

pub fn usdt() -> String {
    ethereum().token_contract_address.unwrap()
}

pub fn scanner_config() -> ScannerConfig {
    ScannerConfig {
        poll_interval_secs: 1,
        max_blocks_per_tick: 500,
        confirmations: 0,
    }
}

pub fn sweeper_config() -> SweeperConfig {
    SweeperConfig {
        poll_interval_secs: 1,
        batch_size: 20,
        delay_between_sweeps_ms: 0,
        confirmation_timeout_secs: 5,
        claim_timeout_secs: 600,
        max_retries: 3,
        retry_backoff_secs: 120,
        native_transfer_gas_limit: 21_000,
        token_transfer_gas_limit: 100_000,
    }
}

/// 一套共享内存状态的测试环境
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub deposits: Arc<InMemoryDepositRepository>,
    pub addresses: Arc<InMemoryWalletAddressRepository>,
    pub ledger: Arc<InMemoryLedgerRepository>,
    pub wallets: Arc<CustodyWalletService>,
    pub registry: Arc<NetworkRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let master = Arc::new(MasterWallet::from_mnemonic(TEST_MNEMONIC, "").unwrap());
        let cipher = Arc::new(SecretCipher::new(EncryptionKey::new([7u8; 32])));
        let registry = Arc::new(NetworkRegistry::new());
        let addresses = Arc::new(InMemoryWalletAddressRepository::default());
        let wallets = Arc::new(CustodyWalletService::new(
            master,
            cipher,
            registry.clone(),
            addresses.clone(),
        ));

        Self {
            chain: Arc::new(MockChain::new("ethereum")),
            deposits: Arc::new(InMemoryDepositRepository::default()),
            addresses,
            ledger: Arc::new(InMemoryLedgerRepository::default()),
            wallets,
            registry,
        }
    }

    /// 在 ethereum 上为用户发放地址
    pub async fn issue(&self, user_id: &str) -> UserWalletAddress {
        self.wallets.issue_address(user_id, "ethereum").await.unwrap()
    }

    pub fn treasury_address(&self) -> String {
        normalize_address(
            AddressFormat::Evm,
            &self.wallets.treasury("ethereum").unwrap().address,
        )
    }
}
