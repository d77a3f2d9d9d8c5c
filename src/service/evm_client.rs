// EVM 链客户端（ethers-rs）
//
// 读请求失败统一包装为 RpcUnavailable（下一个 tick 重试），
// 广播被节点拒绝包装为 SweepBroadcastFailed。

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::{
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, BlockNumber, Bytes, TransactionRequest, H256, U256},
};

use crate::domain::erc20;
use crate::error::CustodyError;
use crate::service::chain_client::{
    ChainBlock, ChainClient, ChainLog, ChainReceipt, ChainTransaction, FeeData, TxSpec,
};

pub struct EvmChainClient {
    network: String,
    chain_id: u64,
    provider: Provider<Http>,
}

impl EvmChainClient {
    pub fn new(network: &str, rpc_url: &str, chain_id: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Failed to create provider for {}", network))?;

        Ok(Self {
            network: network.to_string(),
            chain_id,
            provider,
        })
    }

    fn rpc_error(&self, err: impl std::fmt::Display) -> anyhow::Error {
        CustodyError::rpc(&self.network, err).into()
    }
}

fn parse_address(address: &str) -> Result<Address> {
    Address::from_str(address)
        .map_err(|_| CustodyError::InvalidAddress(address.to_string()).into())
}

fn parse_hash(hash: &str) -> Result<H256> {
    H256::from_str(hash).with_context(|| format!("Invalid transaction hash: {}", hash))
}

fn to_u128(value: U256) -> Result<u128> {
    u128::try_from(value).map_err(|_| anyhow::anyhow!("value {} exceeds u128", value))
}

fn hex_string<T: std::fmt::Debug>(value: &T) -> String {
    // ethers 的 Debug 输出为完整 0x 小写十六进制
    format!("{:?}", value)
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn network(&self) -> &str {
        &self.network
    }

    async fn block_number(&self) -> Result<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.rpc_error(e))?;
        Ok(number.as_u64())
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<ChainBlock>> {
        let block = self
            .provider
            .get_block_with_txs(BlockNumber::Number(number.into()))
            .await
            .map_err(|e| self.rpc_error(e))?;

        let Some(block) = block else {
            return Ok(None);
        };

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for tx in block.transactions {
            transactions.push(ChainTransaction {
                hash: hex_string(&tx.hash),
                from: hex_string(&tx.from),
                to: tx.to.as_ref().map(hex_string),
                value: to_u128(tx.value)?,
            });
        }

        Ok(Some(ChainBlock {
            number,
            transactions,
        }))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ChainReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(parse_hash(tx_hash)?)
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(receipt.map(|r| ChainReceipt {
            tx_hash: hex_string(&r.transaction_hash),
            status: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            block_number: r.block_number.map(|n| n.as_u64()),
            logs: r
                .logs
                .into_iter()
                .map(|log| ChainLog {
                    address: hex_string(&log.address),
                    topics: log.topics.iter().map(hex_string).collect(),
                    data: log.data.to_vec(),
                })
                .collect(),
        }))
    }

    async fn balance(&self, address: &str) -> Result<u128> {
        let balance = self
            .provider
            .get_balance(parse_address(address)?, None)
            .await
            .map_err(|e| self.rpc_error(e))?;
        to_u128(balance)
    }

    async fn token_balance(&self, token: &str, owner: &str) -> Result<u128> {
        let call = TransactionRequest::new()
            .to(parse_address(token)?)
            .data(Bytes::from(erc20::balance_of_calldata(owner)?));

        let output = self
            .provider
            .call(&call.into(), None)
            .await
            .map_err(|e| self.rpc_error(e))?;

        erc20::decode_uint(&output)
    }

    async fn fee_data(&self) -> Result<FeeData> {
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| self.rpc_error(e))?;
        Ok(FeeData {
            gas_price: to_u128(gas_price)?,
        })
    }

    async fn send_transaction(&self, private_key: &[u8], tx: TxSpec) -> Result<String> {
        let wallet = LocalWallet::from_bytes(private_key)
            .map_err(|e| CustodyError::Derivation(format!("Invalid signing key: {}", e)))?
            .with_chain_id(self.chain_id);
        let from = wallet.address();
        let client = SignerMiddleware::new(self.provider.clone(), wallet);

        // legacy 交易：gas 上限与价格由调用方固定，手续费可预先算出
        let request = TransactionRequest::new()
            .from(from)
            .to(parse_address(&tx.to)?)
            .value(U256::from(tx.value))
            .data(Bytes::from(tx.data))
            .gas(tx.gas_limit)
            .gas_price(U256::from(tx.gas_price))
            .chain_id(self.chain_id);

        let pending = client
            .send_transaction(request, None)
            .await
            .map_err(|e| CustodyError::SweepBroadcastFailed(e.to_string()))?;

        let tx_hash = hex_string(&pending.tx_hash());
        tracing::info!(
            network = %self.network,
            from = %hex_string(&from),
            to = %tx.to,
            tx_hash = %tx_hash,
            "Transaction broadcast"
        );
        Ok(tx_hash)
    }
}
