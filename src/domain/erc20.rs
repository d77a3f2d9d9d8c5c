//! ERC-20 编解码
//!
//! 扫描器用它识别 Transfer 事件，归集器用它构造 `transfer` / `balanceOf` 调用数据。

use std::str::FromStr;

use anyhow::{Context, Result};
use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};

pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// `transfer(address,uint256)` 的默认 gas 上限参考值
pub const DEFAULT_TRANSFER_GAS_LIMIT: u64 = 100_000;

/// 解码后的代币转账
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    /// 0x 小写
    pub from: String,
    /// 0x 小写
    pub to: String,
    pub value: u128,
}

/// keccak256("Transfer(address,address,uint256)")
pub fn transfer_topic() -> H256 {
    H256::from(ethers::utils::keccak256(TRANSFER_EVENT_SIGNATURE.as_bytes()))
}

/// 解码 Transfer 事件日志
///
/// 只接受 3 个 topic 的 ERC-20 形式（ERC-721 的 Transfer 有 4 个 topic，直接忽略）。
/// 金额超出 u128 的日志视为无法处理，返回 None。
pub fn decode_transfer(topics: &[String], data: &[u8]) -> Option<TokenTransfer> {
    if topics.len() != 3 || data.len() != 32 {
        return None;
    }

    let signature = H256::from_str(&topics[0]).ok()?;
    if signature != transfer_topic() {
        return None;
    }

    let from = topic_to_address(&topics[1])?;
    let to = topic_to_address(&topics[2])?;
    let value = u128::try_from(U256::from_big_endian(data)).ok()?;

    Some(TokenTransfer { from, to, value })
}

fn topic_to_address(topic: &str) -> Option<String> {
    let word = H256::from_str(topic).ok()?;
    // 地址左侧补零到 32 字节，高 12 字节必须为 0
    if word.as_bytes()[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(format!("{:?}", Address::from(word)))
}

/// `transfer(to, amount)` 调用数据
pub fn transfer_calldata(to: &str, amount: u128) -> Result<Vec<u8>> {
    let to = Address::from_str(to).with_context(|| format!("Invalid recipient address: {}", to))?;

    let mut data = ethers::utils::id("transfer(address,uint256)").to_vec();
    data.extend(abi::encode(&[Token::Address(to), Token::Uint(U256::from(amount))]));
    Ok(data)
}

/// `balanceOf(owner)` 调用数据
pub fn balance_of_calldata(owner: &str) -> Result<Vec<u8>> {
    let owner =
        Address::from_str(owner).with_context(|| format!("Invalid owner address: {}", owner))?;

    let mut data = ethers::utils::id("balanceOf(address)").to_vec();
    data.extend(abi::encode(&[Token::Address(owner)]));
    Ok(data)
}

/// 解码单个 uint256 返回值
pub fn decode_uint(data: &[u8]) -> Result<u128> {
    if data.len() != 32 {
        anyhow::bail!("Expected 32-byte uint256, got {} bytes", data.len());
    }
    u128::try_from(U256::from_big_endian(data))
        .map_err(|_| anyhow::anyhow!("uint256 value exceeds u128"))
}

/// 把地址编码为事件 topic（测试与模拟链使用）
pub fn address_topic(address: &str) -> Result<String> {
    let address = Address::from_str(address).context("Invalid address")?;
    Ok(format!("{:?}", H256::from(address)))
}
