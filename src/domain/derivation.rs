//! 托管地址派生
//!
//! 所有用户子钱包都由同一个主种子派生：
//! - 用户索引 = SHA-256(user_id) 截断为 31 位，不依赖自增序号
//! - 同一 (user_id, network) 永远得到同一个地址，地址缓存丢失后可从种子恢复
//! - 金库地址使用独立的 account 路径，不与用户子树重叠

use bip39::{Language, Mnemonic};
use coins_bip32::path::DerivationPath;
use coins_bip32::prelude::*;
use k256::ecdsa::SigningKey;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use zeroize::Zeroizing;

use crate::domain::network::{AddressFormat, NetworkConfig};
use crate::error::CustodyError;

/// Tron 主网地址前缀
const TRON_ADDRESS_PREFIX: u8 = 0x41;

/// 非硬化索引上限 (2^31)
const INDEX_MASK: u32 = 0x7FFF_FFFF;

/// 派生结果
#[derive(Clone)]
pub struct DerivedWallet {
    /// 网络格式的地址
    pub address: String,
    /// 未压缩公钥 (hex，去掉 0x04 前缀)
    pub public_key: String,
    /// 私钥原始字节，仅用于加密存储或即时签名
    pub private_key: Zeroizing<Vec<u8>>,
    pub derivation_path: String,
}

impl std::fmt::Debug for DerivedWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedWallet")
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("derivation_path", &self.derivation_path)
            .finish()
    }
}

/// 用户 ID → 派生索引
///
/// 取 SHA-256(user_id) 前 4 字节（大端）并屏蔽最高位，
/// 结果落在非硬化索引范围内。
pub fn derive_index(user_id: &str) -> u32 {
    let digest = Sha256::digest(user_id.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    raw & INDEX_MASK
}

/// 主钱包
///
/// 启动时构造一次，之后只读，通过 `Arc` 传给扫描器和归集器。
pub struct MasterWallet {
    seed: Zeroizing<Vec<u8>>,
    root: XPriv,
}

impl std::fmt::Debug for MasterWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterWallet")
            .field("seed", &"<redacted>")
            .finish()
    }
}

impl MasterWallet {
    /// 从 BIP39 助记词构造
    pub fn from_mnemonic(phrase: &str, passphrase: &str) -> Result<Self, CustodyError> {
        let mnemonic = Mnemonic::parse_in(Language::English, phrase.trim())
            .map_err(|e| CustodyError::InvalidSeed(e.to_string()))?;
        let seed = Zeroizing::new(mnemonic.to_seed(passphrase).to_vec());
        Self::from_seed_bytes(seed)
    }

    /// 从原始种子构造（BIP32 要求 16..=64 字节）
    pub fn from_seed(seed: &[u8]) -> Result<Self, CustodyError> {
        if seed.len() < 16 || seed.len() > 64 {
            return Err(CustodyError::InvalidSeed(format!(
                "seed must be 16..=64 bytes, got {}",
                seed.len()
            )));
        }
        Self::from_seed_bytes(Zeroizing::new(seed.to_vec()))
    }

    fn from_seed_bytes(seed: Zeroizing<Vec<u8>>) -> Result<Self, CustodyError> {
        let root = XPriv::root_from_seed(seed.as_slice(), None)
            .map_err(|e| CustodyError::InvalidSeed(e.to_string()))?;
        Ok(Self { seed, root })
    }

    /// 种子指纹（仅用于日志区分不同主钱包，不可逆）
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.seed.as_slice());
        hex::encode(&digest[..4])
    }

    /// 按网络路径模板派生第 `index` 个子钱包
    pub fn derive_address(
        &self,
        network: &NetworkConfig,
        index: u32,
    ) -> Result<DerivedWallet, CustodyError> {
        if index > INDEX_MASK {
            return Err(CustodyError::Derivation(format!(
                "index {} is outside the non-hardened range",
                index
            )));
        }
        self.derive_at_path(network, &network.derivation_path(index))
    }

    /// 派生某个用户在某个网络上的子钱包
    pub fn derive_for_user(
        &self,
        network: &NetworkConfig,
        user_id: &str,
    ) -> Result<DerivedWallet, CustodyError> {
        self.derive_address(network, derive_index(user_id))
    }

    /// 派生金库（归集目标、补 gas 来源）
    pub fn derive_treasury(&self, network: &NetworkConfig) -> Result<DerivedWallet, CustodyError> {
        self.derive_at_path(network, &network.treasury_derivation_path)
    }

    fn derive_at_path(
        &self,
        network: &NetworkConfig,
        path: &str,
    ) -> Result<DerivedWallet, CustodyError> {
        let derivation_path = path
            .parse::<DerivationPath>()
            .map_err(|e| CustodyError::Derivation(format!("invalid path {}: {}", path, e)))?;

        let derived_key = self
            .root
            .derive_path(&derivation_path)
            .map_err(|e| CustodyError::Derivation(e.to_string()))?;

        // XPriv 实现 AsRef<SigningKey>
        let signing_key: &SigningKey = derived_key.as_ref();
        let private_key = Zeroizing::new(signing_key.to_bytes().to_vec());
        let (address, public_key) = address_of(network.address_format, signing_key)?;

        Ok(DerivedWallet {
            address,
            public_key,
            private_key,
            derivation_path: path.to_string(),
        })
    }
}

/// 由私钥还原地址（签名前核对解密出的密钥确实属于目标地址）
pub fn address_from_private_key(
    format: AddressFormat,
    private_key: &[u8],
) -> Result<String, CustodyError> {
    let signing_key = SigningKey::from_slice(private_key)
        .map_err(|e| CustodyError::Derivation(format!("invalid private key: {}", e)))?;
    let (address, _) = address_of(format, &signing_key)?;
    Ok(address)
}

/// 返回 (地址, 未压缩公钥 hex)
fn address_of(
    format: AddressFormat,
    signing_key: &SigningKey,
) -> Result<(String, String), CustodyError> {
    let verifying_key = signing_key.verifying_key();
    let encoded = verifying_key.to_encoded_point(false); // 未压缩格式
    let public_key = &encoded.as_bytes()[1..]; // 去掉 0x04 前缀

    let hash = Keccak256::digest(public_key);
    let address = encode_address(format, &hash[12..])?;
    Ok((address, hex::encode(public_key)))
}

/// 20 字节账户哈希 → 网络地址
fn encode_address(format: AddressFormat, account: &[u8]) -> Result<String, CustodyError> {
    if account.len() != 20 {
        return Err(CustodyError::Derivation(format!(
            "account hash must be 20 bytes, got {}",
            account.len()
        )));
    }

    match format {
        AddressFormat::Evm => {
            let address = ethers::types::Address::from_slice(account);
            Ok(ethers::utils::to_checksum(&address, None))
        }
        AddressFormat::Tron => {
            let mut payload = Vec::with_capacity(21);
            payload.push(TRON_ADDRESS_PREFIX);
            payload.extend_from_slice(account);
            Ok(bs58::encode(payload).with_check().into_string())
        }
    }
}

/// 地址比较用的规范形式（EVM 不区分大小写，Base58 区分）
pub fn normalize_address(format: AddressFormat, address: &str) -> String {
    match format {
        AddressFormat::Evm => address.trim().to_lowercase(),
        AddressFormat::Tron => address.trim().to_string(),
    }
}

/// 地址格式校验
pub fn validate_address(format: AddressFormat, address: &str) -> bool {
    match format {
        AddressFormat::Evm => {
            let Some(hex_part) = address.strip_prefix("0x") else {
                return false;
            };
            hex_part.len() == 40 && hex::decode(hex_part).is_ok()
        }
        AddressFormat::Tron => match bs58::decode(address).with_check(None).into_vec() {
            Ok(bytes) => bytes.len() == 21 && bytes[0] == TRON_ADDRESS_PREFIX,
            Err(_) => false,
        },
    }
}
