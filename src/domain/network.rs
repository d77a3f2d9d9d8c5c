//! 网络注册表
//!
//! 每条支持的链一份静态配置：派生路径前缀、RPC、精度、代币合约、补 gas 参数。
//! 扫描器与归集器共享同一份只读配置。

use std::collections::HashMap;

use coins_bip32::path::DerivationPath;
use serde::{Deserialize, Serialize};

use crate::domain::derivation::validate_address;
use crate::error::CustodyError;

/// 地址编码格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFormat {
    /// EIP-55 校验和十六进制 0x... (Ethereum / BSC / Polygon)
    Evm,
    /// Base58Check，前缀 0x41 (Tron T...)
    Tron,
}

/// 单链配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 网络标识 (ethereum, bsc, polygon, tron)
    pub key: String,
    pub display_name: String,
    /// EIP-155 chain id，签名时使用
    pub chain_id: u64,
    pub address_format: AddressFormat,
    /// 用户地址派生路径前缀，用户索引作为最后一级追加
    pub derivation_path_prefix: String,
    /// 金库（主钱包）派生路径，与用户路径隔离在不同 account
    pub treasury_derivation_path: String,
    pub rpc_url: String,
    pub native_decimals: u8,
    #[serde(default)]
    pub token_contract_address: Option<String>,
    #[serde(default)]
    pub token_decimals: Option<u8>,
    /// 子地址原生币余额低于该值时补 gas（最小单位）
    #[serde(default)]
    pub gas_topup_threshold: u64,
    /// 每次补 gas 的金额（最小单位）
    #[serde(default)]
    pub gas_topup_amount: u64,
}

impl NetworkConfig {
    /// 用户子钱包派生路径：`{prefix}/{index}`
    pub fn derivation_path(&self, index: u32) -> String {
        format!("{}/{}", self.derivation_path_prefix, index)
    }

    /// 判断地址是否为本网络配置的代币合约
    pub fn is_token_contract(&self, address: &str) -> bool {
        match &self.token_contract_address {
            Some(contract) => contract.eq_ignore_ascii_case(address),
            None => false,
        }
    }
}

/// 网络注册表
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: HashMap<String, NetworkConfig>,
}

impl NetworkRegistry {
    /// 内置默认网络
    pub fn new() -> Self {
        let mut registry = Self {
            networks: HashMap::new(),
        };
        registry.register_default_networks();
        registry
    }

    /// 使用外部配置构建（配置文件中的 `[[networks]]`）
    pub fn from_configs(configs: Vec<NetworkConfig>) -> Self {
        let mut registry = Self {
            networks: HashMap::new(),
        };
        for config in configs {
            registry.register(config);
        }
        registry
    }

    fn register_default_networks(&mut self) {
        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
        // EVM 系列
        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

        self.register(NetworkConfig {
            key: "ethereum".to_string(),
            display_name: "Ethereum".to_string(),
            chain_id: 1,
            address_format: AddressFormat::Evm,
            derivation_path_prefix: "m/44'/60'/0'/0".to_string(),
            treasury_derivation_path: "m/44'/60'/1'/0/0".to_string(),
            rpc_url: std::env::var("ETH_RPC_URL")
                .unwrap_or_else(|_| "https://eth.llamarpc.com".to_string()),
            native_decimals: 18,
            token_contract_address: Some("0xdAC17F958D2ee523a2206206994597C13D831ec7".to_string()),
            token_decimals: Some(6),
            gas_topup_threshold: 2_000_000_000_000_000, // 0.002 ETH
            gas_topup_amount: 3_000_000_000_000_000,    // 0.003 ETH
        });

        self.register(NetworkConfig {
            key: "bsc".to_string(),
            display_name: "BNB Smart Chain".to_string(),
            chain_id: 56,
            address_format: AddressFormat::Evm,
            // BSC 使用与 ETH 相同的 coin type
            derivation_path_prefix: "m/44'/60'/0'/0".to_string(),
            treasury_derivation_path: "m/44'/60'/1'/0/0".to_string(),
            rpc_url: std::env::var("BSC_RPC_URL")
                .unwrap_or_else(|_| "https://bsc-dataseed.binance.org/".to_string()),
            native_decimals: 18,
            token_contract_address: Some("0x55d398326f99059fF775485246999027B3197955".to_string()),
            token_decimals: Some(18),
            gas_topup_threshold: 500_000_000_000_000, // 0.0005 BNB
            gas_topup_amount: 1_000_000_000_000_000,  // 0.001 BNB
        });

        self.register(NetworkConfig {
            key: "polygon".to_string(),
            display_name: "Polygon".to_string(),
            chain_id: 137,
            address_format: AddressFormat::Evm,
            derivation_path_prefix: "m/44'/60'/0'/0".to_string(),
            treasury_derivation_path: "m/44'/60'/1'/0/0".to_string(),
            rpc_url: std::env::var("POLYGON_RPC_URL")
                .unwrap_or_else(|_| "https://polygon-rpc.com/".to_string()),
            native_decimals: 18,
            token_contract_address: Some("0xc2132D05D31c914a87C6611C10748AEb04B58e8F".to_string()),
            token_decimals: Some(6),
            gas_topup_threshold: 20_000_000_000_000_000, // 0.02 MATIC
            gas_topup_amount: 50_000_000_000_000_000,    // 0.05 MATIC
        });

        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
        // 非 EVM 地址格式
        // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

        // Tron: secp256k1 + keccak，地址为 0x41 前缀的 Base58Check
        self.register(NetworkConfig {
            key: "tron".to_string(),
            display_name: "TRON".to_string(),
            chain_id: 728126428,
            address_format: AddressFormat::Tron,
            derivation_path_prefix: "m/44'/195'/0'/0".to_string(),
            treasury_derivation_path: "m/44'/195'/1'/0/0".to_string(),
            rpc_url: std::env::var("TRON_RPC_URL")
                .unwrap_or_else(|_| "https://api.trongrid.io/jsonrpc".to_string()),
            native_decimals: 6,
            token_contract_address: Some("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string()),
            token_decimals: Some(6),
            gas_topup_threshold: 15_000_000, // 15 TRX
            gas_topup_amount: 30_000_000,    // 30 TRX
        });
    }

    pub fn register(&mut self, config: NetworkConfig) {
        self.networks.insert(config.key.to_lowercase(), config);
    }

    /// 查找网络配置，未注册返回 `UnsupportedNetwork`
    pub fn get(&self, key: &str) -> Result<&NetworkConfig, CustodyError> {
        self.networks
            .get(&key.to_lowercase())
            .ok_or_else(|| CustodyError::UnsupportedNetwork(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.networks.contains_key(&key.to_lowercase())
    }

    /// 按 key 排序列出，保证启动顺序稳定
    pub fn list(&self) -> Vec<&NetworkConfig> {
        let mut all: Vec<&NetworkConfig> = self.networks.values().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// 验证配置完整性，返回所有问题而不是遇到第一个就停止
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for config in self.networks.values() {
            if config.key.is_empty() {
                errors.push(format!("Network {} has empty key", config.display_name));
            }

            if config.derivation_path_prefix.ends_with('/') {
                errors.push(format!(
                    "Network {} derivation_path_prefix must not end with '/'",
                    config.key
                ));
            }
            if config
                .derivation_path_prefix
                .parse::<DerivationPath>()
                .is_err()
            {
                errors.push(format!(
                    "Network {} has invalid derivation_path_prefix: {}",
                    config.key, config.derivation_path_prefix
                ));
            }
            if config
                .treasury_derivation_path
                .parse::<DerivationPath>()
                .is_err()
            {
                errors.push(format!(
                    "Network {} has invalid treasury_derivation_path: {}",
                    config.key, config.treasury_derivation_path
                ));
            }
            if config.treasury_derivation_path.starts_with(&format!(
                "{}/",
                config.derivation_path_prefix
            )) {
                errors.push(format!(
                    "Network {} treasury path overlaps the user derivation subtree",
                    config.key
                ));
            }

            match (&config.token_contract_address, config.token_decimals) {
                (Some(_), None) => errors.push(format!(
                    "Network {} has token contract but no token_decimals",
                    config.key
                )),
                (None, Some(_)) => errors.push(format!(
                    "Network {} has token_decimals but no token contract",
                    config.key
                )),
                _ => {}
            }

            if let Some(contract) = &config.token_contract_address {
                if !validate_address(config.address_format, contract) {
                    errors.push(format!(
                        "Network {} has malformed token contract address: {}",
                        config.key, contract
                    ));
                }
            }

            if config.gas_topup_amount < config.gas_topup_threshold {
                errors.push(format!(
                    "Network {} gas_topup_amount is below gas_topup_threshold",
                    config.key
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
