//! 配置管理模块
//! 支持从环境变量和配置文件加载配置
//!
//! 配置文件中缺省的字段回落到环境变量（各段 `Default` 读取环境变量）。

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::erc20;
use crate::domain::network::{NetworkConfig, NetworkRegistry};
use crate::infrastructure::encryption::EncryptionKey;

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub custody: CustodyConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// 为空时使用内置网络注册表
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_file_logging: bool,
    pub log_file_path: Option<String>,
}

/// 托管密钥配置
///
/// 两项秘密都只从进程配置注入，缺失即启动失败。
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    #[serde(skip_serializing)]
    pub master_mnemonic: String,
    #[serde(skip_serializing)]
    pub mnemonic_passphrase: String,
    #[serde(skip_serializing)]
    pub encryption_key: String,
}

impl std::fmt::Debug for CustodyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyConfig")
            .field("master_mnemonic", &redacted(&self.master_mnemonic))
            .field("mnemonic_passphrase", &redacted(&self.mnemonic_passphrase))
            .field("encryption_key", &redacted(&self.encryption_key))
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

/// 充值扫描器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub poll_interval_secs: u64,
    /// 单次 tick 最多追赶的区块数
    pub max_blocks_per_tick: u64,
    /// 距链头多少个块之后才视为最终
    pub confirmations: u64,
}

/// 归集器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub poll_interval_secs: u64,
    pub batch_size: u32,
    /// 相邻两笔归集之间的固定间隔
    pub delay_between_sweeps_ms: u64,
    pub confirmation_timeout_secs: u64,
    /// in_progress 超过该时长视为中断，进入对账
    pub claim_timeout_secs: u64,
    /// 0 表示失败后只能人工处理
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub native_transfer_gas_limit: u64,
    pub token_transfer_gas_limit: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://postgres@localhost:5432/ironcustody".into()),
            max_connections: env_or("DB_MAX_CONNS", 16),
            min_connections: env_or("DB_MIN_CONNS", 2),
            acquire_timeout_secs: env_or("DB_ACQ_TIMEOUT_SECS", 5),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            enable_file_logging: std::env::var("LOG_FILE_ENABLED")
                .ok()
                .map(|v| v == "1")
                .unwrap_or(false),
            log_file_path: std::env::var("LOG_FILE_PATH").ok(),
        }
    }
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            master_mnemonic: std::env::var("MASTER_MNEMONIC").unwrap_or_default(),
            mnemonic_passphrase: std::env::var("MASTER_MNEMONIC_PASSPHRASE").unwrap_or_default(),
            encryption_key: std::env::var("WALLET_ENC_KEY").unwrap_or_default(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: env_or("SCANNER_POLL_INTERVAL_SECS", 15),
            max_blocks_per_tick: env_or("SCANNER_MAX_BLOCKS_PER_TICK", 500),
            confirmations: env_or("SCANNER_CONFIRMATIONS", 0),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: env_or("SWEEPER_POLL_INTERVAL_SECS", 30),
            batch_size: env_or("SWEEPER_BATCH_SIZE", 20),
            delay_between_sweeps_ms: env_or("SWEEPER_DELAY_MS", 3000),
            confirmation_timeout_secs: env_or("SWEEPER_CONFIRMATION_TIMEOUT_SECS", 180),
            claim_timeout_secs: env_or("SWEEPER_CLAIM_TIMEOUT_SECS", 600),
            max_retries: env_or("SWEEPER_MAX_RETRIES", 3),
            retry_backoff_secs: env_or("SWEEPER_RETRY_BACKOFF_SECS", 120),
            native_transfer_gas_limit: env_or("SWEEPER_NATIVE_GAS_LIMIT", 21_000),
            token_transfer_gas_limit: env_or("SWEEPER_TOKEN_GAS_LIMIT", erc20::DEFAULT_TRANSFER_GAS_LIMIT),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            custody: CustodyConfig::default(),
            scanner: ScannerConfig::default(),
            sweeper: SweeperConfig::default(),
            networks: Vec::new(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(path) = path {
            if path.as_ref().exists() {
                return Self::from_file(path);
            }
            tracing::warn!(path = ?path.as_ref(), "Config file not found, using environment");
        }
        Self::from_env()
    }

    /// 网络注册表：配置了 `[[networks]]` 则只使用配置项
    pub fn network_registry(&self) -> NetworkRegistry {
        if self.networks.is_empty() {
            NetworkRegistry::new()
        } else {
            NetworkRegistry::from_configs(self.networks.clone())
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        // 验证数据库URL格式
        if !self.database.url.starts_with("postgres://")
            && !self.database.url.starts_with("postgresql://")
        {
            anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
        }

        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        // 托管秘密
        if self.custody.master_mnemonic.trim().is_empty() {
            anyhow::bail!("MASTER_MNEMONIC is required");
        }
        let words = self.custody.master_mnemonic.split_whitespace().count();
        if ![12, 15, 18, 21, 24].contains(&words) {
            anyhow::bail!("MASTER_MNEMONIC must have 12/15/18/21/24 words, got {}", words);
        }
        EncryptionKey::from_config_str(&self.custody.encryption_key)
            .context("WALLET_ENC_KEY is missing or invalid")?;

        // 扫描器
        if self.scanner.poll_interval_secs == 0 {
            anyhow::bail!("scanner.poll_interval_secs must be > 0");
        }
        if self.scanner.max_blocks_per_tick == 0 {
            anyhow::bail!("scanner.max_blocks_per_tick must be > 0");
        }

        // 归集器
        if self.sweeper.poll_interval_secs == 0 || self.sweeper.batch_size == 0 {
            anyhow::bail!("sweeper.poll_interval_secs and sweeper.batch_size must be > 0");
        }
        if self.sweeper.confirmation_timeout_secs == 0 {
            anyhow::bail!("sweeper.confirmation_timeout_secs must be > 0");
        }
        // 认领超时必须覆盖一次完整的补 gas + 归集等待，否则会回收仍在进行中的归集
        if self.sweeper.claim_timeout_secs <= self.sweeper.confirmation_timeout_secs * 2 {
            anyhow::bail!(
                "sweeper.claim_timeout_secs ({}) must exceed twice confirmation_timeout_secs ({})",
                self.sweeper.claim_timeout_secs,
                self.sweeper.confirmation_timeout_secs
            );
        }

        if let Err(problems) = self.network_registry().validate() {
            anyhow::bail!("Invalid network configuration: {}", problems.join("; "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", body).unwrap();
        file
    }

    fn full_config() -> String {
        format!(
            r#"
[database]
url = "postgres://test@localhost/custody"
max_connections = 20

[logging]
level = "debug"
format = "json"

[custody]
master_mnemonic = "{}"
encryption_key = "0123456789abcdef0123456789abcdef"

[scanner]
poll_interval_secs = 5
max_blocks_per_tick = 50

[sweeper]
batch_size = 5
max_retries = 0
"#,
            TEST_MNEMONIC
        )
    }

    #[test]
    fn test_config_from_file() {
        let file = write_config(&full_config());
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.scanner.max_blocks_per_tick, 50);
        assert_eq!(config.sweeper.batch_size, 5);
        assert_eq!(config.sweeper.max_retries, 0);
        // 未写的字段取默认值
        assert_eq!(config.sweeper.native_transfer_gas_limit, 21_000);
        assert!(config.networks.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_secrets_are_fatal() {
        let mut config = Config::from_file(write_config(&full_config()).path()).unwrap();
        config.custody.master_mnemonic.clear();
        assert!(config.validate().is_err());

        let mut config = Config::from_file(write_config(&full_config()).path()).unwrap();
        config.custody.encryption_key = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_claim_timeout_must_cover_confirmation() {
        let mut config = Config::from_file(write_config(&full_config()).path()).unwrap();
        config.sweeper.confirmation_timeout_secs = 300;
        config.sweeper.claim_timeout_secs = 400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configured_networks_replace_defaults() {
        let body = format!(
            r#"{}
[[networks]]
key = "sepolia"
display_name = "Sepolia"
chain_id = 11155111
address_format = "evm"
derivation_path_prefix = "m/44'/60'/0'/0"
treasury_derivation_path = "m/44'/60'/1'/0/0"
rpc_url = "http://localhost:8545"
native_decimals = 18
"#,
            full_config()
        );
        let config = Config::from_file(write_config(&body).path()).unwrap();
        let registry = config.network_registry();

        assert!(registry.get("sepolia").is_ok());
        assert!(registry.get("ethereum").is_err());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_file(write_config(&full_config()).path()).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("abandon"));
        assert!(!rendered.contains("0123456789abcdef"));
    }

    #[test]
    fn test_missing_file_falls_back_to_env() {
        let config = Config::from_env_and_file(Some("/nonexistent/ironcustody.toml")).unwrap();
        assert!(config.networks.is_empty());
    }
}
