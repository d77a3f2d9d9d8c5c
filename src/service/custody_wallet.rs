// 托管地址服务
//
// 对外发放充值地址，对内为归集器提供签名私钥。
// 地址缓存表丢失或缺行时，私钥从主种子重新派生，不影响归集。

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::domain::derivation::{
    address_from_private_key, derive_index, normalize_address, DerivedWallet, MasterWallet,
};
use crate::domain::network::{NetworkConfig, NetworkRegistry};
use crate::error::CustodyError;
use crate::infrastructure::encryption::SecretCipher;
use crate::repository::{UserWalletAddress, WalletAddressRepository};

pub struct CustodyWalletService {
    master: Arc<MasterWallet>,
    cipher: Arc<SecretCipher>,
    registry: Arc<NetworkRegistry>,
    addresses: Arc<dyn WalletAddressRepository>,
}

/// 加密上下文：网络键不含 '/'，前缀无歧义
fn secret_context(network: &str, user_id: &str) -> String {
    format!("{}/{}", network, user_id)
}

impl CustodyWalletService {
    pub fn new(
        master: Arc<MasterWallet>,
        cipher: Arc<SecretCipher>,
        registry: Arc<NetworkRegistry>,
        addresses: Arc<dyn WalletAddressRepository>,
    ) -> Self {
        Self {
            master,
            cipher,
            registry,
            addresses,
        }
    }

    /// 发放（或返回已发放的）充值地址
    ///
    /// 幂等：同一 (user_id, network) 永远返回同一地址。
    pub async fn issue_address(&self, user_id: &str, network: &str) -> Result<UserWalletAddress> {
        let config = self.registry.get(network)?;

        if let Some(existing) = self.addresses.find(user_id, &config.key).await? {
            return Ok(existing);
        }

        let derived = self.master.derive_for_user(config, user_id)?;
        let encrypted = self
            .cipher
            .encrypt_secret(&derived.private_key, &secret_context(&config.key, user_id))?;

        let record = UserWalletAddress {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            network: config.key.clone(),
            derivation_index: derive_index(user_id),
            derivation_path: derived.derivation_path.clone(),
            address_key: normalize_address(config.address_format, &derived.address),
            address: derived.address.clone(),
            encrypted_private_key: encrypted,
            created_at: Utc::now(),
        };

        let stored = self
            .addresses
            .insert_or_get(record)
            .await
            .with_context(|| {
                format!(
                    "Failed to store custody address for user {} on {} (index {})",
                    user_id,
                    config.key,
                    derive_index(user_id)
                )
            })?;

        if stored.address != derived.address {
            anyhow::bail!(
                "Cached address {} for user {} on {} does not match derived {}",
                stored.address,
                user_id,
                config.key,
                derived.address
            );
        }

        tracing::info!(
            user_id = %user_id,
            network = %config.key,
            address = %stored.address,
            derivation_path = %stored.derivation_path,
            "Custody address issued"
        );
        Ok(stored)
    }

    /// 取签名私钥，并核对它确实控制 `expected_address`
    pub async fn signing_key(
        &self,
        user_id: &str,
        network: &str,
        expected_address: &str,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let config = self.registry.get(network)?;

        let private_key = match self.addresses.find(user_id, &config.key).await? {
            Some(record) => self
                .cipher
                .decrypt_secret(
                    &record.encrypted_private_key,
                    &secret_context(&config.key, user_id),
                )
                .with_context(|| format!("Failed to decrypt key for user {}", user_id))?,
            None => {
                tracing::warn!(
                    user_id = %user_id,
                    network = %config.key,
                    "Custody address cache miss, re-deriving from master seed"
                );
                self.master.derive_for_user(config, user_id)?.private_key
            }
        };

        self.ensure_controls(config, &private_key, expected_address)?;
        Ok(private_key)
    }

    /// 金库（归集目标、补 gas 来源）
    pub fn treasury(&self, network: &str) -> Result<DerivedWallet> {
        let config = self.registry.get(network)?;
        Ok(self.master.derive_treasury(config)?)
    }

    fn ensure_controls(
        &self,
        config: &NetworkConfig,
        private_key: &[u8],
        expected_address: &str,
    ) -> Result<(), CustodyError> {
        let actual = address_from_private_key(config.address_format, private_key)?;
        if normalize_address(config.address_format, &actual)
            != normalize_address(config.address_format, expected_address)
        {
            return Err(CustodyError::Derivation(format!(
                "key for {} does not control {}",
                actual, expected_address
            )));
        }
        Ok(())
    }
}
