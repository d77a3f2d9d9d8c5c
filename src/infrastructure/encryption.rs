//! AES-256-GCM 私钥加密
//!
//! 每个用户使用独立的上下文密钥：`HMAC-SHA256(master_key, context)`，
//! 同时把 context 作为 AAD 绑定，密文无法在用户之间挪用。
//!
//! 密文格式：`version(1) || nonce(12) || ciphertext+tag`

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CustodyError;

type HmacSha256 = Hmac<Sha256>;

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const CONTEXT_DOMAIN: &[u8] = b"ironcustody/secret/v1/";

/// 加密主密钥（使用Zeroize保护）
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.key
    }

    /// 解析配置中的密钥
    ///
    /// 支持三种写法：64 位 hex、32 字节原文、>=16 字符口令（SHA-256 拉伸）
    pub fn from_config_str(raw: &str) -> Result<Self, CustodyError> {
        if raw.is_empty() {
            return Err(CustodyError::Config("WALLET_ENC_KEY empty".into()));
        }

        let mut key = [0u8; 32];
        if raw.len() == 64 {
            let mut decoded = Zeroizing::new(
                hex::decode(raw)
                    .map_err(|e| CustodyError::Config(format!("Invalid hex key: {}", e)))?,
            );
            key.copy_from_slice(&decoded);
            decoded.zeroize();
        } else if raw.len() == 32 {
            key.copy_from_slice(raw.as_bytes());
        } else if raw.len() >= 16 {
            let digest = Sha256::digest(raw.as_bytes());
            key.copy_from_slice(&digest);
        } else {
            return Err(CustodyError::Config(
                "WALLET_ENC_KEY too short (min 16)".into(),
            ));
        }

        Ok(Self { key })
    }
}

/// 私钥加解密器
pub struct SecretCipher {
    master: EncryptionKey,
}

impl SecretCipher {
    pub fn new(master: EncryptionKey) -> Self {
        Self { master }
    }

    /// 上下文密钥 = HMAC-SHA256(master, domain || context)
    fn context_key(&self, context: &str) -> Result<Zeroizing<[u8; 32]>, CustodyError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.master.as_slice())
            .map_err(|e| CustodyError::Encryption(format!("Invalid master key: {}", e)))?;
        mac.update(CONTEXT_DOMAIN);
        mac.update(context.as_bytes());

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(key)
    }

    /// 加密秘密数据，绑定到 `context`（通常为 user_id）
    pub fn encrypt_secret(&self, secret: &[u8], context: &str) -> Result<Vec<u8>, CustodyError> {
        let key = self.context_key(context)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| CustodyError::Encryption(format!("Invalid key: {}", e)))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: secret,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| CustodyError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        result.push(FORMAT_VERSION);
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 解密；篡改、截断、版本不符或上下文不匹配一律返回 `InvalidCiphertext`
    pub fn decrypt_secret(
        &self,
        encrypted: &[u8],
        context: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CustodyError> {
        if encrypted.len() < 1 + NONCE_LEN + TAG_LEN || encrypted[0] != FORMAT_VERSION {
            return Err(CustodyError::InvalidCiphertext);
        }

        let key = self.context_key(context)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| CustodyError::Encryption(format!("Invalid key: {}", e)))?;

        let nonce = Nonce::from_slice(&encrypted[1..1 + NONCE_LEN]);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &encrypted[1 + NONCE_LEN..],
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| CustodyError::InvalidCiphertext)?;

        Ok(Zeroizing::new(plaintext))
    }
}
