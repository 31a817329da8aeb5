use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{StudioError, StudioResult};

const TOKEN_VERSION: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const DEV_FALLBACK_KEY: &str = "dev-unsafe-master-key";

/**
 * \brief 凭证密文编解码器（AES-256-GCM）。
 * \details 密文格式 `v1:<nonce>:<tag>:<ciphertext>`，各段均为标准 base64。
 */
#[derive(Clone)]
pub struct SecretCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCodec(..)")
    }
}

impl SecretCodec {
    /**
     * \brief 由主密钥原文派生 32 字节密钥（SHA-256）。
     */
    pub fn from_master(master: &str) -> Self {
        let digest = Sha256::digest(master.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        SecretCodec { key }
    }

    /**
     * \brief 读取 CRED_MASTER_KEY / JWT_SECRET。
     * \param production 生产模式下缺失主密钥直接报错，否则退化为开发密钥并告警。
     */
    pub fn from_env(production: bool) -> StudioResult<Self> {
        let master = std::env::var("CRED_MASTER_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("JWT_SECRET").ok().filter(|v| !v.trim().is_empty()));
        match master {
            Some(m) => Ok(Self::from_master(&m)),
            None if production => Err(StudioError::InvalidInput(
                "CRED_MASTER_KEY must be set in production".to_string(),
            )),
            None => {
                tracing::warn!("CRED_MASTER_KEY not set, using insecure development key");
                Ok(Self::from_master(DEV_FALLBACK_KEY))
            }
        }
    }

    /**
     * \brief 加密明文；每次调用生成新的随机 nonce。
     */
    pub fn encrypt(&self, plain: &str) -> StudioResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| StudioError::Decryption(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|_| StudioError::Decryption("AES-GCM encryption failed".into()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok([
            TOKEN_VERSION.to_string(),
            general_purpose::STANDARD.encode(nonce),
            general_purpose::STANDARD.encode(tag),
            general_purpose::STANDARD.encode(ciphertext),
        ]
        .join(":"))
    }

    /**
     * \brief 解密密文，格式/版本/认证任一失败返回 Decryption。
     */
    pub fn decrypt(&self, token: &str) -> StudioResult<String> {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != 4 || parts[0] != TOKEN_VERSION {
            return Err(StudioError::Decryption("invalid secret payload".into()));
        }
        let decode = |s: &str| {
            general_purpose::STANDARD
                .decode(s)
                .map_err(|e| StudioError::Decryption(format!("bad base64: {e}")))
        };
        let nonce = decode(parts[1])?;
        let tag = decode(parts[2])?;
        let mut sealed = decode(parts[3])?;
        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(StudioError::Decryption("invalid nonce or tag length".into()));
        }
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| StudioError::Decryption(e.to_string()))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| StudioError::Decryption("AES-GCM authentication failed".into()))?;
        String::from_utf8(plain).map_err(|e| StudioError::Decryption(e.to_string()))
    }
}

/**
 * \brief 密钥脱敏：保留首尾各 4 位，其余以星号替代；不足 8 位整体隐藏。
 */
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SecretCodec {
        SecretCodec::from_master("unit-test-master")
    }

    #[test]
    fn test_roundtrip_various_inputs() {
        let c = codec();
        for plain in ["", "sk-abc123", "中文密钥🔥", r#"{"accessKeyId":"a","accessKeySecret":"b"}"#] {
            let token = c.encrypt(plain).expect("encrypt");
            assert_eq!(c.decrypt(&token).expect("decrypt"), plain);
        }
    }

    #[test]
    fn test_token_has_four_parts_and_fresh_nonce() {
        let c = codec();
        let a = c.encrypt("same").unwrap();
        let b = c.encrypt("same").unwrap();
        assert_eq!(a.split(':').count(), 4);
        assert!(a.starts_with("v1:"));
        assert_ne!(a.split(':').nth(1), b.split(':').nth(1));
    }

    #[test]
    fn test_flipping_any_ciphertext_byte_fails() {
        let c = codec();
        let token = c.encrypt("sk-super-secret-value").unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        let raw = general_purpose::STANDARD.decode(parts[3]).unwrap();
        for i in 0..raw.len() {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            let forged = format!(
                "{}:{}:{}:{}",
                parts[0],
                parts[1],
                parts[2],
                general_purpose::STANDARD.encode(&tampered)
            );
            assert!(matches!(c.decrypt(&forged), Err(StudioError::Decryption(_))));
        }
    }

    #[test]
    fn test_tampered_tag_and_nonce_fail() {
        let c = codec();
        let token = c.encrypt("hello").unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        for idx in [1usize, 2] {
            let mut raw = general_purpose::STANDARD.decode(parts[idx]).unwrap();
            raw[0] ^= 0x80;
            let mut forged: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
            forged[idx] = general_purpose::STANDARD.encode(&raw);
            assert!(c.decrypt(&forged.join(":")).is_err());
        }
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let c = codec();
        assert!(c.decrypt("").is_err());
        assert!(c.decrypt("v1:a:b").is_err());
        let token = c.encrypt("x").unwrap();
        let v2 = token.replacen("v1", "v2", 1);
        assert!(c.decrypt(&v2).is_err());
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let token = codec().encrypt("secret").unwrap();
        let other = SecretCodec::from_master("another-master");
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-1234567890abcd"), "sk-1****abcd");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("12345678"), "***");
    }
}
