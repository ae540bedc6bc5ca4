//! Credential vault.
//!
//! Integration credentials are stored as opaque strings. The store passes
//! them through a [`CredentialVault`] on every save and load so the engine
//! only ever sees plaintext JSON credential maps.

use base64::{engine::general_purpose, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use std::sync::Arc;

use tracing::warn;

use crate::config::VaultConfig;
use crate::{RemediationError, Result};

/// Marker for values produced by [`AesGcmVault`].
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";

pub trait CredentialVault: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, stored: &str) -> Result<String>;
}

/// Pass-through vault for development databases and tests.
#[derive(Debug, Default, Clone)]
pub struct PlaintextVault;

impl CredentialVault for PlaintextVault {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, stored: &str) -> Result<String> {
        Ok(stored.to_string())
    }
}

/// AES-256-GCM vault.
///
/// Output format: `enc:v1:` + base64(nonce || ciphertext || tag). Values
/// without the prefix are treated as legacy plaintext on decrypt, so rows
/// written before encryption was enabled keep loading.
pub struct AesGcmVault {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmVault {
    pub fn new(key: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| RemediationError::Crypto("vault key must be 32 bytes".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| RemediationError::Crypto(format!("invalid vault key encoding: {}", e)))?;
        Self::new(&key)
    }
}

/// AES vault when a key is configured, plaintext otherwise.
pub fn vault_from_config(config: &VaultConfig) -> Result<Arc<dyn CredentialVault>> {
    match config.key_base64.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => Ok(Arc::new(AesGcmVault::from_base64(key)?)),
        None => {
            warn!("No vault key configured; integration credentials are stored in plaintext");
            Ok(Arc::new(PlaintextVault))
        }
    }
}

impl CredentialVault for AesGcmVault {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() || plaintext.starts_with(ENCRYPTED_PREFIX) {
            return Ok(plaintext.to_string());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| RemediationError::Crypto("nonce generation failed".to_string()))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| RemediationError::Crypto("encryption failed".to_string()))?;

        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&in_out);
        Ok(format!("{}{}", ENCRYPTED_PREFIX, general_purpose::STANDARD.encode(payload)))
    }

    fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RemediationError::Crypto(format!("invalid ciphertext encoding: {}", e)))?;
        if payload.len() < NONCE_LEN {
            return Err(RemediationError::Crypto("ciphertext too short".to_string()));
        }

        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| RemediationError::Crypto("invalid nonce".to_string()))?;
        let mut buffer = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| RemediationError::Crypto("decryption failed".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| RemediationError::Crypto(format!("decrypted value is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> AesGcmVault {
        AesGcmVault::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn encrypts_with_prefix_and_decrypts_back() {
        let vault = vault();
        let sealed = vault.encrypt(r#"{"token":"abc"}"#).unwrap();
        assert!(sealed.starts_with(ENCRYPTED_PREFIX));
        assert!(!sealed.contains("abc"));
        assert_eq!(vault.decrypt(&sealed).unwrap(), r#"{"token":"abc"}"#);
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let vault = vault();
        assert_eq!(vault.decrypt(r#"{"token":"abc"}"#).unwrap(), r#"{"token":"abc"}"#);
        assert_eq!(vault.encrypt("").unwrap(), "");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = AesGcmVault::new(&[9u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(RemediationError::Crypto(_))));
    }

    #[test]
    fn rejects_short_keys() {
        assert!(AesGcmVault::new(&[1u8; 16]).is_err());
    }
}
