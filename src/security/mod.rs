//! Credential protection.
//!
//! - [`vault`]: the encrypt/decrypt boundary used by storage load/save hooks
//! - [`redact`]: masks secrets before payloads reach logs

pub mod redact;
pub mod vault;

pub use redact::{redact, redact_str};
pub use vault::{vault_from_config, AesGcmVault, CredentialVault, PlaintextVault, ENCRYPTED_PREFIX};
