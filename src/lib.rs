//! # ringvault
//!
//! Envelope encryption over keyrings.
//!
//! Caller data is encrypted with a per-keyring data encryption key (DEK).
//! DEKs are stored in an object store only in wrapped form, sealed by a key
//! encryption key (KEK) from an operator-supplied master key set. Rotating
//! the master key rewraps stored DEKs without touching caller ciphertext.
//!
//! ```text
//! master keys (KEKs) ──wrap──> keyring/{ring}/{dekId} ──encrypt──> caller data
//! ```
//!
//! ## Public API
//!
//! [`Vault`] is the operation surface: `create_dek`, `encrypt`,
//! `encrypt_bulk`, `decrypt`, `reencrypt` and `roll_deks`. Everything it
//! needs is passed in at construction through [`VaultConfig`] (or a
//! [`KekSet`]) and an [`ObjectStore`].

pub mod audit;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod keys;
pub mod storage;
pub mod vault;

pub use audit::{
    AuditLog, AuditOperation, AuditRecord, AuditSink, FileAuditSink, FileAuditWriter,
};
pub use cache::{CacheConfig, CacheHit};
pub use config::VaultConfig;
pub use envelope::{Algorithm, Encrypted, EncryptedDataEncryptionKey};
pub use error::{ErrorKind, VaultError};
pub use keyring::{Keyring, RollSummary, RolledRecord};
pub use keys::{DataEncryptionKey, KekSet, KeyEncryptionKey};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore, StorageError};
pub use vault::{EncryptResponse, Vault};

/// Generate a new random master key with the given id.
///
/// Pass the result of [`KeyEncryptionKey::encode`] to the service through
/// [`VaultConfig::master_keys`]. In production, master keys should come from
/// a dedicated secret store rather than being generated in-process.
pub fn generate_master_key(id: impl Into<String>) -> Result<KeyEncryptionKey, VaultError> {
    KeyEncryptionKey::generate(id)
}
