//! Error types for ringvault.
//!
//! Every error variant is a distinct failure mode in the key hierarchy.
//! Error messages are minimal: they signal *what* failed
//! and *where* (operation, ring, key id) without ever carrying key bytes
//! or plaintext.

/// The typed failure classification callers match on.
///
/// [`VaultError::kind`] looks through context wrappers, so a caller always
/// sees the underlying cause regardless of how deep it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A storage read found nothing under the requested key.
    ObjectNotFound,
    /// An envelope names a KEK or DEK this process does not hold.
    UnknownEncryptionKey,
    /// AEAD authentication failed: wrong key, wrong nonce or tampered data.
    DecryptionFailed,
    /// AEAD sealing failed.
    EncryptionFailed,
    /// A stored record or key message could not be encoded or decoded.
    EncodingError,
    /// A caller-supplied envelope could not be decoded.
    InvalidEnvelope,
    /// The object store failed or timed out. Safe to retry.
    StorageUnavailable,
    /// Key material had the wrong shape.
    InvalidKey,
    /// The system random number generator failed.
    RandomnessFailure,
    /// The ring id is empty or contains a path separator.
    InvalidRingId,
    /// The vault configuration is unusable.
    Config,
}

/// The single error type for all ringvault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Nothing is stored under this object key.
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    /// The referenced key id is not known to this process.
    #[error("unknown encryption key: {key_id}")]
    UnknownEncryptionKey { key_id: String },

    /// Authentication failed. No plaintext is ever returned alongside this.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Sealing failed inside the AEAD implementation.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Serialization or deserialization of a stored message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A caller-supplied envelope is not valid base64 or not a valid message.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The object store could not complete the call.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Key material was malformed.
    #[error("invalid key")]
    InvalidKey,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Ring ids must be non-empty and free of `/`.
    #[error("invalid ring id: {0:?}")]
    InvalidRingId(String),

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation failed for a specific ring.
    #[error("{operation} failed for ring {ring_id}: {source}")]
    Context {
        operation: &'static str,
        ring_id: String,
        #[source]
        source: Box<VaultError>,
    },

    /// One item of a bulk request failed. Items after it were not processed.
    #[error("bulk item {index} failed: {source}")]
    BulkItem {
        index: usize,
        #[source]
        source: Box<VaultError>,
    },
}

impl VaultError {
    /// Wrap this error with the operation name and ring id it occurred in.
    pub fn context(self, operation: &'static str, ring_id: &str) -> Self {
        Self::Context {
            operation,
            ring_id: ring_id.to_string(),
            source: Box::new(self),
        }
    }

    /// The underlying failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            Self::UnknownEncryptionKey { .. } => ErrorKind::UnknownEncryptionKey,
            Self::DecryptionFailed => ErrorKind::DecryptionFailed,
            Self::EncryptionFailed => ErrorKind::EncryptionFailed,
            Self::Encoding(_) => ErrorKind::EncodingError,
            Self::InvalidEnvelope(_) => ErrorKind::InvalidEnvelope,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::InvalidKey => ErrorKind::InvalidKey,
            Self::RandomnessFailure => ErrorKind::RandomnessFailure,
            Self::InvalidRingId(_) => ErrorKind::InvalidRingId,
            Self::Config(_) => ErrorKind::Config,
            Self::Context { source, .. } | Self::BulkItem { source, .. } => source.kind(),
        }
    }

    /// Whether the caller may reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_looks_through_wrappers() {
        let err = VaultError::DecryptionFailed.context("decrypt", "tenant_1");
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);

        let bulk = VaultError::BulkItem {
            index: 3,
            source: Box::new(VaultError::StorageUnavailable("timeout".into()).context("encrypt", "r")),
        };
        assert_eq!(bulk.kind(), ErrorKind::StorageUnavailable);
        assert!(bulk.is_retryable());
        assert!(bulk.to_string().contains("bulk item 3"));
    }

    #[test]
    fn context_message_names_operation_and_ring() {
        let err = VaultError::ObjectNotFound {
            key: "keyring/tenant_1/LATEST".into(),
        }
        .context("get_key", "tenant_1");
        let msg = err.to_string();
        assert!(msg.contains("get_key"));
        assert!(msg.contains("tenant_1"));
        assert!(!err.is_retryable());
    }
}
