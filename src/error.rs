//! Error types for fieldvault.
//!
//! Every error variant is a distinct failure mode in the key lifecycle or the
//! data-access path. Messages are intentionally minimal: they say *what*
//! failed without echoing key material or plaintext field values.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The stage of the encrypted-client provisioning chain that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStage {
    ReadMasterKey,
    EnsureAliasIndex,
    FindOrCreateKey,
    CompileSchema,
    Connect,
}

impl fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadMasterKey => "read master key",
            Self::EnsureAliasIndex => "ensure alias index",
            Self::FindOrCreateKey => "find or create data key",
            Self::CompileSchema => "compile encryption schema",
            Self::Connect => "connect encrypted client",
        };
        f.write_str(name)
    }
}

/// The single error type for all fieldvault operations.
#[derive(Debug, Error)]
pub enum FleError {
    /// The master key file is missing, unreadable, or not exactly the
    /// required length.
    #[error("master key at {path:?} unusable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration value is empty or malformed (empty key id, bad
    /// namespace, schema that does not match a record type).
    #[error("configuration error: {0}")]
    Config(String),

    /// A step of the encrypted-client provisioning chain failed.
    #[error("provisioning failed at stage '{stage}': {source}")]
    Provisioning {
        stage: ProvisioningStage,
        #[source]
        source: Box<FleError>,
    },

    /// The store rejected a query or write.
    #[error("query error: {0}")]
    Query(String),

    /// A write violated a unique index.
    #[error("duplicate key on {namespace} index '{index}'")]
    DuplicateKey { namespace: String, index: String },

    /// More than one data-encryption key carries the same alias. Never
    /// resolved automatically.
    #[error("alias '{alias}' maps to {keys} data keys; operator intervention required")]
    AliasConflict { alias: String, keys: usize },

    /// An I/O deadline was exceeded. Retryable.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A record could not be converted to or from its document form.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A cryptographic key was invalid (wrong length, malformed id, etc.).
    #[error("invalid key")]
    InvalidKey,

    /// Encryption failed. The underlying `ring` operation returned an error.
    #[error("encryption failed")]
    EncryptionFailure,

    /// Decryption failed: wrong key, tampered ciphertext, or a corrupted
    /// GCM tag.
    #[error("decryption failed")]
    DecryptionFailure,

    /// Key derivation (HKDF) failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,
}

impl FleError {
    /// Wrap `self` as a provisioning failure at `stage`.
    pub(crate) fn at_stage(self, stage: ProvisioningStage) -> Self {
        Self::Provisioning {
            stage,
            source: Box::new(self),
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only deadline failures are retryable; provisioning failures are
    /// retryable when the stage that failed timed out.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Provisioning { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The provisioning stage this error was raised at, if any.
    pub fn stage(&self) -> Option<ProvisioningStage> {
        match self {
            Self::Provisioning { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type FleResult<T> = Result<T, FleError>;
