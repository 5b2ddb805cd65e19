//! # fieldvault
//!
//! Client-side field-level encryption for document stores.
//!
//! Sensitive fields of a record are encrypted by the store client before they
//! leave the process. The crate manages the data-encryption key kept in a
//! key-vault collection, compiles the per-collection encryption schema, owns
//! the two store clients (one encrypting, one plaintext) and routes every
//! record operation through the right one.
//!
//! ## Public API
//!
//! Applications talk to [`RoutingDataAccess`] (or the [`PatientService`]
//! built on it) over a shared [`DualClientProvider`]. The key vault, schema
//! compiler and store traits are public for operators and alternative
//! backends. The cryptographic primitives are `pub(crate)`.

// Module declarations.
pub mod audit;
pub mod auto_encryption;
pub mod backends;
pub mod client;
pub mod config;
pub(crate) mod crypto;
pub mod error;
pub mod key_material;
pub mod key_vault;
pub(crate) mod keys;
pub mod provider;
pub mod record;
pub mod routing;
pub mod schema;
pub mod store;

pub use audit::{AuditLog, AuditSink, FileAuditSink, KeyAuditEvent, KeyAuditRecord};
pub use auto_encryption::{AutoEncryptionOptions, ExtraOptions, KmsProviders};
pub use client::{ClientHandle, ClientSettings};
pub use config::FleConfig;
pub use error::{FleError, FleResult, ProvisioningStage};
pub use key_material::{read_master_key, write_master_key};
pub use key_vault::{DataKeyRecord, KeyAlias, KeyId, KeyOrigin, KeyVaultClient};
pub use keys::{MasterKey, MASTER_KEY_LEN};
pub use provider::DualClientProvider;
pub use record::{AuxiliaryEvent, Condition, ConditionEvent, EventStream, Patient, Record};
pub use routing::{PatientService, RoutingDataAccess};
pub use schema::{Algorithm, BsonType, CompiledSchema, FieldSpec, SchemaMap};
pub use store::{Document, DocumentStore, Filter, IndexModel, Namespace, StoreConnector, Update};

/// Generate a fresh local master key.
///
/// Store the result with [`write_master_key`] and keep the file out of the
/// data store. In production the master key should come from a dedicated KMS
/// rather than a local file.
pub fn generate_master_key() -> FleResult<MasterKey> {
    MasterKey::generate()
}
