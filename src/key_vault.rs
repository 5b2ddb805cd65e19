//! Data-encryption key lifecycle in the key-vault collection.
//!
//! One key per alias, created once and never updated or deleted here. The
//! unique partial index on `keyAltNames` is the only thing that stops two
//! processes from both creating a key for the same alias; the
//! find-then-create sequence itself is not locked.
//!
//! Rotating or deleting a key is a manual operator task: delete the key
//! document only after every record encrypted under it has been rewritten.

use std::fmt;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, KeyAuditEvent, KeyAuditRecord};
use crate::auto_encryption::KmsProviders;
use crate::client::ClientHandle;
use crate::error::FleError;
use crate::keys::DataKey;
use crate::store::{self, subtype, Document, Filter, IndexModel, Namespace};

/// Field holding the aliases of a key record.
pub const ALIAS_FIELD: &str = "keyAltNames";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Base64 encoding of a data key's 16-byte `_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    /// Wrap an already-encoded id. Not validated; see [`KeyId::to_uuid`].
    pub fn new(base64: impl Into<String>) -> Self {
        Self(base64.into())
    }

    pub fn from_uuid(id: &Uuid) -> Self {
        Self(STANDARD.encode(id.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into the binary id. Fails with `FleError::Config` unless the
    /// string is base64 of exactly 16 bytes.
    pub fn to_uuid(&self) -> Result<Uuid, FleError> {
        let bytes = STANDARD
            .decode(&self.0)
            .map_err(|_| FleError::Config(format!("key id '{}' is not base64", self.0)))?;
        Uuid::from_slice(&bytes).map_err(|_| FleError::Config(format!("key id '{}' is not 16 bytes", self.0)))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-chosen name of one logical data key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyAlias(String);

impl KeyAlias {
    pub fn new(alias: impl Into<String>) -> Result<Self, FleError> {
        let alias = alias.into();
        if alias.trim().is_empty() {
            return Err(FleError::Config("empty key alias".into()));
        }
        Ok(Self(alias))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether [`KeyVaultClient::find_or_create_key`] found or created the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Found,
    Created,
}

// ---------------------------------------------------------------------------
// Key record
// ---------------------------------------------------------------------------

/// A data-encryption key document as stored in the vault.
#[derive(Clone, PartialEq)]
pub struct DataKeyRecord {
    pub id: Uuid,
    pub alt_names: Vec<String>,
    /// The key wrapped by the master key.
    pub(crate) key_material: Vec<u8>,
    /// Name of the KMS provider that wrapped the key.
    pub provider: String,
    pub creation_date: DateTime<Utc>,
    pub update_date: DateTime<Utc>,
    pub status: i64,
}

impl fmt::Debug for DataKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKeyRecord")
            .field("id", &self.key_id())
            .field("alt_names", &self.alt_names)
            .field("provider", &self.provider)
            .field("creation_date", &self.creation_date)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl DataKeyRecord {
    pub fn key_id(&self) -> KeyId {
        KeyId::from_uuid(&self.id)
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("_id".into(), store::binary(self.id.as_bytes(), subtype::UUID));
        doc.insert(ALIAS_FIELD.into(), json!(self.alt_names));
        doc.insert("keyMaterial".into(), store::binary(&self.key_material, subtype::GENERIC));
        doc.insert("creationDate".into(), json!({ "$date": self.creation_date.to_rfc3339() }));
        doc.insert("updateDate".into(), json!({ "$date": self.update_date.to_rfc3339() }));
        doc.insert("status".into(), json!(self.status));
        doc.insert("masterKey".into(), json!({ "provider": self.provider }));
        doc
    }

    pub(crate) fn from_document(doc: &Document) -> Result<Self, FleError> {
        let malformed = |what: &str| FleError::Query(format!("malformed key document: {what}"));

        let (id_bytes, _) = doc.get("_id").and_then(store::as_binary).ok_or_else(|| malformed("_id"))?;
        let id = Uuid::from_slice(&id_bytes).map_err(|_| malformed("_id length"))?;
        let (key_material, _) = doc
            .get("keyMaterial")
            .and_then(store::as_binary)
            .ok_or_else(|| malformed("keyMaterial"))?;
        let alt_names = doc
            .get(ALIAS_FIELD)
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let provider = doc
            .get("masterKey")
            .and_then(|m| m.get("provider"))
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("masterKey.provider"))?
            .to_string();
        let date = |field: &str| -> Result<DateTime<Utc>, FleError> {
            doc.get(field)
                .and_then(|v| v["$date"].as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .ok_or_else(|| malformed(field))
        };

        Ok(Self {
            id,
            alt_names,
            key_material,
            provider,
            creation_date: date("creationDate")?,
            update_date: date("updateDate")?,
            status: doc.get("status").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Manages data keys in one key-vault namespace.
///
/// Always backed by a plaintext client: the vault is never the thing being
/// auto-encrypted.
#[derive(Clone)]
pub struct KeyVaultClient {
    client: ClientHandle,
    namespace: Namespace,
    audit: Option<Arc<Mutex<AuditLog>>>,
}

impl KeyVaultClient {
    pub fn new(client: ClientHandle, namespace: Namespace) -> Result<Self, FleError> {
        if client.is_encrypted() {
            return Err(FleError::Config(
                "the key vault must be accessed through a plaintext client".into(),
            ));
        }
        Ok(Self {
            client,
            namespace,
            audit: None,
        })
    }

    /// Record key-lifecycle events into `log`.
    pub fn with_audit(mut self, log: Arc<Mutex<AuditLog>>) -> Self {
        self.audit = Some(log);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The unique partial alias index.
    pub fn alias_index() -> IndexModel {
        IndexModel::ascending(ALIAS_FIELD)
            .unique()
            .partial(Filter::exists(ALIAS_FIELD))
    }

    /// Create the unique alias index. Safe on every startup: an identical
    /// index is left untouched.
    pub async fn ensure_alias_index(&self) -> Result<(), FleError> {
        let name = self.client.create_index(&self.namespace, Self::alias_index()).await?;
        info!(namespace = %self.namespace, index = %name, "key vault alias index ready");
        Ok(())
    }

    /// Id of the first key carrying `alias`.
    pub async fn find_key_by_alias(&self, alias: &KeyAlias) -> Result<Option<KeyId>, FleError> {
        let found = self
            .client
            .find_one(&self.namespace, &Filter::eq(ALIAS_FIELD, alias.as_str()))
            .await?;
        found
            .map(|doc| DataKeyRecord::from_document(&doc).map(|r| r.key_id()))
            .transpose()
    }

    /// The key record with id `id`.
    pub async fn find_key_by_id(&self, id: &KeyId) -> Result<Option<DataKeyRecord>, FleError> {
        let uuid = id.to_uuid()?;
        let filter = Filter::eq("_id", store::binary(uuid.as_bytes(), subtype::UUID));
        self.client
            .find_one(&self.namespace, &filter)
            .await?
            .map(|doc| DataKeyRecord::from_document(&doc))
            .transpose()
    }

    /// Every key record in the vault.
    pub async fn list_keys(&self) -> Result<Vec<DataKeyRecord>, FleError> {
        self.client
            .find(&self.namespace, &Filter::new(), None)
            .await?
            .iter()
            .map(DataKeyRecord::from_document)
            .collect()
    }

    /// Create a new data key for `alias`, wrapped by the KMS provider's
    /// master key.
    ///
    /// The caller must first check [`find_key_by_alias`](Self::find_key_by_alias).
    /// With the alias index in place a second key for the same alias fails
    /// with `FleError::DuplicateKey`.
    pub async fn create_key(&self, kms: &KmsProviders, alias: &KeyAlias) -> Result<KeyId, FleError> {
        let id = Uuid::new_v4();
        let dek = DataKey::generate()?;
        let key_material = dek.wrap(kms.master_key(), id.as_bytes())?;
        drop(dek);

        let now = Utc::now();
        let record = DataKeyRecord {
            id,
            alt_names: vec![alias.to_string()],
            key_material,
            provider: kms.provider_name().to_string(),
            creation_date: now,
            update_date: now,
            status: 0,
        };
        self.client
            .insert_one(&self.namespace, record.to_document())
            .await?;

        let key_id = record.key_id();
        info!(namespace = %self.namespace, %alias, %key_id, "created data encryption key");
        Ok(key_id)
    }

    /// The check-then-create sequence.
    ///
    /// If a concurrent process wins the race, the alias index rejects this
    /// process's insert; the conflict is logged and the whole sequence runs
    /// once more, which then finds the winner's key. Two keys already sharing
    /// an alias is never resolved here.
    pub async fn find_or_create_key(
        &self,
        kms: &KmsProviders,
        alias: &KeyAlias,
    ) -> Result<(KeyId, KeyOrigin), FleError> {
        let mut retried = false;
        loop {
            let existing = self
                .client
                .find(&self.namespace, &Filter::eq(ALIAS_FIELD, alias.as_str()), Some(2))
                .await?;
            match existing.as_slice() {
                [] => {}
                [doc] => {
                    let key_id = DataKeyRecord::from_document(doc)?.key_id();
                    info!(namespace = %self.namespace, %alias, %key_id, "found existing data encryption key");
                    self.record_event(KeyAuditEvent::Found, alias, Some(&key_id));
                    return Ok((key_id, KeyOrigin::Found));
                }
                many => {
                    error!(
                        namespace = %self.namespace,
                        %alias,
                        keys = many.len(),
                        "alias maps to more than one data key; refusing to choose"
                    );
                    self.record_event(KeyAuditEvent::Divergent, alias, None);
                    return Err(FleError::AliasConflict {
                        alias: alias.to_string(),
                        keys: many.len(),
                    });
                }
            }

            match self.create_key(kms, alias).await {
                Ok(key_id) => {
                    self.record_event(KeyAuditEvent::Created, alias, Some(&key_id));
                    return Ok((key_id, KeyOrigin::Created));
                }
                Err(err @ FleError::DuplicateKey { .. }) if !retried => {
                    error!(
                        namespace = %self.namespace,
                        %alias,
                        error = %err,
                        "alias index rejected a concurrent key creation"
                    );
                    self.record_event(KeyAuditEvent::DuplicateRejected, alias, None);
                    warn!(%alias, "retrying key lookup after alias conflict");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record_event(&self, event: KeyAuditEvent, alias: &KeyAlias, key_id: Option<&KeyId>) {
        if let Some(log) = &self.audit {
            let record = KeyAuditRecord::new(
                event,
                alias.as_str(),
                key_id.map(KeyId::as_str),
                &self.namespace.to_string(),
            );
            log.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .append(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_roundtrips_through_uuid() {
        let uuid = Uuid::new_v4();
        let id = KeyId::from_uuid(&uuid);
        assert_eq!(id.to_uuid().unwrap(), uuid);
        assert!(KeyId::new("abc123").to_uuid().is_err());
    }

    #[test]
    fn record_document_roundtrip() {
        let now = Utc::now();
        let record = DataKeyRecord {
            id: Uuid::new_v4(),
            alt_names: vec!["patient-key-v1".into()],
            key_material: vec![9; 40],
            provider: "local".into(),
            creation_date: now,
            update_date: now,
            status: 0,
        };
        let back = DataKeyRecord::from_document(&record.to_document()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn empty_alias_is_rejected() {
        assert!(KeyAlias::new("  ").is_err());
    }
}
