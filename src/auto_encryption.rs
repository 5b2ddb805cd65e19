//! Transparent field encryption for the encrypted client.
//!
//! Given the schema map, writes to a mapped namespace have their schema
//! fields replaced by ciphertext, equality filters on deterministic fields are
//! rewritten to ciphertext, and every ciphertext value read back is
//! decrypted. Data keys are fetched from the key vault on first use and
//! cached for the life of the client.
//!
//! ## Ciphertext layout (binary subtype 06)
//! ```text
//! [ algorithm (1 byte) ][ key id (16 bytes) ][ nonce (12) ][ ciphertext + tag ]
//! ```
//! The algorithm byte and key id are bound in as associated data.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::with_deadline;
use crate::crypto;
use crate::error::FleError;
use crate::key_vault::DataKeyRecord;
use crate::keys::{DataKey, FieldKeys, MasterKey};
use crate::schema::{Algorithm, CompiledSchema, FieldSpec, SchemaMap};
use crate::store::{self, subtype, Condition, Document, DocumentStore, Filter, Namespace, Update};

const DETERMINISTIC_TAG: u8 = 1;
const RANDOM_TAG: u8 = 2;
const HEADER_LEN: usize = 1 + 16;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// KMS provider configuration: `{<provider_name>: {key: <master key>}}`.
///
/// Only local providers are supported. The master key moves in here and
/// lives as long as the encrypted client that owns these settings.
pub struct KmsProviders {
    name: String,
    key: MasterKey,
}

impl KmsProviders {
    pub fn local(name: impl Into<String>, key: MasterKey) -> Result<Self, FleError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FleError::Config("empty KMS provider name".into()));
        }
        Ok(Self { name, key })
    }

    pub fn provider_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn master_key(&self) -> &MasterKey {
        &self.key
    }
}

impl fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entry(&self.name, &"{ key: [redacted] }").finish()
    }
}

/// Options not related to keys or schemas.
#[derive(Debug, Clone)]
pub struct ExtraOptions {
    /// Path of the external schema-analysis helper the driver spawns for
    /// query planning.
    pub helper_spawn_path: PathBuf,
}

/// Auto-encryption configuration for one client.
#[derive(Debug)]
pub struct AutoEncryptionOptions {
    pub key_vault_namespace: Namespace,
    pub kms_providers: KmsProviders,
    pub schema_map: SchemaMap,
    pub extra_options: ExtraOptions,
}

// ---------------------------------------------------------------------------
// Encrypter
// ---------------------------------------------------------------------------

pub(crate) struct AutoEncrypter {
    key_vault: Namespace,
    kms: KmsProviders,
    schema_map: SchemaMap,
    /// Connection used for key-vault reads; vault reads are never encrypted.
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    keys: DashMap<Uuid, Arc<FieldKeys>>,
}

impl AutoEncrypter {
    pub(crate) fn new(
        options: AutoEncryptionOptions,
        store: Arc<dyn DocumentStore>,
        timeout: Duration,
    ) -> Result<Self, FleError> {
        if options.extra_options.helper_spawn_path.as_os_str().is_empty() {
            return Err(FleError::Config("empty helper spawn path".into()));
        }
        if options.schema_map.contains_key(&options.key_vault_namespace) {
            return Err(FleError::Config(format!(
                "key vault {} cannot be an auto-encrypted namespace",
                options.key_vault_namespace
            )));
        }
        for (ns, schema) in &options.schema_map {
            if schema.namespace() != ns {
                return Err(FleError::Config(format!(
                    "schema for {} registered under {ns}",
                    schema.namespace()
                )));
            }
            schema.key_id().to_uuid()?;
        }

        info!(
            key_vault = %options.key_vault_namespace,
            kms_provider = options.kms_providers.provider_name(),
            namespaces = options.schema_map.len(),
            helper = %options.extra_options.helper_spawn_path.display(),
            "auto-encryption enabled"
        );
        Ok(Self {
            key_vault: options.key_vault_namespace,
            kms: options.kms_providers,
            schema_map: options.schema_map,
            store,
            timeout,
            keys: DashMap::new(),
        })
    }

    fn schema(&self, ns: &Namespace) -> Option<&CompiledSchema> {
        self.schema_map.get(ns)
    }

    /// Subkeys of data key `id`, fetched and unwrapped on first use.
    async fn field_keys(&self, id: Uuid) -> Result<Arc<FieldKeys>, FleError> {
        if let Some(keys) = self.keys.get(&id) {
            return Ok(Arc::clone(&keys));
        }

        let filter = Filter::eq("_id", store::binary(id.as_bytes(), subtype::UUID));
        let found = with_deadline(
            self.timeout,
            "fetch data key",
            self.store.find(&self.key_vault, &filter, Some(1)),
        )
        .await?;
        let doc = found
            .into_iter()
            .next()
            .ok_or_else(|| FleError::Query(format!("data key {id} not found in {}", self.key_vault)))?;
        let record = DataKeyRecord::from_document(&doc)?;
        if record.provider != self.kms.provider_name() {
            return Err(FleError::Config(format!(
                "data key {id} is wrapped by KMS provider '{}'",
                record.provider
            )));
        }

        let dek = DataKey::unwrap(self.kms.master_key(), id.as_bytes(), &record.key_material)?;
        let keys = Arc::new(dek.field_keys()?);
        debug!(key_id = %record.key_id(), "cached data encryption key");
        Ok(Arc::clone(self.keys.entry(id).or_insert(keys).value()))
    }

    async fn encrypt_value(&self, schema: &CompiledSchema, spec: &FieldSpec, value: &Value) -> Result<Value, FleError> {
        if !spec.bson_type.accepts(value) {
            return Err(FleError::Query(format!(
                "value of field '{}' is not of bsonType '{}'",
                spec.name,
                spec.bson_type.as_str()
            )));
        }
        let key_id = schema.key_id().to_uuid()?;
        let keys = self.field_keys(key_id).await?;

        let tag = match spec.algorithm {
            Algorithm::Deterministic => DETERMINISTIC_TAG,
            Algorithm::Random => RANDOM_TAG,
        };
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.push(tag);
        header.extend_from_slice(key_id.as_bytes());

        let plaintext = serde_json::to_vec(value)?;
        let sealed = match spec.algorithm {
            Algorithm::Deterministic => {
                crypto::encrypt_deterministic(keys.enc.as_bytes(), keys.mac.as_bytes(), &header, &plaintext)?
            }
            Algorithm::Random => crypto::encrypt(keys.enc.as_bytes(), &header, &plaintext)?,
        };

        let mut blob = header;
        blob.extend_from_slice(&sealed);
        Ok(store::binary(&blob, subtype::ENCRYPTED))
    }

    async fn decrypt_value(&self, blob: &[u8]) -> Result<Value, FleError> {
        if blob.len() <= HEADER_LEN || !matches!(blob[0], DETERMINISTIC_TAG | RANDOM_TAG) {
            return Err(FleError::DecryptionFailure);
        }
        let key_id = Uuid::from_slice(&blob[1..HEADER_LEN]).map_err(|_| FleError::DecryptionFailure)?;
        let keys = self.field_keys(key_id).await?;
        let plaintext = crypto::decrypt(keys.enc.as_bytes(), &blob[..HEADER_LEN], &blob[HEADER_LEN..])?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Encrypt the schema fields of a document bound for `ns`.
    pub(crate) async fn encrypt_document(&self, ns: &Namespace, mut doc: Document) -> Result<Document, FleError> {
        let Some(schema) = self.schema(ns) else {
            return Ok(doc);
        };
        for spec in schema.fields() {
            if let Some(value) = doc.get(spec.name.as_ref()) {
                if value.is_null() {
                    continue;
                }
                let encrypted = self.encrypt_value(schema, spec, value).await?;
                doc.insert(spec.name.to_string(), encrypted);
            }
        }
        Ok(doc)
    }

    /// Rewrite equality conditions on deterministic fields to ciphertext.
    /// Filtering on a random field is rejected.
    pub(crate) async fn encrypt_filter(&self, ns: &Namespace, filter: &Filter) -> Result<Filter, FleError> {
        let Some(schema) = self.schema(ns) else {
            return Ok(filter.clone());
        };
        let mut conditions = Vec::with_capacity(filter.conditions().len());
        for condition in filter.conditions() {
            let rewritten = match (condition, schema.field(condition.field())) {
                (Condition::Eq(field, value), Some(spec)) if !value.is_null() => match spec.algorithm {
                    Algorithm::Deterministic => {
                        Condition::Eq(field.clone(), self.encrypt_value(schema, spec, value).await?)
                    }
                    Algorithm::Random => {
                        return Err(FleError::Query(format!(
                            "cannot query on randomly encrypted field '{field}'"
                        )))
                    }
                },
                _ => condition.clone(),
            };
            conditions.push(rewritten);
        }
        Ok(Filter::from_conditions(conditions))
    }

    pub(crate) async fn encrypt_update(&self, ns: &Namespace, update: &Update) -> Result<Update, FleError> {
        let Some(schema) = self.schema(ns) else {
            return Ok(update.clone());
        };
        if let Some(field) = update.add_to_set.keys().find(|f| schema.field(f).is_some()) {
            return Err(FleError::Query(format!(
                "cannot apply $addToSet to encrypted field '{field}'"
            )));
        }
        let mut out = update.clone();
        for (field, value) in update.set.iter() {
            if let Some(spec) = schema.field(field) {
                if !value.is_null() {
                    out.set.insert(field.clone(), self.encrypt_value(schema, spec, value).await?);
                }
            }
        }
        Ok(out)
    }

    /// Decrypt every ciphertext value in `doc`, at any depth.
    pub(crate) async fn decrypt_document(&self, doc: Document) -> Result<Document, FleError> {
        let mut out = Document::new();
        for (field, value) in doc {
            out.insert(field, self.decrypt_tree(value).await?);
        }
        Ok(out)
    }

    fn decrypt_tree<'a>(
        &'a self,
        value: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, FleError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some((bytes, sub)) = store::as_binary(&value) {
                if sub == subtype::ENCRYPTED {
                    return self.decrypt_value(&bytes).await;
                }
                return Ok(value);
            }
            match value {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.decrypt_tree(item).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => Ok(Value::Object(self.decrypt_document(map).await?)),
                other => Ok(other),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::key_vault::KeyId;
    use crate::schema;
    use serde_json::json;

    #[test]
    fn kms_debug_hides_key() {
        let kms = KmsProviders::local("local", MasterKey::from_bytes([1; 96])).unwrap();
        assert_eq!(format!("{kms:?}"), r#"{"local": "{ key: [redacted] }"}"#);
        assert!(KmsProviders::local("", MasterKey::from_bytes([1; 96])).is_err());
    }

    #[tokio::test]
    async fn random_field_filter_is_rejected() {
        let store = MemoryStore::new();
        let vault_ns: Namespace = "encryption.__keyVault".parse().unwrap();
        let records: Namespace = "records.subjects".parse().unwrap();

        let key_id = KeyId::from_uuid(&Uuid::new_v4());
        let compiled = schema::compile(
            &key_id,
            &records,
            &[FieldSpec::deterministic("subjectId"), FieldSpec::random("name")],
        )
        .unwrap();
        let options = AutoEncryptionOptions {
            key_vault_namespace: vault_ns,
            kms_providers: KmsProviders::local("local", MasterKey::from_bytes([2; 96])).unwrap(),
            schema_map: SchemaMap::from([(records.clone(), compiled)]),
            extra_options: ExtraOptions {
                helper_spawn_path: PathBuf::from("/usr/local/bin/mongocryptd"),
            },
        };
        let enc = AutoEncrypter::new(options, Arc::new(store), Duration::from_secs(1)).unwrap();

        let err = enc
            .encrypt_filter(&records, &Filter::eq("name", "Jane Doe"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleError::Query(_)));

        // Non-schema fields pass through untouched without touching the vault.
        let plain = enc
            .encrypt_filter(&records, &Filter::eq("city", json!("Boston")))
            .await
            .unwrap();
        assert_eq!(plain, Filter::eq("city", "Boston"));
    }
}
