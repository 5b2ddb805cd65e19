//! The two process-wide store clients.
//!
//! [`DualClientProvider`] is an explicit context object: build one at startup
//! and share it (usually behind an `Arc`). Each slot is initialised at most
//! once, on first use, under `tokio::sync::OnceCell`. Concurrent first
//! callers wait for the single initialiser instead of racing it. A failed
//! initialisation leaves the slot empty, so the next call starts over.

use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::audit::{AuditLog, AuditSink, KeyAuditRecord};
use crate::auto_encryption::{AutoEncryptionOptions, ExtraOptions, KmsProviders};
use crate::client::{ClientHandle, ClientSettings};
use crate::config::FleConfig;
use crate::error::{FleError, ProvisioningStage};
use crate::key_material::read_master_key;
use crate::key_vault::{KeyId, KeyOrigin, KeyVaultClient};
use crate::schema::{self, CompiledSchema, FieldSpec, SchemaMap};
use crate::store::{Namespace, StoreConnector};

/// Everything the encrypted slot produced.
struct EncryptedSlot {
    client: ClientHandle,
    schema: CompiledSchema,
    origin: KeyOrigin,
}

pub struct DualClientProvider {
    config: FleConfig,
    records_namespace: Namespace,
    key_vault_namespace: Namespace,
    fields: Vec<FieldSpec>,
    connector: Arc<dyn StoreConnector>,
    plaintext: OnceCell<ClientHandle>,
    encrypted: OnceCell<EncryptedSlot>,
    audit: Arc<Mutex<AuditLog>>,
}

impl DualClientProvider {
    /// `fields` is the encrypted-field table of the records collection named
    /// in `config`.
    pub fn new(
        config: FleConfig,
        connector: Arc<dyn StoreConnector>,
        fields: Vec<FieldSpec>,
    ) -> Result<Self, FleError> {
        config.validate()?;
        Ok(Self {
            records_namespace: config.records_namespace()?,
            key_vault_namespace: config.key_vault_namespace()?,
            config,
            fields,
            connector,
            plaintext: OnceCell::new(),
            encrypted: OnceCell::new(),
            audit: Arc::new(Mutex::new(AuditLog::new())),
        })
    }

    pub fn config(&self) -> &FleConfig {
        &self.config
    }

    /// Namespace covered by the encryption schema.
    pub fn records_namespace(&self) -> &Namespace {
        &self.records_namespace
    }

    pub fn key_vault_namespace(&self) -> &Namespace {
        &self.key_vault_namespace
    }

    /// The encrypted-field table this provider compiles.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// The compiled schema, once the encrypted client exists.
    pub fn schema(&self) -> Option<&CompiledSchema> {
        self.encrypted.get().map(|slot| &slot.schema)
    }

    /// Id and origin of the data key, once the encrypted client exists.
    pub fn data_key(&self) -> Option<(&KeyId, KeyOrigin)> {
        self.encrypted.get().map(|slot| (slot.schema.key_id(), slot.origin))
    }

    /// Forward key-lifecycle events to `sink`.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit_log().add_forward_sink(sink);
    }

    /// Snapshot of the key-lifecycle events recorded so far.
    pub fn key_events(&self) -> Vec<KeyAuditRecord> {
        self.audit_log().iter().cloned().collect()
    }

    fn audit_log(&self) -> std::sync::MutexGuard<'_, AuditLog> {
        self.audit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settings(&self) -> ClientSettings {
        ClientSettings {
            connection_string: self.config.connection_string.clone(),
            database: self.config.database.clone(),
            timeout: self.config.operation_timeout,
            auto_encryption: None,
        }
    }

    /// The plaintext client. Connects on first call.
    pub async fn plaintext(&self) -> Result<ClientHandle, FleError> {
        self.plaintext
            .get_or_try_init(|| async {
                info!(database = %self.config.database, "creating plaintext client");
                ClientHandle::connect(self.connector.as_ref(), self.settings()).await
            })
            .await
            .cloned()
    }

    /// The key-vault client, over the plaintext connection.
    pub async fn key_vault(&self) -> Result<KeyVaultClient, FleError> {
        let client = self.plaintext().await?;
        Ok(KeyVaultClient::new(client, self.key_vault_namespace.clone())?.with_audit(Arc::clone(&self.audit)))
    }

    /// The auto-encrypting client. Provisions the data key and schema on
    /// first call.
    ///
    /// Failures are reported as `FleError::Provisioning` naming the stage and
    /// are not cached; there is no fallback to the plaintext client.
    pub async fn encrypted(&self) -> Result<ClientHandle, FleError> {
        match self.encrypted.get_or_try_init(|| self.provision()).await {
            Ok(slot) => Ok(slot.client.clone()),
            Err(err) => {
                error!(stage = ?err.stage(), error = %err, "encrypted client provisioning failed");
                Err(err)
            }
        }
    }

    async fn provision(&self) -> Result<EncryptedSlot, FleError> {
        use ProvisioningStage::*;

        info!(
            namespace = %self.records_namespace,
            key_vault = %self.key_vault_namespace,
            "creating encrypted client"
        );

        let alias = self.config.alias().map_err(|e| e.at_stage(FindOrCreateKey))?;
        let master = read_master_key(&self.config.master_key_path).map_err(|e| e.at_stage(ReadMasterKey))?;
        let kms = KmsProviders::local(self.config.kms_provider.clone(), master)
            .map_err(|e| e.at_stage(ReadMasterKey))?;

        let vault = self.key_vault().await.map_err(|e| e.at_stage(EnsureAliasIndex))?;
        vault
            .ensure_alias_index()
            .await
            .map_err(|e| e.at_stage(EnsureAliasIndex))?;

        let (key_id, origin) = vault
            .find_or_create_key(&kms, &alias)
            .await
            .map_err(|e| e.at_stage(FindOrCreateKey))?;

        let schema = schema::compile(&key_id, &self.records_namespace, &self.fields)
            .map_err(|e| e.at_stage(CompileSchema))?;

        let settings = ClientSettings {
            auto_encryption: Some(AutoEncryptionOptions {
                key_vault_namespace: self.key_vault_namespace.clone(),
                kms_providers: kms,
                schema_map: SchemaMap::from([(self.records_namespace.clone(), schema.clone())]),
                extra_options: ExtraOptions {
                    helper_spawn_path: self.config.helper_spawn_path.clone(),
                },
            }),
            ..self.settings()
        };
        let client = ClientHandle::connect(self.connector.as_ref(), settings)
            .await
            .map_err(|e| e.at_stage(Connect))?;

        info!(%key_id, ?origin, "encrypted client ready");
        Ok(EncryptedSlot {
            client,
            schema,
            origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryConnector;
    use crate::keys::MASTER_KEY_LEN;
    use std::io::Write;

    fn provider_with_key(file: &tempfile::NamedTempFile) -> DualClientProvider {
        let config = FleConfig {
            master_key_path: file.path().to_path_buf(),
            ..FleConfig::default()
        };
        DualClientProvider::new(
            config,
            Arc::new(MemoryConnector::default()),
            vec![FieldSpec::deterministic("patientId")],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn plaintext_slot_is_memoized() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let provider = provider_with_key(&file);

        let a = provider.plaintext().await.unwrap();
        let b = provider.plaintext().await.unwrap();
        assert!(ClientHandle::ptr_eq(&a, &b));
        assert!(!a.is_encrypted());
    }

    #[tokio::test]
    async fn short_master_key_fails_at_read_stage_and_is_not_cached() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1u8; 10]).unwrap();
        let provider = provider_with_key(&file);

        let err = provider.encrypted().await.unwrap_err();
        assert_eq!(err.stage(), Some(ProvisioningStage::ReadMasterKey));
        assert!(provider.schema().is_none());

        // Fix the key file; the next call provisions from scratch.
        std::fs::write(file.path(), [1u8; MASTER_KEY_LEN]).unwrap();
        let client = provider.encrypted().await.unwrap();
        assert!(client.is_encrypted());
        assert_eq!(provider.data_key().map(|(_, origin)| origin), Some(KeyOrigin::Created));
    }
}
