//! Lazy, single-flight construction of the two client slots.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fieldvault::backends::MemoryConnector;
use fieldvault::{
    ClientHandle, DocumentStore, DualClientProvider, FleConfig, FleError, Patient, ProvisioningStage, Record,
    StoreConnector, MASTER_KEY_LEN,
};

fn config(dir: &tempfile::TempDir) -> FleConfig {
    let path = dir.path().join("master-key.txt");
    std::fs::write(&path, [3u8; MASTER_KEY_LEN]).unwrap();
    FleConfig {
        master_key_path: path,
        ..FleConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_share_one_encrypted_client() {
    let dir = tempfile::tempdir().unwrap();
    let connector = MemoryConnector::default();
    let provider = Arc::new(
        DualClientProvider::new(
            config(&dir),
            Arc::new(connector.clone()),
            Patient::ENCRYPTED_FIELDS.to_vec(),
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.encrypted().await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    let first = &handles[0];
    assert!(first.is_encrypted());
    assert!(handles.iter().all(|h| ClientHandle::ptr_eq(h, first)));

    // One plaintext connection (used for the key vault) and one encrypted.
    assert_eq!(connector.connections(), 2);

    // Exactly one key was provisioned.
    let vault_ns = provider.key_vault_namespace().clone();
    assert_eq!(connector.store().raw_documents(&vault_ns).len(), 1);
}

#[tokio::test]
async fn test_plaintext_and_encrypted_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let connector = MemoryConnector::default();
    let provider = DualClientProvider::new(
        config(&dir),
        Arc::new(connector.clone()),
        Patient::ENCRYPTED_FIELDS.to_vec(),
    )
    .unwrap();

    let plain = provider.plaintext().await.unwrap();
    let enc = provider.encrypted().await.unwrap();
    assert!(!plain.is_encrypted());
    assert!(!ClientHandle::ptr_eq(&plain, &enc));

    // Both slots stay memoised.
    assert!(ClientHandle::ptr_eq(&plain, &provider.plaintext().await.unwrap()));
    assert!(ClientHandle::ptr_eq(&enc, &provider.encrypted().await.unwrap()));
    assert_eq!(connector.connections(), 2);

    let schema = provider.schema().unwrap();
    assert_eq!(schema.namespace().to_string(), "fhir.patients");
    assert_eq!(schema.key_ids().len(), 1);
}

#[tokio::test]
async fn test_missing_master_key_fails_without_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let config = FleConfig {
        master_key_path: dir.path().join("missing.key"),
        ..FleConfig::default()
    };
    let connector = MemoryConnector::default();
    let provider =
        DualClientProvider::new(config, Arc::new(connector.clone()), Patient::ENCRYPTED_FIELDS.to_vec()).unwrap();

    let err = provider.encrypted().await.unwrap_err();
    assert_eq!(err.stage(), Some(ProvisioningStage::ReadMasterKey));
    assert!(matches!(
        err,
        FleError::Provisioning { ref source, .. } if matches!(**source, FleError::Io { .. })
    ));
    // Nothing was connected on the way to the failure.
    assert_eq!(connector.connections(), 0);
}

/// Connector whose `nth` connect call (zero-based) hangs for `delay`.
#[derive(Clone)]
struct SlowConnector {
    inner: MemoryConnector,
    calls: Arc<AtomicUsize>,
    nth: usize,
    delay: Duration,
}

#[async_trait]
impl StoreConnector for SlowConnector {
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn DocumentStore>, FleError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.nth {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.connect(connection_string).await
    }
}

#[tokio::test]
async fn test_timed_out_provisioning_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let config = FleConfig {
        operation_timeout: Duration::from_millis(50),
        ..config(&dir)
    };
    let inner = MemoryConnector::default();
    let connector = SlowConnector {
        inner: inner.clone(),
        calls: Arc::new(AtomicUsize::new(0)),
        // Call 0 is the plaintext client; call 1 is the encrypted client.
        nth: 1,
        delay: Duration::from_secs(2),
    };
    let provider = DualClientProvider::new(config, Arc::new(connector), Patient::ENCRYPTED_FIELDS.to_vec()).unwrap();

    let err = provider.encrypted().await.unwrap_err();
    assert_eq!(err.stage(), Some(ProvisioningStage::Connect));
    assert!(err.is_retryable());
    assert!(provider.schema().is_none());

    // The failure was not cached; the key created on the first attempt is found.
    let client = provider.encrypted().await.unwrap();
    assert!(client.is_encrypted());
    assert_eq!(inner.connections(), 2);
    assert_eq!(
        inner.store().raw_documents(provider.key_vault_namespace()).len(),
        1
    );
    assert_eq!(
        provider.data_key().map(|(_, origin)| origin),
        Some(fieldvault::KeyOrigin::Found)
    );
}
