//! Store client handles.
//!
//! A [`ClientHandle`] is a cheap-to-clone reference to one store connection,
//! optionally with transparent auto-encryption attached. Every operation runs
//! under the handle's deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::auto_encryption::{AutoEncrypter, AutoEncryptionOptions};
use crate::error::FleError;
use crate::store::{Document, DocumentStore, Filter, IndexModel, Namespace, StoreConnector, Update};

/// Everything needed to open one client.
#[derive(Debug)]
pub struct ClientSettings {
    pub connection_string: String,
    pub database: String,
    /// Deadline applied to the connect call and to every operation.
    pub timeout: Duration,
    pub auto_encryption: Option<AutoEncryptionOptions>,
}

/// A shared handle to the store. Immutable after construction.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: Arc<dyn DocumentStore>,
    database: String,
    timeout: Duration,
    encrypter: Option<AutoEncrypter>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("database", &self.inner.database)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

/// Run `fut` under `after`, mapping an elapsed deadline to `FleError::Timeout`.
pub(crate) async fn with_deadline<T, F>(after: Duration, operation: &'static str, fut: F) -> Result<T, FleError>
where
    F: Future<Output = Result<T, FleError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(FleError::Timeout { operation, after }),
    }
}

impl ClientHandle {
    /// Open a connection through `connector` and attach auto-encryption when
    /// the settings carry it.
    pub async fn connect(connector: &dyn StoreConnector, settings: ClientSettings) -> Result<Self, FleError> {
        if settings.database.is_empty() {
            return Err(FleError::Config("empty database name".into()));
        }
        let store = with_deadline(
            settings.timeout,
            "connect",
            connector.connect(&settings.connection_string),
        )
        .await?;

        let encrypter = settings
            .auto_encryption
            .map(|options| AutoEncrypter::new(options, Arc::clone(&store), settings.timeout))
            .transpose()?;

        debug!(
            database = %settings.database,
            encrypted = encrypter.is_some(),
            "opened store client"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                store,
                database: settings.database,
                timeout: settings.timeout,
                encrypter,
            }),
        })
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    /// Namespace of `collection` in this client's database.
    pub fn namespace(&self, collection: &str) -> Result<Namespace, FleError> {
        Namespace::new(self.inner.database.clone(), collection)
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.encrypter.is_some()
    }

    /// Whether two handles share the same underlying client.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub async fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<Value, FleError> {
        let doc = match &self.inner.encrypter {
            Some(enc) => enc.encrypt_document(ns, doc).await?,
            None => doc,
        };
        with_deadline(self.inner.timeout, "insert", self.inner.store.insert_one(ns, doc)).await
    }

    pub async fn find(&self, ns: &Namespace, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>, FleError> {
        let found = match &self.inner.encrypter {
            Some(enc) => {
                let filter = enc.encrypt_filter(ns, filter).await?;
                with_deadline(self.inner.timeout, "find", self.inner.store.find(ns, &filter, limit)).await?
            }
            None => with_deadline(self.inner.timeout, "find", self.inner.store.find(ns, filter, limit)).await?,
        };
        self.decrypt_all(found).await
    }

    pub async fn find_one(&self, ns: &Namespace, filter: &Filter) -> Result<Option<Document>, FleError> {
        Ok(self.find(ns, filter, Some(1)).await?.into_iter().next())
    }

    /// Apply `update` to the first match; returns the document as it was
    /// before the update.
    pub async fn find_one_and_update(
        &self,
        ns: &Namespace,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<Document>, FleError> {
        let before = match &self.inner.encrypter {
            Some(enc) => {
                let filter = enc.encrypt_filter(ns, filter).await?;
                let update = enc.encrypt_update(ns, update).await?;
                with_deadline(
                    self.inner.timeout,
                    "find_one_and_update",
                    self.inner.store.find_one_and_update(ns, &filter, &update),
                )
                .await?
            }
            None => {
                with_deadline(
                    self.inner.timeout,
                    "find_one_and_update",
                    self.inner.store.find_one_and_update(ns, filter, update),
                )
                .await?
            }
        };
        match before {
            Some(doc) => Ok(Some(self.decrypt(doc).await?)),
            None => Ok(None),
        }
    }

    pub async fn create_index(&self, ns: &Namespace, index: IndexModel) -> Result<String, FleError> {
        with_deadline(self.inner.timeout, "create_index", self.inner.store.create_index(ns, index)).await
    }

    pub async fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexModel>, FleError> {
        with_deadline(self.inner.timeout, "list_indexes", self.inner.store.list_indexes(ns)).await
    }

    pub async fn count_documents(&self, ns: &Namespace, filter: &Filter) -> Result<u64, FleError> {
        let filter = match &self.inner.encrypter {
            Some(enc) => enc.encrypt_filter(ns, filter).await?,
            None => filter.clone(),
        };
        with_deadline(
            self.inner.timeout,
            "count_documents",
            self.inner.store.count_documents(ns, &filter),
        )
        .await
    }

    async fn decrypt(&self, doc: Document) -> Result<Document, FleError> {
        match &self.inner.encrypter {
            Some(enc) => enc.decrypt_document(doc).await,
            None => Ok(doc),
        }
    }

    async fn decrypt_all(&self, docs: Vec<Document>) -> Result<Vec<Document>, FleError> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(self.decrypt(doc).await?);
        }
        Ok(out)
    }
}
