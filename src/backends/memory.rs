//! In-memory [`DocumentStore`] backend backed by `Arc<Mutex<HashMap>>`.
//!
//! Suitable for tests and local development. It enforces unique and partial
//! indexes the way a real document store does, which is what the key vault
//! relies on to reject duplicate aliases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::FleError;
use crate::store::{
    lookup, Document, DocumentStore, Filter, IndexModel, Namespace, StoreConnector, Update,
};

#[derive(Default)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
}

impl CollectionState {
    /// Name of the first unique index `candidate` would violate, ignoring the
    /// document at position `skip`.
    fn violated_index(&self, candidate: &Document, skip: Option<usize>) -> Option<&str> {
        self.indexes
            .iter()
            .filter(|idx| idx.unique && idx.covers(candidate))
            .find(|idx| {
                let keys = index_keys(candidate, &idx.field);
                self.documents
                    .iter()
                    .enumerate()
                    .filter(|(pos, doc)| Some(*pos) != skip && idx.covers(doc))
                    .any(|(_, doc)| index_keys(doc, &idx.field).iter().any(|k| keys.contains(k)))
            })
            .map(|idx| idx.name.as_str())
    }
}

/// Index keys of `doc` on `field`: one per array element, `null` when absent.
fn index_keys(doc: &Document, field: &str) -> Vec<Value> {
    match lookup(doc, field) {
        Some(Value::Array(items)) => items.clone(),
        Some(value) => vec![value.clone()],
        None => vec![Value::Null],
    }
}

/// Thread-safe in-memory document store.
///
/// `Clone` shares the underlying data, so clones behave like separate
/// connections to the same server.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<Namespace, CollectionState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Namespace, CollectionState>> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raw documents of a namespace, exactly as stored. Convenience for tests
    /// that need to inspect ciphertext.
    pub fn raw_documents(&self, ns: &Namespace) -> Vec<Document> {
        self.lock()
            .get(ns)
            .map(|state| state.documents.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, ns: &Namespace, mut doc: Document) -> Result<Value, FleError> {
        let id = doc
            .entry("_id")
            .or_insert_with(|| Value::String(Uuid::new_v4().simple().to_string()))
            .clone();

        let mut guard = self.lock();
        let state = guard.entry(ns.clone()).or_default();
        if state.documents.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(FleError::DuplicateKey {
                namespace: ns.to_string(),
                index: "_id_".to_string(),
            });
        }
        if let Some(index) = state.violated_index(&doc, None) {
            return Err(FleError::DuplicateKey {
                namespace: ns.to_string(),
                index: index.to_string(),
            });
        }
        state.documents.push(doc);
        Ok(id)
    }

    async fn find(
        &self,
        ns: &Namespace,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, FleError> {
        let guard = self.lock();
        let Some(state) = guard.get(ns) else {
            return Ok(Vec::new());
        };
        Ok(state
            .documents
            .iter()
            .filter(|doc| filter.matches(doc))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn find_one_and_update(
        &self,
        ns: &Namespace,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<Document>, FleError> {
        let mut guard = self.lock();
        let Some(state) = guard.get_mut(ns) else {
            return Ok(None);
        };
        let Some(pos) = state.documents.iter().position(|doc| filter.matches(doc)) else {
            return Ok(None);
        };

        let before = state.documents[pos].clone();
        let mut after = before.clone();
        update.apply(&mut after)?;
        if let Some(index) = state.violated_index(&after, Some(pos)) {
            return Err(FleError::DuplicateKey {
                namespace: ns.to_string(),
                index: index.to_string(),
            });
        }
        state.documents[pos] = after;
        Ok(Some(before))
    }

    async fn create_index(&self, ns: &Namespace, index: IndexModel) -> Result<String, FleError> {
        let mut guard = self.lock();
        let state = guard.entry(ns.clone()).or_default();

        if let Some(existing) = state.indexes.iter().find(|i| i.name == index.name) {
            if *existing == index {
                return Ok(index.name);
            }
            return Err(FleError::Query(format!(
                "index '{}' already exists on {ns} with different options",
                index.name
            )));
        }

        if index.unique {
            let mut seen = CollectionState {
                documents: Vec::new(),
                indexes: vec![index.clone()],
            };
            for doc in &state.documents {
                if seen.violated_index(doc, None).is_some() {
                    return Err(FleError::DuplicateKey {
                        namespace: ns.to_string(),
                        index: index.name,
                    });
                }
                seen.documents.push(doc.clone());
            }
        }

        let name = index.name.clone();
        state.indexes.push(index);
        Ok(name)
    }

    async fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexModel>, FleError> {
        Ok(self
            .lock()
            .get(ns)
            .map(|state| state.indexes.clone())
            .unwrap_or_default())
    }

    async fn count_documents(&self, ns: &Namespace, filter: &Filter) -> Result<u64, FleError> {
        Ok(self.find(ns, filter, None).await?.len() as u64)
    }
}

/// Connector handing out connections to one shared [`MemoryStore`].
///
/// Counts connections so tests can assert how many pools were opened.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
    connections: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Number of successful `connect` calls so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn DocumentStore>, FleError> {
        if connection_string.is_empty() {
            return Err(FleError::Config("empty connection string".into()));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.store.clone()))
    }
}
