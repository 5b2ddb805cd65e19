//! The document-store boundary.
//!
//! The storage engine itself is external. This module defines the narrow
//! surface the rest of the crate needs from it: namespaced documents,
//! equality/exists filters, `$set`/`$addToSet` updates, and unique partial
//! indexes. Implementations live under [`crate::backends`].
//!
//! Documents are JSON objects. Binary values use the extended-JSON shape
//! `{"$binary": {"base64": ..., "subType": ...}}`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};

use crate::error::FleError;

/// A stored document.
pub type Document = Map<String, Value>;

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// A fully qualified collection name, `<database>.<collection>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Result<Self, FleError> {
        let database = database.into();
        let collection = collection.into();
        if database.is_empty() || collection.is_empty() {
            return Err(FleError::Config(format!(
                "namespace '{database}.{collection}' needs a database and a collection"
            )));
        }
        if database.contains('.') {
            return Err(FleError::Config(format!("database name '{database}' contains '.'")));
        }
        Ok(Self {
            database,
            collection,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl FromStr for Namespace {
    type Err = FleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Err(FleError::Config(format!("malformed namespace '{s}'"))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

// ---------------------------------------------------------------------------
// Binary values
// ---------------------------------------------------------------------------

/// BSON binary subtypes used by the crate.
pub mod subtype {
    pub const GENERIC: &str = "00";
    pub const UUID: &str = "04";
    pub const ENCRYPTED: &str = "06";
}

/// Build an extended-JSON binary value.
pub fn binary(bytes: &[u8], subtype: &str) -> Value {
    binary_base64(STANDARD.encode(bytes), subtype)
}

/// Build an extended-JSON binary value from already-encoded base64.
pub fn binary_base64(base64: impl Into<String>, subtype: &str) -> Value {
    json!({ "$binary": { "base64": base64.into(), "subType": subtype } })
}

/// Decode an extended-JSON binary value, returning its bytes and subtype.
pub fn as_binary(value: &Value) -> Option<(Vec<u8>, &str)> {
    let inner = value.as_object()?.get("$binary")?.as_object()?;
    let bytes = STANDARD.decode(inner.get("base64")?.as_str()?).ok()?;
    Some((bytes, inner.get("subType")?.as_str()?))
}

/// Look up a possibly dotted path inside a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Filters and updates
// ---------------------------------------------------------------------------

/// One predicate of a [`Filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value, or the field is an array containing it.
    Eq(String, Value),
    /// Field is present (`true`) or absent (`false`).
    Exists(String, bool),
}

impl Condition {
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(field, _) | Self::Exists(field, _) => field,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Eq(field, expected) => match lookup(doc, field) {
                Some(actual @ Value::Array(items)) => items.contains(expected) || actual == expected,
                Some(actual) => actual == expected,
                None => expected.is_null(),
            },
            Self::Exists(field, wanted) => lookup(doc, field).is_some() == *wanted,
        }
    }
}

/// A conjunction of conditions. The empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and_eq(field, value)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            conditions: vec![Condition::Exists(field.into(), true)],
        }
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub(crate) fn from_conditions(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(Condition::field)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|c| c.matches(doc))
    }
}

/// A `$set` / `$addToSet` mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Document,
    pub add_to_set: Document,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add_to_set.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add_to_set.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.set.keys().chain(self.add_to_set.keys()).map(String::as_str)
    }

    /// Apply the mutation in place.
    pub fn apply(&self, doc: &mut Document) -> Result<(), FleError> {
        for (field, value) in &self.set {
            doc.insert(field.clone(), value.clone());
        }
        for (field, value) in &self.add_to_set {
            let slot = doc
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(items) => {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
                Value::Null => *slot = Value::Array(vec![value.clone()]),
                _ => {
                    return Err(FleError::Query(format!(
                        "cannot apply $addToSet to non-array field '{field}'"
                    )))
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// An ascending single-field index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    pub name: String,
    pub field: String,
    pub unique: bool,
    /// Only documents matching this filter are indexed.
    pub partial_filter: Option<Filter>,
}

impl IndexModel {
    pub fn ascending(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: format!("{field}_1"),
            field,
            unique: false,
            partial_filter: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn partial(mut self, filter: Filter) -> Self {
        self.partial_filter = Some(filter);
        self
    }

    /// Whether `doc` is covered by this index.
    pub fn covers(&self, doc: &Document) -> bool {
        self.partial_filter.as_ref().map_or(true, |f| f.matches(doc))
    }
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// One connection (pool) to the document store.
///
/// Implementations must be `Send + Sync` so a connection can be shared
/// across tasks behind an `Arc<dyn DocumentStore>`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert `doc`, assigning an `_id` if absent. Returns the `_id`.
    async fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<Value, FleError>;

    /// Documents matching `filter`, in insertion order, at most `limit`.
    async fn find(
        &self,
        ns: &Namespace,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, FleError>;

    /// Apply `update` to the first match and return it as it was *before*
    /// the update.
    async fn find_one_and_update(
        &self,
        ns: &Namespace,
        filter: &Filter,
        update: &Update,
    ) -> Result<Option<Document>, FleError>;

    /// Create `index`. Returns the index name. Creating an identical index
    /// again is a no-op; the same name with different options is an error.
    async fn create_index(&self, ns: &Namespace, index: IndexModel) -> Result<String, FleError>;

    async fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexModel>, FleError>;

    async fn count_documents(&self, ns: &Namespace, filter: &Filter) -> Result<u64, FleError>;
}

/// Opens store connections from a connection string.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn DocumentStore>, FleError>;
}
