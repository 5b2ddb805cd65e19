//! Encryption schema compilation.
//!
//! A schema is built from a typed field table and compiled into the generic
//! JSON document the auto-encryption layer consumes:
//!
//! ```text
//! { "bsonType": "object",
//!   "encryptMetadata": { "keyId": [ <binary key id> ] },
//!   "properties": { <field>: { "encrypt": { "bsonType": .., "algorithm": .. } } } }
//! ```
//!
//! Compilation is pure. Properties are emitted in sorted field order, so equal
//! inputs give byte-identical documents regardless of table order.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::FleError;
use crate::key_vault::KeyId;
use crate::store::{self, subtype, Namespace};

/// How a field is encrypted.
///
/// `Deterministic` makes the field equality-queryable but leaks which
/// documents share a value. `Random` hides that and forbids filtering on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Deterministic,
    Random,
}

impl Algorithm {
    /// The algorithm identifier understood by the store's encryption layer.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            Self::Random => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
        }
    }
}

/// BSON type of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BsonType {
    String,
    Int,
    Long,
    Double,
    Bool,
    Date,
    Object,
    Array,
}

impl BsonType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Whether a JSON value can carry this BSON type.
    pub(crate) fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::Date => value.is_string(),
            Self::Int | Self::Long => value.is_i64() || value.is_u64(),
            Self::Double => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One encrypted field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub name: Cow<'static, str>,
    pub bson_type: BsonType,
    pub algorithm: Algorithm,
}

impl FieldSpec {
    pub fn new(name: impl Into<Cow<'static, str>>, bson_type: BsonType, algorithm: Algorithm) -> Self {
        Self {
            name: name.into(),
            bson_type,
            algorithm,
        }
    }

    /// A string field with deterministic encryption.
    pub const fn deterministic(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            bson_type: BsonType::String,
            algorithm: Algorithm::Deterministic,
        }
    }

    /// A string field with random encryption.
    pub const fn random(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            bson_type: BsonType::String,
            algorithm: Algorithm::Random,
        }
    }

    pub fn with_type(mut self, bson_type: BsonType) -> Self {
        self.bson_type = bson_type;
        self
    }

    /// Build a string-field table from `{name: deterministic?}` pairs.
    pub fn table<'a, I>(pairs: I) -> Vec<FieldSpec>
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        pairs
            .into_iter()
            .map(|(name, deterministic)| {
                let algorithm = if deterministic {
                    Algorithm::Deterministic
                } else {
                    Algorithm::Random
                };
                FieldSpec::new(name.to_string(), BsonType::String, algorithm)
            })
            .collect()
    }
}

/// A compiled schema for one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSchema {
    namespace: Namespace,
    key_id: KeyId,
    fields: BTreeMap<String, FieldSpec>,
    document: Value,
}

impl CompiledSchema {
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// The wire-form schema document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Key ids listed under `encryptMetadata.keyId`, as base64 strings.
    pub fn key_ids(&self) -> Vec<String> {
        self.document["encryptMetadata"]["keyId"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|v| v["$binary"]["base64"].as_str().map(str::to_string))
            .collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    /// Serialised document bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FleError> {
        Ok(serde_json::to_vec(&self.document)?)
    }
}

/// Namespace → compiled schema, as handed to the encrypted client.
pub type SchemaMap = BTreeMap<Namespace, CompiledSchema>;

/// Wire form of a schema map: `{ "<db>.<coll>": <schema document> }`.
pub fn schema_map_document(map: &SchemaMap) -> Value {
    Value::Object(
        map.iter()
            .map(|(ns, schema)| (ns.to_string(), schema.document.clone()))
            .collect(),
    )
}

/// Compile the schema for `namespace` binding every field in `fields` to
/// `key_id`.
///
/// Fails with `FleError::Config` if the key id is empty, or if a field name
/// is empty, dotted, `$`-prefixed, or listed twice.
pub fn compile(key_id: &KeyId, namespace: &Namespace, fields: &[FieldSpec]) -> Result<CompiledSchema, FleError> {
    if key_id.as_str().is_empty() {
        return Err(FleError::Config(
            "key id must contain the base64 data-encryption key id".into(),
        ));
    }

    let mut seen = HashSet::new();
    for spec in fields {
        let name = spec.name.as_ref();
        if name.is_empty() || name.contains('.') || name.starts_with('$') {
            return Err(FleError::Config(format!("invalid encrypted field name '{name}'")));
        }
        if !seen.insert(name) {
            return Err(FleError::Config(format!("field '{name}' listed twice")));
        }
    }

    let fields: BTreeMap<String, FieldSpec> = fields
        .iter()
        .map(|spec| (spec.name.to_string(), spec.clone()))
        .collect();

    let properties: Map<String, Value> = fields
        .iter()
        .map(|(name, spec)| {
            let entry = json!({
                "encrypt": {
                    "bsonType": spec.bson_type.as_str(),
                    "algorithm": spec.algorithm.wire_name(),
                }
            });
            (name.clone(), entry)
        })
        .collect();

    let document = json!({
        "bsonType": "object",
        "encryptMetadata": {
            "keyId": [store::binary_base64(key_id.as_str(), subtype::UUID)],
        },
        "properties": properties,
    });

    Ok(CompiledSchema {
        namespace: namespace.clone(),
        key_id: key_id.clone(),
        fields,
        document,
    })
}
