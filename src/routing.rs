//! Routes record reads and writes to the right client.
//!
//! Records with encrypted fields go through the encrypted client; auxiliary
//! events go through the plaintext client. The choice comes from each type's
//! static metadata, never from the caller.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::ClientHandle;
use crate::error::FleError;
use crate::provider::DualClientProvider;
use crate::record::{AuxiliaryEvent, Condition, ConditionEvent, EventStream, Patient, Record};
use crate::schema::FieldSpec;
use crate::store::{Document, Filter, Namespace, Update};

fn to_document<T: serde::Serialize>(value: &T) -> Result<Document, FleError> {
    match serde_json::to_value(value)? {
        Value::Object(doc) => Ok(doc),
        other => Err(FleError::Query(format!(
            "records must serialize to a document, got {}",
            json_kind(&other)
        ))),
    }
}

fn from_document<R: Record>(doc: Document) -> Result<R, FleError> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Data access over a [`DualClientProvider`].
#[derive(Clone)]
pub struct RoutingDataAccess {
    provider: Arc<DualClientProvider>,
}

impl RoutingDataAccess {
    pub fn new(provider: Arc<DualClientProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &DualClientProvider {
        &self.provider
    }

    /// Check that `R` agrees with what the provider encrypts.
    ///
    /// An encrypted record type must live in the provider's records
    /// collection with the same field table; a plaintext type must not.
    fn check_metadata<R: Record>(&self) -> Result<(), FleError> {
        let records = self.provider.records_namespace();
        let in_records = R::COLLECTION == records.collection();
        if R::ENCRYPTED_FIELDS.is_empty() {
            if in_records {
                return Err(FleError::Config(format!(
                    "record type for '{records}' declares no encrypted fields"
                )));
            }
            return Ok(());
        }
        if !in_records {
            return Err(FleError::Config(format!(
                "no encryption schema for collection '{}'; provider encrypts '{records}'",
                R::COLLECTION
            )));
        }
        let declared: HashSet<&FieldSpec> = R::ENCRYPTED_FIELDS.iter().collect();
        let compiled: HashSet<&FieldSpec> = self.provider.fields().iter().collect();
        if declared != compiled {
            return Err(FleError::Config(format!(
                "encrypted fields of '{records}' do not match the provider's schema"
            )));
        }
        Ok(())
    }

    async fn client_for<R: Record>(&self) -> Result<(ClientHandle, Namespace), FleError> {
        self.check_metadata::<R>()?;
        let client = if R::ENCRYPTED_FIELDS.is_empty() {
            self.provider.plaintext().await?
        } else {
            self.provider.encrypted().await?
        };
        let ns = client.namespace(R::COLLECTION)?;
        Ok((client, ns))
    }

    /// Insert `record`. Returns the stored `_id`.
    pub async fn create_record<R: Record>(&self, record: &R) -> Result<Value, FleError> {
        let (client, ns) = self.client_for::<R>().await?;
        let id = client.insert_one(&ns, to_document(record)?).await?;
        debug!(namespace = %ns, encrypted = client.is_encrypted(), "record created");
        Ok(id)
    }

    /// First record whose `field` equals `value`, always via the encrypted
    /// client.
    ///
    /// Only deterministically encrypted fields (and plaintext fields) can be
    /// matched; a randomly encrypted field is a `Query` error.
    pub async fn find_by_encrypted_field<R: Record>(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Option<R>, FleError> {
        if R::ENCRYPTED_FIELDS.is_empty() {
            return Err(FleError::Config(format!(
                "collection '{}' has no encrypted fields",
                R::COLLECTION
            )));
        }
        let (client, ns) = self.client_for::<R>().await?;
        client
            .find_one(&ns, &Filter::eq(field, value))
            .await?
            .map(from_document::<R>)
            .transpose()
    }

    /// Apply `update` to the first match of `filter`, then re-read that
    /// same document by `_id`.
    ///
    /// Returns `None` when nothing matches. The re-read does not use
    /// `filter`, so updates to the filtered fields are still returned.
    pub async fn update_and_fetch<R: Record>(&self, filter: &Filter, update: &Update) -> Result<Option<R>, FleError> {
        let (client, ns) = self.client_for::<R>().await?;
        let Some(before) = client.find_one_and_update(&ns, filter, update).await? else {
            return Ok(None);
        };
        let id = before
            .get("_id")
            .cloned()
            .ok_or_else(|| FleError::Query(format!("updated document in '{ns}' has no _id")))?;
        client
            .find_one(&ns, &Filter::eq("_id", id))
            .await?
            .map(from_document::<R>)
            .transpose()
    }

    /// Insert an auxiliary event through the plaintext client.
    pub async fn record_auxiliary_event<E: AuxiliaryEvent>(&self, event: &E) -> Result<Value, FleError> {
        let records = self.provider.records_namespace();
        if E::COLLECTION == records.collection() {
            return Err(FleError::Config(format!(
                "auxiliary events cannot be written to encrypted collection '{records}'"
            )));
        }
        let client = self.provider.plaintext().await?;
        let ns = client.namespace(E::COLLECTION)?;
        client.insert_one(&ns, to_document(event)?).await
    }
}

// ---------------------------------------------------------------------------
// Patient workflow
// ---------------------------------------------------------------------------

/// Patient operations of the clinical-records service.
#[derive(Clone)]
pub struct PatientService {
    access: RoutingDataAccess,
}

impl PatientService {
    pub fn new(access: RoutingDataAccess) -> Self {
        Self { access }
    }

    pub fn access(&self) -> &RoutingDataAccess {
        &self.access
    }

    /// Store a new patient. Returns it with `id` filled in.
    pub async fn save_patient(&self, mut patient: Patient) -> Result<Patient, FleError> {
        info!("saving patient");
        let id = self.access.create_record(&patient).await?;
        patient.id = match id {
            Value::String(id) => Some(id),
            other => Some(other.to_string()),
        };
        Ok(patient)
    }

    pub async fn find_patient(&self, patient_id: &str) -> Result<Option<Patient>, FleError> {
        info!("looking up patient by id");
        self.access.find_by_encrypted_field::<Patient>("patientId", patient_id).await
    }

    /// Attach `condition` to the patient and publish a de-identified
    /// [`ConditionEvent`].
    ///
    /// Returns the updated patient, or `None` if no patient has that id (no
    /// event is published then).
    pub async fn add_condition(&self, patient_id: &str, condition: Condition) -> Result<Option<Patient>, FleError> {
        info!("adding condition to patient");
        let now = Utc::now();
        let filter = Filter::eq("patientId", patient_id);
        let update = Update::new()
            .add_to_set("conditions", serde_json::to_value(&condition)?)
            .set("updateDate", serde_json::to_value(now)?);

        let patient = self.access.update_and_fetch::<Patient>(&filter, &update).await?;
        match &patient {
            Some(patient) => {
                let event = ConditionEvent::report(patient, &condition, now);
                self.access.record_auxiliary_event(&event).await?;
            }
            None => warn!("no patient for condition; condition event skipped"),
        }
        Ok(patient)
    }

    /// Log a raw request through the plaintext client.
    pub async fn record_event_stream(&self, event: &EventStream) -> Result<Value, FleError> {
        debug!(method = %event.event_method, resource = %event.resource_type, "recording event stream");
        self.access.record_auxiliary_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryConnector;
    use crate::config::FleConfig;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Invoice {
        number: String,
    }

    impl Record for Invoice {
        const COLLECTION: &'static str = "invoices";
        const ENCRYPTED_FIELDS: &'static [FieldSpec] = &[FieldSpec::deterministic("number")];
    }

    #[derive(Serialize, Deserialize)]
    struct LeakyPatient {
        #[serde(rename = "patientId")]
        patient_id: String,
    }

    impl Record for LeakyPatient {
        const COLLECTION: &'static str = "patients";
        const ENCRYPTED_FIELDS: &'static [FieldSpec] = &[];
    }

    fn access() -> RoutingDataAccess {
        let provider = DualClientProvider::new(
            FleConfig::default(),
            Arc::new(MemoryConnector::default()),
            Patient::ENCRYPTED_FIELDS.to_vec(),
        )
        .unwrap();
        RoutingDataAccess::new(Arc::new(provider))
    }

    #[tokio::test]
    async fn record_without_schema_is_rejected_before_connecting() {
        let access = access();
        let err = access
            .create_record(&Invoice { number: "7".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, FleError::Config(_)));
        assert!(access.provider().schema().is_none());
    }

    #[tokio::test]
    async fn plaintext_type_cannot_write_into_encrypted_collection() {
        let access = access();
        let err = access
            .create_record(&LeakyPatient { patient_id: "p-1".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, FleError::Config(_)));
    }

    #[test]
    fn non_object_records_are_rejected() {
        let err = to_document(&42).unwrap_err();
        assert!(matches!(err, FleError::Query(msg) if msg.contains("number")));
    }
}
