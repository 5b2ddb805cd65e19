//! Record types and their storage metadata.
//!
//! A [`Record`] lives in a collection whose encrypted fields are declared
//! statically; routing derives the client choice from that table. An
//! [`AuxiliaryEvent`] carries no sensitive fields and always goes through the
//! plaintext client.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::schema::FieldSpec;

/// A document type stored in a (possibly) encrypted collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// Collection name, relative to the provider's database.
    const COLLECTION: &'static str;

    /// Fields encrypted by the store client. Empty means plaintext storage.
    const ENCRYPTED_FIELDS: &'static [FieldSpec];
}

/// A reporting or logging document written in plaintext.
pub trait AuxiliaryEvent: Serialize + Send + Sync {
    const COLLECTION: &'static str;
}

// ---------------------------------------------------------------------------
// Patient records
// ---------------------------------------------------------------------------

/// A clinical condition recorded against a patient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinical_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onset_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_parsed: Option<DateTime<Utc>>,
}

/// A patient. Identifying fields are encrypted; demographic fields used for
/// reporting stay in plaintext.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Deterministically encrypted, so it stays equality-queryable.
    pub patient_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_date: Option<DateTime<Utc>>,
}

impl Patient {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Self::default()
        }
    }
}

impl Record for Patient {
    const COLLECTION: &'static str = "patients";
    const ENCRYPTED_FIELDS: &'static [FieldSpec] = &[
        FieldSpec::deterministic("patientId"),
        FieldSpec::random("firstName"),
        FieldSpec::random("lastName"),
        FieldSpec::random("address"),
        FieldSpec::random("postalCode"),
    ];
}

// ---------------------------------------------------------------------------
// Auxiliary events
// ---------------------------------------------------------------------------

/// De-identified condition report for the reporting feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionEvent {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub gender: Option<String>,
    pub birthdate: Option<DateTime<Utc>>,
    pub condition: Option<String>,
    pub condition_code: Option<String>,
    pub onset_date: Option<DateTime<Utc>>,
    pub reported_date: DateTime<Utc>,
}

impl ConditionEvent {
    /// Copy only the non-identifying fields of `patient`.
    pub fn report(patient: &Patient, condition: &Condition, reported_date: DateTime<Utc>) -> Self {
        Self {
            id: None,
            city: patient.city.clone(),
            state: patient.state.clone(),
            gender: patient.gender.clone(),
            birthdate: patient.birth_date,
            condition: condition.condition.clone(),
            condition_code: condition.condition_code.clone(),
            onset_date: condition.onset_date,
            reported_date,
        }
    }
}

impl AuxiliaryEvent for ConditionEvent {
    const COLLECTION: &'static str = "conditionEvent";
}

/// Raw log entry for one incoming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStream {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub event_date: DateTime<Utc>,
    pub raw_event_string: String,
    pub event_method: String,
    pub resource_type: String,
}

impl EventStream {
    pub const PATIENT_RESOURCE: &'static str = "Patient";
    pub const CONDITION_RESOURCE: &'static str = "Condition";
    pub const PATIENT_ID_RESOURCE: &'static str = "Patient_Id";

    pub const HTTP_GET: &'static str = "HTTP_GET";
    pub const HTTP_POST: &'static str = "HTTP_POST";

    pub fn new(
        raw_event_string: impl Into<String>,
        event_method: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            event_date: Utc::now(),
            raw_event_string: raw_event_string.into(),
            event_method: event_method.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl AuxiliaryEvent for EventStream {
    const COLLECTION: &'static str = "eventStream";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Algorithm;

    #[test]
    fn patient_serializes_with_store_field_names() {
        let mut patient = Patient::new("p-1");
        patient.first_name = Some("Ada".into());
        let value = serde_json::to_value(&patient).unwrap();

        assert_eq!(value["patientId"], "p-1");
        assert_eq!(value["firstName"], "Ada");
        assert!(value.get("_id").is_none());
        assert!(value.get("lastName").is_none());
        assert_eq!(value["conditions"], serde_json::json!([]));
    }

    #[test]
    fn only_patient_id_is_deterministic() {
        let deterministic: Vec<_> = Patient::ENCRYPTED_FIELDS
            .iter()
            .filter(|f| f.algorithm == Algorithm::Deterministic)
            .map(|f| &*f.name)
            .collect();
        assert_eq!(deterministic, ["patientId"]);
        assert_eq!(Patient::ENCRYPTED_FIELDS.len(), 5);
    }

    #[test]
    fn condition_event_drops_identifying_fields() {
        let mut patient = Patient::new("p-1");
        patient.first_name = Some("Ada".into());
        patient.city = Some("Leeds".into());
        let condition = Condition {
            condition: Some("Influenza".into()),
            condition_code: Some("6142004".into()),
            ..Condition::default()
        };

        let event = ConditionEvent::report(&patient, &condition, Utc::now());
        let text = serde_json::to_string(&event).unwrap();
        assert!(!text.contains("Ada"));
        assert!(!text.contains("p-1"));
        assert_eq!(event.city.as_deref(), Some("Leeds"));
        assert_eq!(event.condition_code.as_deref(), Some("6142004"));
    }
}
