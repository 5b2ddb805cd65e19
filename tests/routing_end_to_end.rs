//! Patient records through the routing layer, end to end.

use std::sync::Arc;

use chrono::Utc;

use fieldvault::backends::MemoryConnector;
use fieldvault::{
    Condition, DualClientProvider, EventStream, Filter, FleConfig, FleError, Namespace, Patient, PatientService,
    Record, RoutingDataAccess, Update, MASTER_KEY_LEN,
};

struct Fixture {
    _dir: tempfile::TempDir,
    connector: MemoryConnector,
    service: PatientService,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master-key.txt");
    std::fs::write(&path, [9u8; MASTER_KEY_LEN]).unwrap();

    let connector = MemoryConnector::default();
    let config = FleConfig {
        master_key_path: path,
        ..FleConfig::default()
    };
    let provider =
        DualClientProvider::new(config, Arc::new(connector.clone()), Patient::ENCRYPTED_FIELDS.to_vec()).unwrap();
    let service = PatientService::new(RoutingDataAccess::new(Arc::new(provider)));
    Fixture {
        _dir: dir,
        connector,
        service,
    }
}

fn patient(id: &str) -> Patient {
    Patient {
        first_name: Some("Ada".into()),
        last_name: Some("Lovelace".into()),
        address: Some("12 St James's Square".into()),
        city: Some("London".into()),
        state: Some("LDN".into()),
        postal_code: Some("SW1Y 4JH".into()),
        gender: Some("female".into()),
        ..Patient::new(id)
    }
}

fn patients_ns() -> Namespace {
    "fhir.patients".parse().unwrap()
}

#[tokio::test]
async fn test_deterministic_field_is_queryable_only_through_encrypted_client() {
    let fx = fixture();
    let saved = fx.service.save_patient(patient("A1")).await.unwrap();
    assert!(saved.id.is_some());

    let found = fx.service.find_patient("A1").await.unwrap().unwrap();
    assert_eq!(found.first_name.as_deref(), Some("Ada"));
    assert_eq!(found.postal_code.as_deref(), Some("SW1Y 4JH"));
    assert_eq!(found.id, saved.id);

    // The same query through the plaintext client compares plaintext against
    // ciphertext and matches nothing. It is not an error.
    let plain = fx.service.access().provider().plaintext().await.unwrap();
    let miss = plain
        .find_one(&patients_ns(), &Filter::eq("patientId", "A1"))
        .await
        .unwrap();
    assert!(miss.is_none());

    assert!(fx.service.find_patient("B2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sensitive_fields_are_ciphertext_at_rest() {
    // Threat Model: someone with read access to the store but no master key.
    let fx = fixture();
    fx.service.save_patient(patient("A1")).await.unwrap();
    fx.service.save_patient(patient("A2")).await.unwrap();

    let raw = fx.connector.store().raw_documents(&patients_ns());
    assert_eq!(raw.len(), 2);
    for doc in &raw {
        for field in ["patientId", "firstName", "lastName", "address", "postalCode"] {
            assert_eq!(doc[field]["$binary"]["subType"], "06", "{field} stored in plaintext");
        }
        assert_eq!(doc["city"], "London");
    }
    // Spaces never occur in base64, so these cannot match by accident.
    let text = serde_json::to_string(&raw).unwrap();
    assert!(!text.contains("St James"));
    assert!(!text.contains("SW1Y 4JH"));

    // Random fields differ between identical plaintexts; deterministic ones
    // differ only because the ids differ.
    assert_ne!(raw[0]["firstName"], raw[1]["firstName"]);
    assert_ne!(raw[0]["patientId"], raw[1]["patientId"]);
}

#[tokio::test]
async fn test_random_field_cannot_be_queried() {
    let fx = fixture();
    fx.service.save_patient(patient("A1")).await.unwrap();

    let err = fx
        .service
        .access()
        .find_by_encrypted_field::<Patient>("firstName", "Ada")
        .await
        .unwrap_err();
    assert!(matches!(err, FleError::Query(_)));
}

#[tokio::test]
async fn test_add_condition_updates_patient_and_reports_event() {
    let fx = fixture();
    fx.service.save_patient(patient("A1")).await.unwrap();

    let condition = Condition {
        condition: Some("Influenza".into()),
        condition_code: Some("6142004".into()),
        clinical_status: Some("active".into()),
        onset_date: Some(Utc::now()),
        ..Condition::default()
    };
    let updated = fx
        .service
        .add_condition("A1", condition.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.conditions, vec![condition.clone()]);
    assert!(updated.update_date.is_some());
    assert_eq!(updated.first_name.as_deref(), Some("Ada"));

    // Adding the same condition again leaves the set unchanged.
    let again = fx.service.add_condition("A1", condition).await.unwrap().unwrap();
    assert_eq!(again.conditions.len(), 1);

    let events_ns: Namespace = "fhir.conditionEvent".parse().unwrap();
    let events = fx.connector.store().raw_documents(&events_ns);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["condition"], "Influenza");
    assert_eq!(events[0]["city"], "London");
    let text = serde_json::to_string(&events).unwrap();
    assert!(!text.contains("Ada"));
    assert!(!text.contains("A1"));
}

#[tokio::test]
async fn test_add_condition_for_unknown_patient_reports_nothing() {
    let fx = fixture();
    let result = fx
        .service
        .add_condition("nobody", Condition::default())
        .await
        .unwrap();
    assert!(result.is_none());

    let events_ns: Namespace = "fhir.conditionEvent".parse().unwrap();
    assert!(fx.connector.store().raw_documents(&events_ns).is_empty());
}

#[tokio::test]
async fn test_event_stream_is_written_in_plaintext() {
    let fx = fixture();
    let event = EventStream::new(
        r#"{"resourceType":"Patient"}"#,
        EventStream::HTTP_POST,
        EventStream::PATIENT_RESOURCE,
    );
    fx.service.record_event_stream(&event).await.unwrap();

    let ns: Namespace = "fhir.eventStream".parse().unwrap();
    let raw = fx.connector.store().raw_documents(&ns);
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0]["eventMethod"], "HTTP_POST");
    assert_eq!(raw[0]["rawEventString"], r#"{"resourceType":"Patient"}"#);

    // Auxiliary events never trigger key provisioning.
    assert!(fx.service.access().provider().schema().is_none());
}

#[tokio::test]
async fn test_update_of_filtered_field_returns_updated_record() {
    let fx = fixture();
    fx.service.save_patient(patient("A1")).await.unwrap();

    let updated = fx
        .service
        .access()
        .update_and_fetch::<Patient>(&Filter::eq("patientId", "A1"), &Update::new().set("patientId", "A2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.patient_id, "A2");
    assert_eq!(updated.first_name.as_deref(), Some("Ada"));

    assert!(fx.service.find_patient("A1").await.unwrap().is_none());
    assert!(fx.service.find_patient("A2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_update_with_no_match_returns_none() {
    let fx = fixture();
    let result = fx
        .service
        .access()
        .update_and_fetch::<Patient>(&Filter::eq("patientId", "ghost"), &Update::new().set("city", "Leeds"))
        .await
        .unwrap();
    assert!(result.is_none());
}
