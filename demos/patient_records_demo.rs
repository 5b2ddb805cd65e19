//! Minimal example: encrypted patient records over the in-memory store.
//!
//! Provisions a data key, stores a patient through the encrypted client,
//! reads it back, and shows what the plaintext client sees.
//! Run with: `cargo run --example patient_records_demo`
//!
//! Configuration comes from `FLE_*` variables (a `.env` file is honoured).
//! If `FLE_MASTER_KEY_PATH` is unset a throwaway key is generated in the
//! temp directory. Set `RUST_LOG=info` to see the provisioning steps.

use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use fieldvault::audit::FileAuditSink;
use fieldvault::backends::MemoryConnector;
use fieldvault::{
    generate_master_key, write_master_key, Condition, DualClientProvider, EventStream, Filter, FleConfig, Patient,
    PatientService, Record, RoutingDataAccess,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    dotenvy::dotenv().ok();

    // 1. Configuration and master key
    let mut config = FleConfig::from_env()?;
    if std::env::var_os("FLE_MASTER_KEY_PATH").is_none() {
        let path = std::env::temp_dir().join(format!("fieldvault-demo-{}.key", std::process::id()));
        write_master_key(&path, &generate_master_key()?)?;
        config.master_key_path = path;
    }
    let key_path = config.master_key_path.clone();

    // 2. Provider and routing
    let connector = MemoryConnector::default();
    let provider = Arc::new(DualClientProvider::new(
        config,
        Arc::new(connector.clone()),
        Patient::ENCRYPTED_FIELDS.to_vec(),
    )?);
    let audit_path = std::env::temp_dir().join("fieldvault_key_audit.jsonl");
    provider.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?));
    let service = PatientService::new(RoutingDataAccess::new(Arc::clone(&provider)));

    // 3. Store and query a patient
    let patient = Patient {
        first_name: Some("Ada".into()),
        last_name: Some("Lovelace".into()),
        city: Some("London".into()),
        postal_code: Some("SW1Y 4JH".into()),
        ..Patient::new("patient-0001")
    };
    service.save_patient(patient).await?;
    service
        .record_event_stream(&EventStream::new(
            "{\"resourceType\":\"Patient\"}",
            EventStream::HTTP_POST,
            EventStream::PATIENT_RESOURCE,
        ))
        .await?;

    let found = service.find_patient("patient-0001").await?;
    println!("Encrypted client found: {found:?}");

    // 4. The plaintext client cannot match on the encrypted id
    let plaintext = provider.plaintext().await?;
    let ns = provider.records_namespace();
    let miss = plaintext.find_one(ns, &Filter::eq("patientId", "patient-0001")).await?;
    println!("Plaintext client found: {miss:?}");

    if let Some(stored) = connector.store().raw_documents(ns).first() {
        println!("Stored document: {}", serde_json::to_string_pretty(stored)?);
    }

    // 5. Conditions feed the de-identified reporting stream
    let condition = Condition {
        condition: Some("Influenza".into()),
        condition_code: Some("6142004".into()),
        ..Condition::default()
    };
    let updated = service.add_condition("patient-0001", condition).await?;
    println!(
        "Conditions on record: {}",
        updated.map(|p| p.conditions.len()).unwrap_or_default()
    );

    if let Some((key_id, origin)) = provider.data_key() {
        println!("Data key {key_id} ({origin:?})");
    }
    println!("Key audit log written to: {}", audit_path.display());
    println!("Master key file: {}", key_path.display());

    Ok(())
}
