use serde_json::json;

use fieldvault::schema::compile;
use fieldvault::{Algorithm, FieldSpec, FleError, KeyId, Namespace, Patient, Record};

fn patients() -> Namespace {
    "fhir.patients".parse().unwrap()
}

#[test]
fn test_patient_schema_shape() {
    let schema = compile(&KeyId::new("abc123"), &patients(), Patient::ENCRYPTED_FIELDS).unwrap();

    let det = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic";
    let rnd = "AEAD_AES_256_CBC_HMAC_SHA_512-Random";
    let expected = json!({
        "bsonType": "object",
        "encryptMetadata": {
            "keyId": [{ "$binary": { "base64": "abc123", "subType": "04" } }]
        },
        "properties": {
            "patientId": { "encrypt": { "bsonType": "string", "algorithm": det } },
            "firstName": { "encrypt": { "bsonType": "string", "algorithm": rnd } },
            "lastName": { "encrypt": { "bsonType": "string", "algorithm": rnd } },
            "address": { "encrypt": { "bsonType": "string", "algorithm": rnd } },
            "postalCode": { "encrypt": { "bsonType": "string", "algorithm": rnd } }
        }
    });

    assert_eq!(schema.document(), &expected);
    assert_eq!(schema.key_ids(), vec!["abc123".to_string()]);
    assert_eq!(schema.namespace(), &patients());
}

#[test]
fn test_two_field_table_binds_one_key() {
    let ns: Namespace = "records.subjects".parse().unwrap();
    let fields = FieldSpec::table([("subjectId", true), ("address", false)]);
    let schema = compile(&KeyId::new("abc123"), &ns, &fields).unwrap();

    assert_eq!(schema.key_ids(), vec!["abc123".to_string()]);
    assert_eq!(schema.namespace(), &ns);
    assert_eq!(schema.field("subjectId").map(|f| f.algorithm), Some(Algorithm::Deterministic));
    assert_eq!(schema.field("address").map(|f| f.algorithm), Some(Algorithm::Random));
    assert_eq!(schema.fields().count(), 2);

    let properties = &schema.document()["properties"];
    assert_eq!(
        properties["subjectId"]["encrypt"]["algorithm"],
        "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
    );
    assert_eq!(
        properties["address"]["encrypt"]["algorithm"],
        "AEAD_AES_256_CBC_HMAC_SHA_512-Random"
    );
}

#[test]
fn test_compile_is_pure() {
    let key = KeyId::new("abc123");
    let a = compile(&key, &patients(), Patient::ENCRYPTED_FIELDS).unwrap();
    let b = compile(&key, &patients(), Patient::ENCRYPTED_FIELDS).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
}

#[test]
fn test_empty_key_id_is_config_error() {
    let err = compile(&KeyId::new(""), &patients(), Patient::ENCRYPTED_FIELDS).unwrap_err();
    assert!(matches!(err, FleError::Config(_)));
}

#[test]
fn test_empty_field_table_still_binds_key() {
    let schema = compile(&KeyId::new("abc123"), &patients(), &[]).unwrap();
    assert_eq!(schema.document()["properties"], json!({}));
    assert_eq!(schema.key_ids(), vec!["abc123".to_string()]);
}

#[test]
fn test_empty_field_name_is_rejected() {
    let fields = [FieldSpec::random("")];
    assert!(matches!(
        compile(&KeyId::new("abc123"), &patients(), &fields),
        Err(FleError::Config(_))
    ));
}
