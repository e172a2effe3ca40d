mod common;

use std::sync::Arc;

use fieldguard_core::audit::{
    AuditOperation, AuditOutcome, AuditRecord, AuditTrail, MemoryAuditSink, Severity,
    GENESIS_HASH,
};
use fieldguard_core::{
    EncryptedValue, EncryptionOrchestrator, ErrorKind, LocalKeyProvider, MemoryPersistence,
    OperationContext, Secret, SensitivityLevel,
};
use serde_json::json;

#[test]
fn secret_is_fully_redacted() {
    let value = Secret::new("A1234567".to_string());

    let debug_out = format!("{:?}", value);
    assert_eq!(debug_out, "[REDACTED]");
    assert!(!debug_out.contains("A123"));
    assert!(!debug_out.contains("String"));

    assert_eq!(format!("{}", value), "[REDACTED]");
}

#[tokio::test]
async fn critical_identifier_round_trip() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Identifier", "clerk@example.com").with_entity_id("id-42");

    let envelope = h.core.encrypt_field("A1234567", "Value", &ctx).await.unwrap();
    assert_eq!(envelope.key_version_id().as_str(), "critical-v1");
    assert_eq!(envelope.algorithm_name(), "AES-256-GCM");
    assert!(!envelope.to_token().unwrap().contains("A1234567"));

    let plain = h.core.decrypt_field(&envelope, "Value", &ctx).await.unwrap();
    assert_eq!(plain.expose_secret(), "A1234567");

    let records = h.sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].operation(), AuditOperation::Encrypt);
    assert_eq!(records[1].operation(), AuditOperation::Decrypt);
    for record in &records {
        assert_eq!(record.outcome(), AuditOutcome::Success);
        assert_eq!(record.actor(), "clerk@example.com");
        assert_eq!(record.entity_id(), Some("id-42"));
        assert_eq!(record.classification(), Some(SensitivityLevel::Critical));
        assert_eq!(record.severity(), Severity::High);
        assert_eq!(record.key_version_id().map(|id| id.as_str()), Some("critical-v1"));
        assert_eq!(record.correlation_id(), ctx.correlation_id());
    }
}

#[tokio::test]
async fn unclassified_field_is_refused_without_audit() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Identifier", "clerk");

    let err = h.core.encrypt_field("x", "nonsense", &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotClassified);
    assert_eq!(err.context().entity_type.as_deref(), Some("Identifier"));
    assert_eq!(err.context().field_name.as_deref(), Some("nonsense"));
    assert_eq!(h.sink.len(), 0);
}

#[tokio::test]
async fn field_names_are_case_insensitive() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Identifier", "clerk");

    let envelope = h.core.encrypt_field("A1234567", "VALUE", &ctx).await.unwrap();
    let plain = h.core.decrypt_field(&envelope, "value", &ctx).await.unwrap();
    assert_eq!(plain.expose_secret(), "A1234567");
}

#[tokio::test]
async fn tampered_token_is_malformed() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Identifier", "clerk");

    let envelope = h.core.encrypt_field("A1234567", "Value", &ctx).await.unwrap();
    let mut token = envelope.to_token().unwrap();
    token.push('!');
    let err = EncryptedValue::from_token(&token).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);

    let err = EncryptedValue::from_token("plain text").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
}

#[tokio::test]
async fn envelope_is_bound_to_its_field() {
    let h = common::harness().await;
    let identifier = OperationContext::new("Identifier", "clerk");
    let person = OperationContext::new("Person", "clerk");

    let envelope = h.core.encrypt_field("A1234567", "Value", &identifier).await.unwrap();
    let err = h.core.decrypt_field(&envelope, "Value", &person).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);

    let failure = h.sink.records().pop().unwrap();
    assert_eq!(failure.operation(), AuditOperation::Decrypt);
    assert_eq!(failure.outcome(), AuditOutcome::Failure);
    assert_eq!(failure.error_kind(), Some(ErrorKind::MalformedEnvelope));
}

#[tokio::test]
async fn corrupted_nonce_is_malformed_not_a_provider_failure() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Identifier", "clerk");

    let envelope = h.core.encrypt_field("A1234567", "Value", &ctx).await.unwrap();
    let mut raw = serde_json::to_value(&envelope).unwrap();
    raw["nonce"] = json!("AAAAAAAAAAA=");
    let corrupted: EncryptedValue = serde_json::from_value(raw).unwrap();
    assert_eq!(corrupted.nonce().len(), 8);

    let err = h.core.decrypt_field(&corrupted, "Value", &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);

    let failure = h.sink.records().pop().unwrap();
    assert_eq!(failure.operation(), AuditOperation::Decrypt);
    assert_eq!(failure.error_kind(), Some(ErrorKind::MalformedEnvelope));
}

#[tokio::test]
async fn entity_round_trip_preserves_structure() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Person", "clerk");
    let person = json!({
        "Name": "Ada",
        "BirthDate": "1815-12-10",
        "Aliases": ["Countess", "Enchantress"],
        "Documents": [
            { "Kind": "passport", "Value": "A1234567" }
        ],
        "Age": 36
    });

    let sealed = h.core.encrypt_entity(&person, "Person", &ctx).await.unwrap();
    assert_eq!(sealed["Name"], "Ada");
    assert_eq!(sealed["Age"], 36);
    assert_eq!(sealed["Documents"][0]["Kind"], "passport");
    for leaf in [
        &sealed["BirthDate"],
        &sealed["Aliases"][0],
        &sealed["Aliases"][1],
        &sealed["Documents"][0]["Value"],
    ] {
        assert!(EncryptedValue::is_token(leaf.as_str().unwrap()));
    }
    let keys: Vec<_> = sealed.as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, ["Name", "BirthDate", "Aliases", "Documents", "Age"]);

    let opened = h.core.decrypt_entity(&sealed, "Person", &ctx).await.unwrap();
    assert_eq!(opened, person);

    // One record per protected leaf, per direction.
    assert_eq!(h.sink.len(), 8);
}

#[tokio::test]
async fn entity_without_classified_fields_is_unchanged() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Person", "clerk");
    let payload = json!({ "Name": "Ada", "Age": 36 });

    let out = h.core.encrypt_entity(&payload, "Person", &ctx).await.unwrap();
    assert_eq!(out, payload);
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn decrypting_plaintext_entity_fails() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Person", "clerk");
    let payload = json!({ "BirthDate": "1815-12-10" });

    let err = h.core.decrypt_entity(&payload, "Person", &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    assert_eq!(h.sink.len(), 1);
}

#[tokio::test]
async fn audit_records_never_contain_values() {
    let h = common::harness().await;
    let ctx = OperationContext::new("Person", "clerk");
    let payload = json!({ "BirthDate": "1815-12-10", "Notes": "prefers tea" });

    let sealed = h.core.encrypt_entity(&payload, "Person", &ctx).await.unwrap();
    h.core.decrypt_entity(&sealed, "Person", &ctx).await.unwrap();

    let dump = serde_json::to_string(&h.sink.records()).unwrap();
    assert!(!dump.contains("1815-12-10"));
    assert!(!dump.contains("prefers tea"));
    assert!(!dump.contains(sealed["BirthDate"].as_str().unwrap()));
}

#[tokio::test]
async fn audit_chain_detects_tampering() {
    common::init_tracing();
    let sink = Arc::new(MemoryAuditSink::new());
    let core = EncryptionOrchestrator::builder()
        .registry(common::registry())
        .provider(Arc::new(LocalKeyProvider::new()))
        .audit_sink(sink.clone())
        .build()
        .unwrap();
    let ctx = OperationContext::new("Identifier", "clerk");
    core.provision_keys(&ctx).await.unwrap();
    for value in ["A1", "B2", "C3"] {
        core.encrypt_field(value, "Value", &ctx).await.unwrap();
    }

    let records = sink.records();
    let verification = core.verify_audit_chain(&records);
    assert!(verification.is_valid());
    assert_eq!(verification.total_records, records.len() as u64);
    assert_eq!(verification.ordinal_range, Some((1, records.len() as u64)));

    // Rewrite the actor of one record.
    let mut tampered = records.clone();
    let mut raw = serde_json::to_value(&tampered[2]).unwrap();
    raw["actor"] = json!("mallory");
    tampered[2] = serde_json::from_value::<AuditRecord>(raw).unwrap();
    let verification = AuditTrail::verify_chain(&tampered, GENESIS_HASH);
    assert!(!verification.chain_intact);
    assert_eq!(verification.first_break_at, Some(tampered[3].ordinal()));

    // Drop one record.
    let mut gapped = records.clone();
    let removed = gapped.remove(1);
    let verification = AuditTrail::verify_chain(&gapped, GENESIS_HASH);
    assert!(!verification.is_valid());
    assert!(verification.chain_intact);
    assert_eq!(verification.missing_ordinals, vec![removed.ordinal()]);
}

#[tokio::test]
async fn stored_fields_are_loaded_back() {
    common::init_tracing();
    let store = Arc::new(MemoryPersistence::new());
    let core = EncryptionOrchestrator::builder()
        .registry(common::registry())
        .provider(Arc::new(LocalKeyProvider::new()))
        .audit_sink(Arc::new(MemoryAuditSink::new()))
        .persistence(store.clone())
        .build()
        .unwrap();
    let ctx = OperationContext::new("Person", "clerk").with_entity_id("p-7");
    core.provision_keys(&ctx).await.unwrap();

    core.store_field("1815-12-10", "BirthDate", &ctx).await.unwrap();
    let loaded = core.load_field("BirthDate", &ctx).await.unwrap().unwrap();
    assert_eq!(loaded.expose_secret(), "1815-12-10");

    store.set_unavailable(true);
    let err = core.load_field("BirthDate", &ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
}

#[tokio::test]
async fn concurrent_calls_share_one_orchestrator() {
    let h = common::harness().await;
    let core = Arc::new(h.core);

    let mut tasks = Vec::new();
    for n in 0..16 {
        let core = Arc::clone(&core);
        tasks.push(tokio::spawn(async move {
            let ctx = OperationContext::new("Identifier", format!("worker-{}", n));
            let value = format!("ID-{:04}", n);
            let envelope = core.encrypt_field(&value, "Value", &ctx).await.unwrap();
            let plain = core.decrypt_field(&envelope, "Value", &ctx).await.unwrap();
            assert_eq!(plain.expose_secret(), &value);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let records = h.sink.records();
    assert_eq!(records.len(), 32);
    let first = records.iter().map(AuditRecord::ordinal).min().unwrap();
    let prev = records
        .iter()
        .find(|r| r.ordinal() == first)
        .map(|r| r.prev_hash().to_string())
        .unwrap();
    assert!(AuditTrail::verify_chain(&records, &prev).is_valid());
}
