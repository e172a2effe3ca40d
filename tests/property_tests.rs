//! Integration property tests for fieldguard-core.
//!
//! These tests validate cross-module invariants and end-to-end flows
//! using property-based testing.

mod common;

use fieldguard_core::audit::AuditTrail;
use fieldguard_core::{EncryptedValue, ErrorKind, OperationContext, ENVELOPE_PREFIX};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// Strategy: unclassified field names for the Person entity
fn arb_plain_key() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}_x").unwrap()
}

// Strategy: unclassified leaf values
fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        ".{0,12}".prop_map(Value::String),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: any string survives a field round trip
    #[test]
    fn proptest_field_round_trip(value in ".{0,64}") {
        let rt = runtime();
        let plain = rt.block_on(async {
            let h = common::harness().await;
            let ctx = OperationContext::new("Identifier", "clerk");
            let envelope = h.core.encrypt_field(&value, "Value", &ctx).await.unwrap();
            h.core.decrypt_field(&envelope, "Value", &ctx).await.unwrap()
        });
        prop_assert_eq!(plain.expose_secret(), &value);
    }

    /// Property: entity encryption only touches classified leaves
    ///
    /// Unclassified keys keep their values and their order; every classified
    /// string becomes an envelope token, and decryption restores the input.
    #[test]
    fn proptest_entity_structure_preserved(
        plain in prop::collection::btree_map(arb_plain_key(), arb_leaf(), 0..6),
        birth in ".{0,16}",
        aliases in prop::collection::vec(".{0,8}", 0..4),
    ) {
        let mut map = Map::new();
        for (key, leaf) in &plain {
            map.insert(key.clone(), leaf.clone());
        }
        map.insert("BirthDate".to_string(), json!(birth));
        map.insert("Aliases".to_string(), json!(aliases));
        let payload = Value::Object(map);

        let rt = runtime();
        let (sealed, opened) = rt.block_on(async {
            let h = common::harness().await;
            let ctx = OperationContext::new("Person", "clerk");
            let sealed = h.core.encrypt_entity(&payload, "Person", &ctx).await.unwrap();
            let opened = h.core.decrypt_entity(&sealed, "Person", &ctx).await.unwrap();
            (sealed, opened)
        });

        let in_keys: Vec<_> = payload.as_object().unwrap().keys().collect();
        let out_keys: Vec<_> = sealed.as_object().unwrap().keys().collect();
        prop_assert_eq!(in_keys, out_keys);

        for (key, leaf) in &plain {
            prop_assert_eq!(&sealed[key.as_str()], leaf);
        }
        prop_assert!(EncryptedValue::is_token(sealed["BirthDate"].as_str().unwrap()));
        let sealed_aliases = sealed["Aliases"].as_array().unwrap();
        prop_assert_eq!(sealed_aliases.len(), aliases.len());
        for alias in sealed_aliases {
            prop_assert!(EncryptedValue::is_token(alias.as_str().unwrap()));
        }

        prop_assert_eq!(opened, payload);
    }

    /// Property: parsing arbitrary tokens never panics
    #[test]
    fn proptest_token_parsing_never_panics(body in ".{0,64}") {
        let token = format!("{}{}", ENVELOPE_PREFIX, body);
        if let Err(err) = EncryptedValue::from_token(&token) {
            prop_assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        }
    }

    /// Property: dropping an interior record from a trail is detected
    #[test]
    fn proptest_chain_detects_missing_record(count in 3usize..10, drop_at in 1usize..9) {
        // Never the first or last record: those only shift the range.
        let drop_at = drop_at % (count - 2) + 1;
        let rt = runtime();
        let records = rt.block_on(async {
            let h = common::harness().await;
            let ctx = OperationContext::new("Identifier", "clerk");
            for n in 0..count {
                h.core.encrypt_field(&n.to_string(), "Value", &ctx).await.unwrap();
            }
            h.sink.records()
        });
        let start = records[0].prev_hash().to_string();
        prop_assert!(AuditTrail::verify_chain(&records, &start).is_valid());

        let mut gapped = records.clone();
        let removed = gapped.remove(drop_at);
        let verification = AuditTrail::verify_chain(&gapped, &start);
        prop_assert!(!verification.is_valid());
        prop_assert_eq!(verification.missing_ordinals, vec![removed.ordinal()]);
    }
}
