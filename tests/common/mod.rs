//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use fieldguard_core::audit::MemoryAuditSink;
use fieldguard_core::{
    ClassificationEntry, ClassificationRegistry, EncryptionOrchestrator, LocalKeyProvider,
    OperationContext, RetryPolicy, SensitivityLevel,
};

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn registry() -> ClassificationRegistry {
    ClassificationRegistry::from_entries(vec![
        ClassificationEntry::new("Identifier", "Value", SensitivityLevel::Critical),
        ClassificationEntry::new("Person", "BirthDate", SensitivityLevel::Sensitive),
        ClassificationEntry::new("Person", "Aliases", SensitivityLevel::Sensitive),
        ClassificationEntry::new("Person", "Value", SensitivityLevel::Critical),
        ClassificationEntry::new("Person", "Notes", SensitivityLevel::Internal),
    ])
    .expect("valid registry")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        ..RetryPolicy::default()
    }
}

pub struct Harness {
    pub core: EncryptionOrchestrator,
    pub sink: Arc<MemoryAuditSink>,
}

/// Orchestrator over a local provider and memory sink, with keys provisioned
/// and the provisioning records cleared from the sink.
pub async fn harness() -> Harness {
    init_tracing();
    let sink = Arc::new(MemoryAuditSink::new());
    let core = EncryptionOrchestrator::builder()
        .registry(registry())
        .provider(Arc::new(LocalKeyProvider::new()))
        .audit_sink(sink.clone())
        .retry(fast_retry())
        .build()
        .expect("orchestrator builds");
    core.provision_keys(&OperationContext::new("Identifier", "setup"))
        .await
        .expect("keys provisioned");
    sink.clear();
    Harness { core, sink }
}
