//! Policy-driven field-level encryption with versioned keys and a
//! tamper-evident audit trail.
//!
//! Sensitive fields are protected according to a classification table, not
//! per call site:
//! - **Classification**: every (entity type, field) pair maps to a
//!   [`SensitivityLevel`]; unclassified fields are refused, never passed through
//! - **Versioned keys**: one Active key per level, with Retiring and Retired
//!   versions kept decryptable for an overlap window after rotation
//! - **Envelopes**: ciphertext travels with the key version id that sealed it
//! - **Audit**: every encrypt, decrypt and rotation appends a hash-chained
//!   record before the call returns
//!
//! # Core Types
//!
//! - [`EncryptionOrchestrator`]: The single entry point for all operations
//! - [`ClassificationRegistry`]: Field to sensitivity level lookup
//! - [`KeyManager`]: Key versions and rotation over a [`KeyProviderGateway`]
//! - [`EncryptedValue`]: Serializable envelope around a protected value
//! - [`Secret<T>`]: Wrapper that redacts and zeroizes decrypted values
//! - [`audit::AuditTrail`]: Append-only, hash-chained compliance trail
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use fieldguard_core::{EncryptionOrchestrator, CoreConfig, LocalKeyProvider, OperationContext};
//! use fieldguard_core::audit::MemoryAuditSink;
//! use serde_json::json;
//!
//! let config = CoreConfig::from_toml_str(r#"
//!     [[classification]]
//!     entity_type = "Identifier"
//!     field_name = "Value"
//!     level = "critical"
//! "#).unwrap();
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let core = EncryptionOrchestrator::builder()
//!     .config(&config)
//!     .unwrap()
//!     .provider(Arc::new(LocalKeyProvider::new()))
//!     .audit_sink(Arc::new(MemoryAuditSink::new()))
//!     .build()
//!     .unwrap();
//!
//! let ctx = OperationContext::new("Identifier", "clerk");
//! core.provision_keys(&ctx).await.unwrap();
//!
//! let record = json!({ "Type": "passport", "Value": "A1234567" });
//! let sealed = core.encrypt_entity(&record, "Identifier", &ctx).await.unwrap();
//! assert_eq!(sealed["Type"], "passport");
//! assert_ne!(sealed["Value"], "A1234567");
//!
//! let opened = core.decrypt_entity(&sealed, "Identifier", &ctx).await.unwrap();
//! assert_eq!(opened, record);
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
mod cipher;
mod classification;
mod config;
mod context;
mod error;
mod key;
mod logging;
mod orchestrator;
mod persistence;
mod retry;
mod secret;
mod transform;

pub use cipher::{CipherAlgorithm, EncryptedValue, FieldCipher, ENVELOPE_PREFIX, ENVELOPE_VERSION};
pub use classification::{ClassificationEntry, ClassificationRegistry, SensitivityLevel};
pub use config::{ClassificationConfig, CoreConfig, RotationConfig, CONFIG_ENV_VAR};
pub use context::OperationContext;
pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use key::{
    KeyHandle, KeyManager, KeyManagerConfig, KeyProtection, KeyProviderGateway, KeyStatus,
    KeyVersion, KeyVersionId, LocalKeyProvider, PendingRotation, ProviderError,
    ProviderErrorKind, SealedPayload,
};
pub use logging::OpLog;
pub use orchestrator::{EncryptionOrchestrator, OrchestratorBuilder};
pub use persistence::{BlobKey, MemoryPersistence, PersistenceGateway};
pub use retry::RetryPolicy;
pub use secret::Secret;
pub use transform::{Direction, FieldReplacement, FieldTarget, PayloadTransformer};
