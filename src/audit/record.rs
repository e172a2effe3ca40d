//! Audit record schema.
//!
//! Records carry identifiers and outcomes only. They never hold plaintext,
//! ciphertext, or key material.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::classification::SensitivityLevel;
use crate::context::OperationContext;
use crate::error::ErrorKind;
use crate::key::KeyVersionId;

/// `prev_hash` of the first record in a trail.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// A field was encrypted
    Encrypt,
    /// A field was decrypted
    Decrypt,
    /// A key level was rotated
    KeyRotation,
    /// A payload did not satisfy the classification table
    ClassificationViolation,
    /// The key provider failed
    ProviderFailure,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOperation::Encrypt => write!(f, "encrypt"),
            AuditOperation::Decrypt => write!(f, "decrypt"),
            AuditOperation::KeyRotation => write!(f, "key_rotation"),
            AuditOperation::ClassificationViolation => write!(f, "classification_violation"),
            AuditOperation::ProviderFailure => write!(f, "provider_failure"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Operation succeeded
    Success,
    /// Operation failed
    Failure,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Compliance severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine, low-impact event
    Low,
    /// Event on personal data
    Medium,
    /// Event on critical data or key material
    High,
}

impl Severity {
    /// Severity for an operation on a field of `level`.
    pub fn for_level(level: SensitivityLevel) -> Self {
        match level {
            SensitivityLevel::Critical => Severity::High,
            SensitivityLevel::Sensitive => Severity::Medium,
            SensitivityLevel::Internal => Severity::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// One append-only audit record.
///
/// Built with [`AuditRecord::new`] and the `with_*` methods, then sealed by
/// the [`AuditTrail`](super::AuditTrail), which assigns the ordinal, the
/// previous-record hash, and the retention deadline.
///
/// # Example
///
/// ```
/// use fieldguard_core::audit::{AuditOperation, AuditOutcome, AuditRecord, Severity};
/// use fieldguard_core::{OperationContext, SensitivityLevel};
///
/// let ctx = OperationContext::new("Identifier", "clerk@example.com");
/// let record = AuditRecord::new(AuditOperation::Encrypt, &ctx)
///     .with_field("Value")
///     .with_classification(SensitivityLevel::Critical);
///
/// assert_eq!(record.actor(), "clerk@example.com");
/// assert_eq!(record.severity(), Severity::High);
/// assert_eq!(record.outcome(), AuditOutcome::Success);
/// ```
// BREAKING CHANGE WARNING: Never add a field that can hold a field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    id: Uuid,
    ordinal: u64,
    actor: String,
    operation: AuditOperation,
    entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    classification: Option<SensitivityLevel>,
    severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_version_id: Option<KeyVersionId>,
    timestamp: DateTime<Utc>,
    outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    correlation_id: String,
    retain_until: DateTime<Utc>,
    prev_hash: String,
}

impl AuditRecord {
    /// Creates an unsealed Success record for `operation` under `ctx`.
    pub fn new(operation: AuditOperation, ctx: &OperationContext) -> Self {
        let timestamp = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ordinal: 0,
            actor: ctx.actor().to_string(),
            operation,
            entity_type: ctx.entity_type().to_string(),
            entity_id: ctx.entity_id().map(str::to_string),
            field_name: None,
            classification: None,
            severity: Severity::Low,
            key_version_id: None,
            timestamp,
            outcome: AuditOutcome::Success,
            error_kind: None,
            correlation_id: ctx.correlation_id().to_string(),
            retain_until: timestamp,
            prev_hash: GENESIS_HASH.to_string(),
        }
    }

    /// Sets the field name.
    pub fn with_field(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    /// Sets the sensitivity level and derives severity from it.
    pub fn with_classification(mut self, level: SensitivityLevel) -> Self {
        self.classification = Some(level);
        self.severity = Severity::for_level(level);
        self
    }

    /// Overrides the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the key version involved.
    pub fn with_key_version(mut self, id: KeyVersionId) -> Self {
        self.key_version_id = Some(id);
        self
    }

    /// Marks the record as a failure of `kind`.
    pub fn failed(mut self, kind: ErrorKind) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.error_kind = Some(kind);
        self
    }

    pub(crate) fn seal(&mut self, ordinal: u64, prev_hash: String, retain_until: DateTime<Utc>) {
        self.ordinal = ordinal;
        self.prev_hash = prev_hash;
        self.retain_until = retain_until;
    }

    /// SHA-256 of the record's canonical JSON, hex encoded.
    ///
    /// # Panics
    ///
    /// Never in practice: every field is a string, integer, enum, UUID or
    /// timestamp, all of which serialize infallibly.
    pub fn hash(&self) -> String {
        let json = serde_json::to_vec(self).expect("audit record fields always serialize to JSON");
        hex::encode(Sha256::digest(&json))
    }

    /// Returns the record id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the position in the trail, starting at 1.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Returns who performed the operation.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Returns the operation.
    pub fn operation(&self) -> AuditOperation {
        self.operation
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the entity id, if known.
    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    /// Returns the field name, if the record concerns a single field.
    pub fn field_name(&self) -> Option<&str> {
        self.field_name.as_deref()
    }

    /// Returns the sensitivity level, if known.
    pub fn classification(&self) -> Option<SensitivityLevel> {
        self.classification
    }

    /// Returns the severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns the key version involved, if any.
    pub fn key_version_id(&self) -> Option<&KeyVersionId> {
        self.key_version_id.as_ref()
    }

    /// Returns when the record was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the outcome.
    pub fn outcome(&self) -> AuditOutcome {
        self.outcome
    }

    /// Returns the error kind for failures.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Returns the correlation id.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Returns the end of the compliance retention period.
    pub fn retain_until(&self) -> DateTime<Utc> {
        self.retain_until
    }

    /// Returns the hash of the preceding record.
    pub fn prev_hash(&self) -> &str {
        &self.prev_hash
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {}",
            self.ordinal, self.operation, self.outcome, self.entity_type
        )?;
        if let Some(field) = &self.field_name {
            write!(f, ".{}", field)?;
        }
        write!(f, " by {} [{}]", self.actor, self.correlation_id)
    }
}
