//! Classified error taxonomy for the encryption core.
//!
//! Every failure carries an [`ErrorKind`] that call sites must match on, plus an
//! [`ErrorContext`] with enough metadata (entity type, field name, correlation id)
//! to diagnose the failure. Messages never contain plaintext or key material.

use std::fmt;

use thiserror::Error as ThisError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of failure.
///
/// Only [`ErrorKind::ProviderTransient`] is retryable; every other kind is
/// permanent and propagates to the caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Field has no classification entry for the entity type.
    NotClassified,
    /// A classified field holds something other than a string.
    UnsupportedFieldType,
    /// No usable key: no Active key for the level, or an unknown key version.
    KeyUnavailable,
    /// The referenced key version is retired and past its overlap window.
    KeyExpired,
    /// Retryable provider failure (timeout, throttling, temporary outage).
    ProviderTransient,
    /// Non-retryable provider failure, or transient failures past the retry ceiling.
    ProviderPermanent,
    /// A required audit record could not be written durably.
    AuditWriteFailure,
    /// Envelope could not be decoded or names an unsupported format.
    MalformedEnvelope,
    /// Configuration or classification table is invalid.
    InvalidConfiguration,
    /// The persistence collaborator failed.
    Persistence,
}

impl ErrorKind {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ProviderTransient)
    }

    /// Stable snake_case name, used in logs and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotClassified => "not_classified",
            ErrorKind::UnsupportedFieldType => "unsupported_field_type",
            ErrorKind::KeyUnavailable => "key_unavailable",
            ErrorKind::KeyExpired => "key_expired",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderPermanent => "provider_permanent",
            ErrorKind::AuditWriteFailure => "audit_write_failure",
            ErrorKind::MalformedEnvelope => "malformed_envelope",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::Persistence => "persistence",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic metadata attached to an error.
///
/// Holds identifiers only. It must never carry field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Entity type being processed
    pub entity_type: Option<String>,
    /// Field name being processed
    pub field_name: Option<String>,
    /// Correlation id of the originating call
    pub correlation_id: Option<String>,
}

impl ErrorContext {
    /// Returns `true` if no metadata has been attached.
    pub fn is_empty(&self) -> bool {
        self.entity_type.is_none() && self.field_name.is_none() && self.correlation_id.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        f.write_str(" [")?;
        let mut first = true;
        let parts = [
            ("entity_type", &self.entity_type),
            ("field", &self.field_name),
            ("correlation_id", &self.correlation_id),
        ];
        for (label, value) in parts {
            if let Some(value) = value {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{}={}", label, value)?;
                first = false;
            }
        }
        f.write_str("]")
    }
}

/// Error returned by every fallible operation in this crate.
///
/// # Examples
///
/// ```
/// use fieldguard_core::{Error, ErrorKind};
///
/// let err = Error::new(ErrorKind::NotClassified, "no classification entry")
///     .with_entity_type("Identifier")
///     .with_field("nonsense");
///
/// assert_eq!(err.kind(), ErrorKind::NotClassified);
/// assert_eq!(
///     err.to_string(),
///     "not_classified: no classification entry [entity_type=Identifier, field=nonsense]"
/// );
/// ```
#[derive(Debug, Clone, ThisError)]
#[error("{kind}: {message}{context}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    context: ErrorContext,
}

impl Error {
    /// Creates a new error with no context attached.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Shorthand for [`ErrorKind::NotClassified`].
    pub fn not_classified(entity_type: &str, field_name: &str) -> Self {
        Self::new(ErrorKind::NotClassified, "no classification entry for field")
            .with_entity_type(entity_type)
            .with_field(field_name)
    }

    /// Shorthand for [`ErrorKind::UnsupportedFieldType`].
    pub fn unsupported_field_type(found: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedFieldType,
            format!("classified field holds a {} value, expected string", found),
        )
    }

    /// Shorthand for [`ErrorKind::InvalidConfiguration`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, message)
    }

    /// Shorthand for [`ErrorKind::MalformedEnvelope`].
    pub fn malformed_envelope(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedEnvelope, message)
    }

    /// Sets the entity type unless one is already present.
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        if self.context.entity_type.is_none() {
            self.context.entity_type = Some(entity_type.into());
        }
        self
    }

    /// Sets the field name unless one is already present.
    pub fn with_field(mut self, field_name: impl Into<String>) -> Self {
        if self.context.field_name.is_none() {
            self.context.field_name = Some(field_name.into());
        }
        self
    }

    /// Sets the correlation id unless one is already present.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        if self.context.correlation_id.is_none() {
            self.context.correlation_id = Some(correlation_id.into());
        }
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the diagnostic context.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Returns `true` if the error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
