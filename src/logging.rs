use std::fmt;

/// A context-bound structured logger.
///
/// `OpLog` is obtained from [`OperationContext::log`](crate::OperationContext::log).
/// Every event it emits carries `correlation_id`, `entity_type` and `actor`
/// as structured fields so log lines can be joined with audit records.
///
/// Callers pass field names, levels, and key version ids only. Field values
/// must never be formatted into a log message; decrypted values are wrapped in
/// [`Secret`](crate::Secret) and render as `[REDACTED]` if they slip through.
#[derive(Debug, Clone, Copy)]
pub struct OpLog<'a> {
    correlation_id: &'a str,
    entity_type: &'a str,
    actor: &'a str,
}

impl<'a> OpLog<'a> {
    pub(crate) fn new(correlation_id: &'a str, entity_type: &'a str, actor: &'a str) -> Self {
        Self {
            correlation_id,
            entity_type,
            actor,
        }
    }

    /// Returns the correlation id associated with this logger.
    pub fn correlation_id(&self) -> &str {
        self.correlation_id
    }

    /// Logs an info-level message.
    pub fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            entity_type = %self.entity_type,
            actor = %self.actor,
            "{}",
            args
        );
    }

    /// Logs a warning-level message.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(
            correlation_id = %self.correlation_id,
            entity_type = %self.entity_type,
            actor = %self.actor,
            "{}",
            args
        );
    }

    /// Logs an error-level message.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(
            correlation_id = %self.correlation_id,
            entity_type = %self.entity_type,
            actor = %self.actor,
            "{}",
            args
        );
    }

    /// Logs a debug-level message.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            entity_type = %self.entity_type,
            actor = %self.actor,
            "{}",
            args
        );
    }
}
