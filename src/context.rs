use uuid::Uuid;

use crate::logging::OpLog;

/// Explicit context threaded through every orchestrator call.
///
/// Nothing in the pipeline reads "current user" or "current request" from
/// ambient state. The caller states who is acting, on which entity, under which
/// correlation id, and every log line, error and audit record is derived from
/// this value.
///
/// # Examples
///
/// ```
/// use fieldguard_core::OperationContext;
///
/// let ctx = OperationContext::new("Identifier", "user-42")
///     .with_entity_id("ident-7")
///     .with_correlation_id("req-123");
///
/// assert_eq!(ctx.entity_type(), "Identifier");
/// assert_eq!(ctx.entity_id(), Some("ident-7"));
/// assert_eq!(ctx.actor(), "user-42");
/// assert_eq!(ctx.correlation_id(), "req-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    entity_type: String,
    entity_id: Option<String>,
    actor: String,
    correlation_id: String,
}

impl OperationContext {
    /// Creates a context for `actor` operating on `entity_type`.
    ///
    /// A fresh UUID v4 correlation id is generated; override it with
    /// [`with_correlation_id`](Self::with_correlation_id) to join an
    /// upstream request.
    pub fn new(entity_type: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: None,
            actor: actor.into(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Sets the identifier of the entity instance being processed.
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Returns a copy of this context bound to a different entity type.
    ///
    /// Used by entity-level calls whose `entity_type` argument differs from
    /// the one the context was created with.
    pub fn for_entity_type(&self, entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..self.clone()
        }
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the entity id, if set.
    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    /// Returns the acting principal.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Returns the correlation id.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Returns a logger bound to this context.
    pub fn log(&self) -> OpLog<'_> {
        OpLog::new(&self.correlation_id, &self.entity_type, &self.actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_generates_correlation_id() {
        let a = OperationContext::new("Person", "user-1");
        let b = OperationContext::new("Person", "user-1");

        assert!(!a.correlation_id().is_empty());
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert!(a.entity_id().is_none());
    }

    #[test]
    fn for_entity_type_keeps_other_fields() {
        let ctx = OperationContext::new("Person", "user-1")
            .with_entity_id("p-9")
            .with_correlation_id("corr-9");

        let rebound = ctx.for_entity_type("Identifier");

        assert_eq!(rebound.entity_type(), "Identifier");
        assert_eq!(rebound.entity_id(), Some("p-9"));
        assert_eq!(rebound.actor(), "user-1");
        assert_eq!(rebound.correlation_id(), "corr-9");
    }

    #[test]
    fn log_is_bound_to_correlation_id() {
        let ctx = OperationContext::new("Asset", "svc-ingest").with_correlation_id("corr-log");
        assert_eq!(ctx.log().correlation_id(), "corr-log");
    }
}
