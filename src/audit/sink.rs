//! Audit sinks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::AuditRecord;
use crate::error::{Error, ErrorKind, Result};

/// Durable destination for sealed audit records.
///
/// `append` must only return `Ok` once every record in the batch is durable.
/// A batch is written as a unit: either all records are stored or the call
/// fails.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends a batch of sealed records.
    async fn append(&self, records: &[AuditRecord]) -> Result<()>;
}

/// In-memory sink with optional fault injection.
///
/// # Example
///
/// ```
/// use fieldguard_core::audit::{AuditSink, MemoryAuditSink};
///
/// let sink = MemoryAuditSink::new();
/// sink.fail_next(1);
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// assert!(sink.append(&[]).await.is_err());
/// assert!(sink.append(&[]).await.is_ok());
/// # });
/// assert_eq!(sink.attempts(), 2);
/// ```
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Makes every append fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns a snapshot of stored records in append order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Returns how many times `append` was called.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Removes all stored records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(Error::new(
                ErrorKind::AuditWriteFailure,
                "injected audit sink failure",
            ));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Sink that emits each record as a structured event on the
/// `fieldguard_audit` tracing target.
///
/// Durability is whatever the installed subscriber provides.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    /// Creates the sink.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        for record in records {
            tracing::info!(
                target: "fieldguard_audit",
                id = %record.id(),
                ordinal = record.ordinal(),
                operation = %record.operation(),
                outcome = %record.outcome(),
                severity = %record.severity(),
                actor = %record.actor(),
                entity_type = %record.entity_type(),
                entity_id = record.entity_id(),
                field = record.field_name(),
                classification = record.classification().map(|l| l.as_str()),
                key_version_id = record.key_version_id().map(|k| k.as_str()),
                error_kind = record.error_kind().map(|k| k.as_str()),
                correlation_id = %record.correlation_id(),
                retain_until = %record.retain_until(),
                prev_hash = %record.prev_hash(),
                "audit record"
            );
        }
        Ok(())
    }
}
