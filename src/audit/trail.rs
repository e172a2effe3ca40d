//! Hash-chained audit trail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{AuditRecord, AuditSink, GENESIS_HASH};
use crate::classification::{ClassificationEntry, SensitivityLevel};
use crate::error::{Error, ErrorKind, Result};
use crate::retry::RetryPolicy;

/// What happens when the sink rejects a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// The operation fails with `AuditWriteFailure`.
    Blocking,
    /// The failure is logged and the batch retried in the background.
    BestEffort,
}

impl WritePolicy {
    /// Policy for operations on fields classified by `entry`.
    pub fn for_entry(entry: &ClassificationEntry) -> Self {
        if entry.require_audit() {
            WritePolicy::Blocking
        } else {
            Self::for_level(entry.level())
        }
    }

    /// Policy for operations at `level`.
    pub fn for_level(level: SensitivityLevel) -> Self {
        match level {
            SensitivityLevel::Critical => WritePolicy::Blocking,
            SensitivityLevel::Sensitive | SensitivityLevel::Internal => WritePolicy::BestEffort,
        }
    }

    /// Returns the stricter of two policies.
    pub fn stricter(self, other: WritePolicy) -> WritePolicy {
        if self == WritePolicy::Blocking || other == WritePolicy::Blocking {
            WritePolicy::Blocking
        } else {
            WritePolicy::BestEffort
        }
    }
}

/// Retention settings, in days per sensitivity level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Retention for Critical records
    pub critical_retention_days: u32,
    /// Retention for Sensitive records
    pub sensitive_retention_days: u32,
    /// Retention for Internal records
    pub internal_retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            critical_retention_days: 2555,
            sensitive_retention_days: 1095,
            internal_retention_days: 365,
        }
    }
}

impl AuditConfig {
    /// Retention period for records at `level`.
    ///
    /// Records with no level, such as classification violations on unknown
    /// fields, get the longest configured period.
    pub fn retention(&self, level: Option<SensitivityLevel>) -> Duration {
        let days = match level {
            Some(SensitivityLevel::Critical) => self.critical_retention_days,
            Some(SensitivityLevel::Sensitive) => self.sensitive_retention_days,
            Some(SensitivityLevel::Internal) => self.internal_retention_days,
            None => self
                .critical_retention_days
                .max(self.sensitive_retention_days)
                .max(self.internal_retention_days),
        };
        Duration::days(i64::from(days))
    }

    /// Rejects zero retention periods.
    pub fn validate(&self) -> Result<()> {
        let all = [
            self.critical_retention_days,
            self.sensitive_retention_days,
            self.internal_retention_days,
        ];
        if all.contains(&0) {
            return Err(Error::invalid_config("audit retention days must be positive"));
        }
        Ok(())
    }
}

/// Result of verifying a sequence of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// Number of records checked
    pub total_records: u64,
    /// `true` if every `prev_hash` matches its consecutive predecessor
    pub chain_intact: bool,
    /// Ordinal of the first record whose `prev_hash` does not match, or
    /// that repeats an ordinal
    pub first_break_at: Option<u64>,
    /// Ordinals absent from the sequence
    pub missing_ordinals: Vec<u64>,
    /// First and last ordinal seen
    pub ordinal_range: Option<(u64, u64)>,
}

impl ChainVerification {
    /// Returns `true` if the chain is intact and has no gaps.
    pub fn is_valid(&self) -> bool {
        self.chain_intact && self.missing_ordinals.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ChainHead {
    next_ordinal: u64,
    last_hash: String,
}

/// Append-only audit trail.
///
/// Each batch is sealed under a short synchronous lock, which assigns
/// ordinals, links every record to the hash of its predecessor, and sets the
/// retention deadline. The sink write happens after the lock is released.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use fieldguard_core::audit::{AuditOperation, AuditRecord, AuditTrail, MemoryAuditSink, WritePolicy};
/// use fieldguard_core::OperationContext;
///
/// let sink = Arc::new(MemoryAuditSink::new());
/// let trail = AuditTrail::new(sink.clone());
/// let ctx = OperationContext::new("Identifier", "clerk");
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// trail
///     .record(vec![AuditRecord::new(AuditOperation::Encrypt, &ctx)], WritePolicy::Blocking)
///     .await
///     .unwrap();
/// # });
///
/// assert_eq!(sink.len(), 1);
/// assert!(AuditTrail::verify_chain(&sink.records(), fieldguard_core::audit::GENESIS_HASH).is_valid());
/// ```
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    retry: RetryPolicy,
    head: Mutex<ChainHead>,
    pending_retries: Arc<AtomicUsize>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("config", &self.config)
            .field("next_ordinal", &self.next_ordinal())
            .finish()
    }
}

impl AuditTrail {
    /// Creates a trail that starts at the genesis hash.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            config: AuditConfig::default(),
            retry: RetryPolicy::default(),
            head: Mutex::new(ChainHead {
                next_ordinal: 1,
                last_hash: GENESIS_HASH.to_string(),
            }),
            pending_retries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets the retention config.
    pub fn with_config(mut self, config: AuditConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the policy used for background retries.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Continues an existing chain after `last_ordinal` / `last_hash`.
    pub fn resume(self, last_ordinal: u64, last_hash: impl Into<String>) -> Self {
        *self.head.lock() = ChainHead {
            next_ordinal: last_ordinal + 1,
            last_hash: last_hash.into(),
        };
        self
    }

    /// Returns the retention config.
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Returns the ordinal the next sealed record will get.
    pub fn next_ordinal(&self) -> u64 {
        self.head.lock().next_ordinal
    }

    /// Returns the hash of the most recently sealed record.
    pub fn last_hash(&self) -> String {
        self.head.lock().last_hash.clone()
    }

    /// Returns the number of background retries still running.
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::SeqCst)
    }

    /// Seals and appends `records` as one batch.
    ///
    /// # Errors
    ///
    /// With [`WritePolicy::Blocking`], a sink failure returns
    /// [`ErrorKind::AuditWriteFailure`]. With [`WritePolicy::BestEffort`] this
    /// never fails.
    pub async fn record(&self, records: Vec<AuditRecord>, policy: WritePolicy) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let (sealed, before) = self.seal(records);

        let err = match self.sink.append(&sealed).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        match policy {
            WritePolicy::Blocking => {
                self.unseal(&sealed, before);
                tracing::error!(
                    count = sealed.len(),
                    first_ordinal = sealed[0].ordinal(),
                    error = %err,
                    "required audit write failed"
                );
                Err(Error::new(
                    ErrorKind::AuditWriteFailure,
                    format!("audit sink rejected {} record(s)", sealed.len()),
                ))
            }
            WritePolicy::BestEffort => {
                tracing::warn!(
                    count = sealed.len(),
                    first_ordinal = sealed[0].ordinal(),
                    error = %err,
                    "audit write failed, retrying in background"
                );
                self.retry_in_background(sealed);
                Ok(())
            }
        }
    }

    fn seal(&self, records: Vec<AuditRecord>) -> (Vec<AuditRecord>, ChainHead) {
        let mut head = self.head.lock();
        let before = head.clone();
        let sealed = records
            .into_iter()
            .map(|mut record| {
                let retain_until = record.timestamp() + self.config.retention(record.classification());
                record.seal(head.next_ordinal, head.last_hash.clone(), retain_until);
                head.last_hash = record.hash();
                head.next_ordinal += 1;
                record
            })
            .collect();
        (sealed, before)
    }

    /// Rewinds the chain head if nothing was sealed after `sealed`.
    ///
    /// Otherwise the ordinals stay consumed and show up as a gap.
    fn unseal(&self, sealed: &[AuditRecord], before: ChainHead) {
        let Some(last) = sealed.last() else {
            return;
        };
        let mut head = self.head.lock();
        if head.next_ordinal == last.ordinal() + 1 {
            *head = before;
        } else {
            tracing::warn!(
                first_ordinal = sealed[0].ordinal(),
                last_ordinal = last.ordinal(),
                "unwritten audit records leave a gap in the chain"
            );
        }
    }

    fn retry_in_background(&self, sealed: Vec<AuditRecord>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::error!(
                    count = sealed.len(),
                    "no async runtime for audit retry, records dropped"
                );
                return;
            }
        };

        let sink = Arc::clone(&self.sink);
        let retry = self.retry.clone();
        let pending = Arc::clone(&self.pending_retries);
        pending.fetch_add(1, Ordering::SeqCst);

        handle.spawn(async move {
            for attempt in 1..=retry.max_attempts {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                match sink.append(&sealed).await {
                    Ok(()) => {
                        tracing::info!(
                            count = sealed.len(),
                            attempt,
                            "audit records written after retry"
                        );
                        pending.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(attempt, error = %err, "audit retry failed");
                    }
                }
            }
            tracing::error!(
                count = sealed.len(),
                first_ordinal = sealed[0].ordinal(),
                "audit records dropped after retries"
            );
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Verifies the hash chain and ordinal continuity of `records`.
    ///
    /// Records are checked in ordinal order, whatever order they are given
    /// in. `expected_prev_hash` is what the first record's `prev_hash` should
    /// be; use [`GENESIS_HASH`] for a trail verified from the start.
    ///
    /// Hash links are only checked between consecutive ordinals. A record
    /// after a gap points at a record that was sealed but never stored (a
    /// dropped best-effort batch or a cancelled write), so the gap is
    /// reported in `missing_ordinals` and does not break `chain_intact`.
    pub fn verify_chain(records: &[AuditRecord], expected_prev_hash: &str) -> ChainVerification {
        let mut ordered: Vec<&AuditRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.ordinal());

        let (first, last) = match (ordered.first(), ordered.last()) {
            (Some(first), Some(last)) => (first.ordinal(), last.ordinal()),
            _ => {
                return ChainVerification {
                    total_records: 0,
                    chain_intact: true,
                    first_break_at: None,
                    missing_ordinals: Vec::new(),
                    ordinal_range: None,
                }
            }
        };

        let mut first_break_at = None;
        let mut missing_ordinals = Vec::new();
        let mut prev_hash = expected_prev_hash.to_string();
        let mut prev_ordinal: Option<u64> = None;

        for record in ordered {
            let linked = match prev_ordinal {
                None => true,
                Some(prev) if record.ordinal() == prev => {
                    // Two records cannot share an ordinal.
                    first_break_at.get_or_insert(record.ordinal());
                    false
                }
                Some(prev) if record.ordinal() > prev + 1 => {
                    missing_ordinals.extend(prev + 1..record.ordinal());
                    false
                }
                Some(_) => true,
            };
            if linked && record.prev_hash() != prev_hash {
                first_break_at.get_or_insert(record.ordinal());
            }
            prev_hash = record.hash();
            prev_ordinal = Some(record.ordinal());
        }

        ChainVerification {
            total_records: records.len() as u64,
            chain_intact: first_break_at.is_none(),
            first_break_at,
            missing_ordinals,
            ordinal_range: Some((first, last)),
        }
    }
}
