//! Tamper-evident compliance audit trail.
//!
//! This module provides:
//! - `AuditRecord`: Append-only record schema with retention metadata
//! - `AuditSink`: Durable destination for sealed records
//! - `MemoryAuditSink` / `TracingAuditSink`: In-memory and log-backed sinks
//! - `AuditTrail`: Seals records into a SHA-256 hash chain and applies the
//!   write-failure policy
//!
//! Records are safe by default:
//! - No plaintext, ciphertext, or key material
//! - Only identifiers, levels, key version ids, and error kinds

mod record;
mod sink;
mod trail;

pub use record::{AuditOperation, AuditOutcome, AuditRecord, Severity, GENESIS_HASH};
pub use sink::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use trail::{AuditConfig, AuditTrail, ChainVerification, WritePolicy};
