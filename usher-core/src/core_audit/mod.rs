//! Audit log
//!
//! Append-only JSON-lines ledger of invite lifecycle transitions. Every other
//! piece of state in the crate is a projection of this log.

pub mod log;
pub mod record;

pub use log::{latest_open_issuance, read_records, AuditError, AuditLog, AuditResult};
pub use record::{AuditAction, AuditRecord};
