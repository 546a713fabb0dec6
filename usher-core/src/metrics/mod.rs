//! Metrics for invite lifecycle observability
//!
//! Thin wrappers over the `metrics` facade. No recorder is installed here;
//! the embedding process picks its exporter.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const INVITES_ISSUED: &str = "usher.invites.issued";
pub const INVITES_DEDUPE_HITS: &str = "usher.invites.dedupe_hits";
pub const INVITES_SUPERSEDED: &str = "usher.invites.superseded";
pub const INVITES_CONSUMED: &str = "usher.invites.consumed";
pub const INVITES_ABUSED: &str = "usher.invites.abused";
pub const INVITES_FALLBACK: &str = "usher.invites.fallback";
pub const INVITES_EXPIRED: &str = "usher.invites.expired";
pub const GATEWAY_FAILURES: &str = "usher.gateway.failures";
pub const WATCHERS_ACTIVE: &str = "usher.watchers.active";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(INVITES_ISSUED, "Invites created on the gateway");
    describe_counter!(INVITES_DEDUPE_HITS, "Issuance requests answered from the dedupe cache");
    describe_counter!(INVITES_SUPERSEDED, "Pending invites displaced by a newer one");
    describe_counter!(INVITES_CONSUMED, "Invites consumed by their intended recipient");
    describe_counter!(INVITES_ABUSED, "Joins by someone other than the intended recipient");
    describe_counter!(INVITES_FALLBACK, "Joins reconciled from the audit log");
    describe_counter!(INVITES_EXPIRED, "Pending invites closed by the expiry sweep");
    describe_counter!(GATEWAY_FAILURES, "Failed gateway calls");
    describe_gauge!(WATCHERS_ACTIVE, "Armed consumption watchers");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gateway failure tagged with the operation
pub fn record_gateway_failure(operation: &'static str) {
    counter!(GATEWAY_FAILURES, "operation" => operation).increment(1);
}

/// Record the number of armed watchers
pub fn record_watchers(active: usize) {
    gauge!(WATCHERS_ACTIVE).set(active as f64);
}
