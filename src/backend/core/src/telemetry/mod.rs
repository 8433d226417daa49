//! Telemetry: structured logging and metric descriptions.
//!
//! Counters are recorded through the `metrics` facade where the events
//! happen; the embedding binary decides which recorder (if any) to install.

pub mod logging;

pub use logging::{build_filter, init_logging, LogFormat, LoggingConfig};

use metrics::{describe_counter, Unit};

pub const DECISIONS_TOTAL: &str = "bastion_decisions_total";
pub const BYPASS_ATTEMPTS_TOTAL: &str = "bastion_bypass_attempts_total";
pub const ERRORS_TOTAL: &str = "bastion_errors_total";
pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "bastion_audit_write_failures_total";

/// Register descriptions for every counter the crate emits.
pub fn describe_metrics() {
    describe_counter!(
        DECISIONS_TOTAL,
        Unit::Count,
        "Access decisions by outcome and reason"
    );
    describe_counter!(
        BYPASS_ATTEMPTS_TOTAL,
        Unit::Count,
        "Requests that named a tenant other than the caller's"
    );
    describe_counter!(ERRORS_TOTAL, Unit::Count, "Errors by code");
    describe_counter!(
        AUDIT_WRITE_FAILURES_TOTAL,
        Unit::Count,
        "Audit records that could not be written"
    );
}
