//! Integration Test: Logging Discipline
//!
//! **Policy**:
//! - Only the daemon installs a tracing subscriber
//! - The core reports through `tracing`, never by printing
//! - Credential secrets never appear in a log statement; log the id

use architectural_enforcement::{fail_on, production_files, rust_files, scan, scan_log_statements};

#[test]
fn test_core_never_initializes_logging() {
    let violations = scan(&rust_files(&["relay/core/src"]), |line| {
        line.contains("tracing_subscriber::fmt") || line.contains("set_global_default")
    });

    fail_on(
        "Logging initialized inside the relay core!",
        &["✅ REQUIRED: init_logging() in relay-daemon only"],
        &violations,
    );
}

#[test]
fn test_core_never_prints() {
    let violations = scan(&rust_files(&["relay/core/src"]), |line| {
        line.contains("println!(") || line.contains("eprintln!(") || line.contains("dbg!(")
    });

    fail_on(
        "Printing found in the relay core!",
        &["✅ REQUIRED: tracing::{debug, info, warn, error}"],
        &violations,
    );
}

#[test]
fn test_secrets_never_logged() {
    let violations = scan_log_statements(&production_files(), |statement| {
        statement.contains(".secret") || statement.contains("secret =")
    });

    fail_on(
        "Credential secret passed to a log statement!",
        &["✅ REQUIRED: log the credential id, never the secret"],
        &violations,
    );
}
