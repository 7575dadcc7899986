//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT block a runtime worker with
//! `std::thread::sleep`. Waiting is done with `tokio::time`.

use architectural_enforcement::{fail_on, production_files, scan};

#[test]
fn test_no_blocking_sleep_in_production_code() {
    let violations = scan(&production_files(), |line| line.contains("thread::sleep"));

    fail_on(
        "Blocking sleep() calls found in production code!",
        &[
            "❌ FORBIDDEN: std::thread::sleep(...)",
            "✅ REQUIRED: tokio::time::sleep(...).await, tokio::time::interval",
        ],
        &violations,
    );
}
