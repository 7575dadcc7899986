//! Integration Test: Error Propagation
//!
//! **Policy**: Production code returns errors with `?` instead of panicking
//! on them. `unwrap()` and `expect()` belong in tests only.

use architectural_enforcement::{fail_on, production_files, scan};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(&production_files(), |line| {
        line.contains(".unwrap()") || line.contains(".expect(")
    });

    fail_on(
        "unwrap()/expect() found in production code!",
        &[
            "✅ REQUIRED: propagate with `?`, or fall back with unwrap_or/unwrap_or_else",
        ],
        &violations,
    );
}
