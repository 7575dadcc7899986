//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: The relay core runs on the async runtime and MUST NOT use
//! blocking I/O. State files go through `tokio::fs`, upstream calls through
//! async `reqwest`.
//!
//! The config loader is exempt: it runs once, before the runtime serves
//! anything.

use architectural_enforcement::{fail_on, rust_files, scan};

const EXEMPT: &[&str] = &["config/mod.rs"];

#[test]
fn test_no_blocking_io_in_core() {
    let files: Vec<_> = rust_files(&["relay/core/src"])
        .into_iter()
        .filter(|f| !EXEMPT.iter().any(|e| f.ends_with(e)))
        .collect();
    assert!(!files.is_empty(), "no core sources found");

    let violations = scan(&files, |line| {
        line.contains("std::fs")
            || line.contains("std::net::")
            || line.contains("reqwest::blocking")
            || line.contains("std::process::Command")
    });

    fail_on(
        "Blocking I/O calls found in the relay core!",
        &[
            "❌ FORBIDDEN: std::fs, std::net, std::process::Command, reqwest::blocking",
            "✅ REQUIRED: tokio::fs, tokio::net, async reqwest",
            "✅ ACCEPTABLE: config loading before the runtime starts, test code",
        ],
        &violations,
    );
}
