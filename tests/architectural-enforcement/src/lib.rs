//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the rules under `tests/`. Each rule enforces one
//! architectural principle of the relay crates:
//! - No blocking `sleep()` calls in production code
//! - No blocking I/O in the async core
//! - No `unwrap()` / `expect()` outside test code
//! - Logging is initialized by the daemon only, and the core never prints
//! - Credential secrets never reach a log statement
//!
//! Test code is everything from a file's `#[cfg(test)]` module onward.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Source roots checked by every rule
pub const PRODUCTION_ROOTS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// Macros whose arguments end up in logs
const LOG_MACROS: &[&str] = &[
    "trace!(", "debug!(", "info!(", "warn!(", "error!(", "event!(",
];

/// A rule violation at a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub file: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending source text
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.text.trim())
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// Every `.rs` file under `roots`, relative to the workspace root
pub fn rust_files(roots: &[&str]) -> Vec<PathBuf> {
    let base = workspace_root();
    let mut files: Vec<PathBuf> = roots
        .iter()
        .flat_map(|root| WalkDir::new(base.join(root)).into_iter().filter_map(Result::ok))
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|ext| ext == "rs"))
        .collect();
    files.sort();
    files
}

/// Non-test source lines of `content` with their 1-based numbers, comments
/// dropped
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect()
}

/// Lines in production code of `files` for which `matches` holds
pub fn scan(files: &[PathBuf], matches: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = fs::read_to_string(file) else {
            continue;
        };
        for (line, text) in production_lines(&content) {
            if matches(text) {
                violations.push(Violation {
                    file: file.clone(),
                    line,
                    text: text.to_string(),
                });
            }
        }
    }
    violations
}

/// Log macro invocations in production code whose arguments satisfy `matches`
///
/// Multi-line invocations are joined up to the closing `);`.
pub fn scan_log_statements(files: &[PathBuf], matches: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let Ok(content) = fs::read_to_string(file) else {
            continue;
        };
        let lines = production_lines(&content);
        let mut i = 0;
        while i < lines.len() {
            let (start, text) = lines[i];
            if !LOG_MACROS.iter().any(|m| text.contains(m)) {
                i += 1;
                continue;
            }
            let mut statement = String::from(text);
            while !statement.trim_end().ends_with(");") && i + 1 < lines.len() {
                i += 1;
                statement.push(' ');
                statement.push_str(lines[i].1.trim());
            }
            if matches(&statement) {
                violations.push(Violation {
                    file: file.clone(),
                    line: start,
                    text: statement,
                });
            }
            i += 1;
        }
    }
    violations
}

/// Production files of the relay crates
///
/// # Panics
///
/// If the sources cannot be found, which means the workspace moved.
pub fn production_files() -> Vec<PathBuf> {
    let files = rust_files(PRODUCTION_ROOTS);
    assert!(
        files.len() > 10,
        "expected to find the relay sources under {}",
        workspace_root().display()
    );
    files
}

/// Print `violations` with `hints` and fail the calling test
///
/// # Panics
///
/// Whenever `violations` is non-empty.
pub fn fail_on(title: &str, hints: &[&str], violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ CRITICAL: {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    if !hints.is_empty() {
        eprintln!();
        for hint in hints {
            eprintln!("  {hint}");
        }
    }

    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// x.unwrap()\nfn b() {}\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}"), (3, "fn b() {}")]);
    }

    #[test]
    fn test_multiline_log_statements_are_joined() {
        let dir = std::env::temp_dir().join(format!("arch-enforce-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.rs");
        fs::write(
            &file,
            "fn f() {\n    tracing::info!(\n        credential = %id,\n        key = %lease.secret,\n        \"Added\"\n    );\n}\n",
        )
        .unwrap();

        let violations = scan_log_statements(&[file], |s| s.contains(".secret"));
        fs::remove_dir_all(&dir).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn test_sources_are_found() {
        let files = production_files();
        assert!(files.iter().any(|f| f.ends_with("relay/core/src/driver.rs")));
        assert!(files.iter().any(|f| f.ends_with("relay/daemon/src/main.rs")));
    }

    #[test]
    #[should_panic(expected = "Found 1 violation(s)")]
    fn test_fail_on_panics_with_count() {
        fail_on(
            "demo",
            &[],
            &[Violation {
                file: PathBuf::from("a.rs"),
                line: 3,
                text: "x.unwrap()".into(),
            }],
        );
    }
}
