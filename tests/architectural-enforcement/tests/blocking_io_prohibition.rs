//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code in the cache MUST NOT use blocking I/O.
//! **Required**: Use `tokio::fs` and async `reqwest`, not `std::fs`,
//! `std::net` or `reqwest::blocking`. Blocking OS calls (free-space probing)
//! go through `tokio::task::spawn_blocking`.

use architectural_enforcement::{production_sources, report, SourceFile};

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(blocking_io_violations)
        .collect();

    report(
        "Blocking I/O in production code",
        &violations,
        &[
            "❌ FORBIDDEN: std::fs::*, std::net::*, reqwest::blocking::*, std::process::Command",
            "✅ REQUIRED: tokio::fs::*, reqwest::Client, tokio::process::Command",
            "✅ ACCEPTABLE: test code, tokio::task::spawn_blocking closures",
        ],
    );
}

fn blocking_io_violations(file: &SourceFile) -> Vec<String> {
    let mut violations = Vec::new();

    for idx in 0..file.lines.len() {
        let code = file.code(idx);

        if code.contains("std::fs::") || code.contains("use std::fs") {
            violations.push(file.violation(idx, "Blocking file I/O"));
        }
        if code.contains("std::net::") || code.contains("use std::net") {
            violations.push(file.violation(idx, "Blocking network I/O"));
        }
        if code.contains("reqwest::blocking") {
            violations.push(file.violation(idx, "Blocking HTTP client"));
        }
        if code.contains("std::process::Command") {
            violations.push(file.violation(idx, "Blocking process I/O"));
        }
    }

    violations
}

#[test]
fn test_detector_flags_blocking_calls() {
    let file = SourceFile::from_content(
        "src/bad.rs",
        "async fn load() {\n    let raw = std::fs::read(\"blob.bin\");\n    let c = reqwest::blocking::get(url);\n}\n",
    );
    assert_eq!(blocking_io_violations(&file).len(), 2);
}

#[test]
fn test_detector_ignores_comments_and_tests() {
    let file = SourceFile::from_content(
        "src/ok.rs",
        "// never std::fs::read here\nasync fn load() {\n    tokio::fs::read(p).await;\n}\n#[cfg(test)]\nmod tests {\n    use std::fs;\n}\n",
    );
    assert!(blocking_io_violations(&file).is_empty());
}
