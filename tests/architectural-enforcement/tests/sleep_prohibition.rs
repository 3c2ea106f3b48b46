//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep to wait for events. Callers
//! wait on channels (`watch`, `broadcast`) and I/O instead.
//! **Exception**: exponential backoff between download retry attempts.

use architectural_enforcement::{production_sources, report, SourceFile};

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(sleep_violations)
        .collect();

    report(
        "Sleep in production code",
        &violations,
        &[
            "✅ ACCEPTABLE: exponential backoff in retry logic, test code",
            "❌ FORBIDDEN: sleep in polling loops or as synchronization",
        ],
    );
}

fn sleep_violations(file: &SourceFile) -> Vec<String> {
    (0..file.lines.len())
        .filter(|&idx| {
            let code = file.code(idx);
            (code.contains("::sleep(") || code.contains(".sleep(")) && !is_backoff_context(file, idx)
        })
        .map(|idx| file.violation(idx, "Sleep call"))
        .collect()
}

/// A shift or power computing the delay plus retry wording nearby
fn is_backoff_context(file: &SourceFile, idx: usize) -> bool {
    let range = idx.saturating_sub(15)..std::cmp::min(idx + 5, file.lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;
    for line in &file.lines[range] {
        let line = line.to_lowercase();
        if line.contains("<<") || line.contains("pow") {
            has_backoff_calc = true;
        }
        if line.contains("retry") || line.contains("attempt") || line.contains("backoff") {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

#[test]
fn test_polling_sleep_is_flagged() {
    let file = SourceFile::from_content(
        "src/poll.rs",
        "async fn wait_ready() {\n    loop {\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n",
    );
    assert_eq!(sleep_violations(&file).len(), 1);
}

#[test]
fn test_backoff_sleep_is_allowed() {
    let file = SourceFile::from_content(
        "src/retry.rs",
        "async fn fetch() {\n    let delay = base.saturating_mul(1u64 << attempt);\n    tracing::warn!(attempt, \"retrying\");\n    tokio::time::sleep(Duration::from_millis(delay)).await;\n}\n",
    );
    assert!(sleep_violations(&file).is_empty());
}
