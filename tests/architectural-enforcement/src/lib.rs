//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`. They enforce the cache's
//! concurrency rules on production code:
//! - No blocking filesystem or network I/O; everything goes through `tokio`
//! - No sleeping, except between download retry attempts
//!
//! Test modules (`#[cfg(test)]` and below) are not production code and are
//! skipped.

use std::path::{Path, PathBuf};

/// Source roots checked by every rule
pub const PRODUCTION_SOURCE_DIRS: &[&str] = &["modelcache/core/src", "modelcache/cli/src"];

/// One production source file, with test code already stripped
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Lines up to (not including) the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Parse file contents
    pub fn from_content(path: impl Into<PathBuf>, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
            .map(str::to_string)
            .collect();
        Self {
            path: path.into(),
            lines,
        }
    }

    /// Non-comment part of line `idx`
    pub fn code(&self, idx: usize) -> &str {
        let line = &self.lines[idx];
        line.split("//").next().unwrap_or(line)
    }

    /// `path:line - text` for a violation report
    pub fn violation(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {what}: {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under [`PRODUCTION_SOURCE_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_SOURCE_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.push(SourceFile::from_content(relative, &content));
        }
    }

    files
}

/// Print violations and panic if there are any
pub fn report(rule: &str, violations: &[String], help: &[&str]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!();
    for line in help {
        eprintln!("  {line}");
    }

    panic!(
        "\nFound {} violation(s) of '{rule}' in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_module_is_stripped() {
        let file = SourceFile::from_content(
            "src/x.rs",
            "fn prod() {}\n\n#[cfg(test)]\nmod tests {\n    fn helper() {}\n}\n",
        );
        assert_eq!(file.lines.len(), 2);
    }

    #[test]
    fn test_code_ignores_trailing_comment() {
        let file = SourceFile::from_content("src/x.rs", "let x = 1; // std::fs::read");
        assert_eq!(file.code(0), "let x = 1; ");
    }

    #[test]
    fn test_sources_are_found() {
        let files = production_sources();
        assert!(files
            .iter()
            .any(|f| f.path.ends_with("modelcache/core/src/lib.rs")));
    }
}
