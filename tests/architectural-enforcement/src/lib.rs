//! Architectural Enforcement
//!
//! Source scanners backing the workspace's architectural tests:
//! - No sleep() calls in production code; readers wait on buffer
//!   notifications, never on timers
//!
//! Exceptions are narrow: exponential backoff in reconnect logic, periodic
//! `tokio::time::interval` tasks, and test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Where a sleep call is tolerated
#[derive(Clone, Copy, Debug, Default)]
pub struct SleepPolicy {
    /// Allow sleeps that implement exponential backoff
    pub allow_backoff: bool,
    /// Allow sleeps inside `#[test]` / `#[tokio::test]` functions
    pub allow_tests: bool,
}

/// Workspace root, resolved from this crate's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Scan every `.rs` file under `dir`, appending violations
pub fn check_directory(dir: &Path, violations: &mut Vec<String>, policy: &SleepPolicy) {
    if !dir.exists() {
        return;
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            if let Ok(content) = fs::read_to_string(entry.path()) {
                check_source(entry.path(), &content, violations, policy);
            }
        }
    }
}

/// Scan one file's contents
pub fn check_source(
    path: &Path,
    content: &str,
    violations: &mut Vec<String>,
    policy: &SleepPolicy,
) {
    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        // Skip comments
        let code_part = line.split("//").next().unwrap_or(line);

        if !(code_part.contains("::sleep(") || code_part.contains(".sleep(")) {
            continue;
        }
        if policy.allow_tests && is_in_test_function(&lines, idx) {
            continue;
        }
        if policy.allow_backoff && is_backoff_context(&lines, idx) {
            continue;
        }
        if is_interval_pattern(&lines, idx) {
            continue;
        }

        violations.push(format!("{}:{} - {}", path.display(), idx + 1, line.trim()));
    }
}

/// Check if line is inside a test function
pub fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }

        // A non-test function or a module boundary comes first
        let is_fn = line.starts_with("fn ") || line.starts_with("async fn ");
        if (is_fn && !line.contains("test"))
            || line.starts_with("mod ")
            || line.starts_with("impl ")
        {
            return false;
        }
    }
    false
}

/// Check if sleep is used for exponential backoff
///
/// Requires both a doubling calculation and retry vocabulary within 15
/// lines before or 5 lines after the call.
pub fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[context_range] {
        let line = line.to_lowercase();

        if line.contains("<<") || line.contains("pow") || line.contains("* 2") {
            has_backoff_calc = true;
        }
        if line.contains("retry")
            || line.contains("reconnect")
            || line.contains("backoff")
            || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

/// Check if this is a `tokio::time::interval` loop
pub fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let before = current_idx.saturating_sub(20)..current_idx;
    if lines[before]
        .iter()
        .any(|line| line.contains("interval.tick()") || line.contains("tokio::time::interval"))
    {
        return true;
    }

    let after = current_idx..std::cmp::min(current_idx + 5, lines.len());
    lines[after].iter().any(|line| line.contains("interval.tick()"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(code: &[&str], policy: SleepPolicy) -> Vec<String> {
        let mut violations = Vec::new();
        check_source(Path::new("x.rs"), &code.join("\n"), &mut violations, &policy);
        violations
    }

    #[test]
    fn test_sleep_violation_detection() {
        let code = [
            "async fn wait_for_tokens() {",
            "    while buffer.len().await == 0 {",
            "        tokio::time::sleep(Duration::from_millis(10)).await;",
            "    }",
            "}",
        ];

        let violations = scan(
            &code,
            SleepPolicy {
                allow_backoff: true,
                allow_tests: true,
            },
        );
        assert_eq!(violations.len(), 1);
        assert!(violations[0].starts_with("x.rs:3"));
        assert!(!is_in_test_function(&code, 2));
    }

    #[test]
    fn test_commented_sleep_ignored() {
        let code = ["fn f() {", "    // tokio::time::sleep(d).await;", "}"];
        assert!(scan(&code, SleepPolicy::default()).is_empty());
    }

    #[test]
    fn test_backoff_detection() {
        let code = [
            "async fn reconnect() {",
            "    let delay = base_delay * (1 << attempt);",
            "    tracing::info!(attempt, \"Reconnecting\");",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];

        assert!(is_backoff_context(&code, 3));
        assert!(scan(
            &code,
            SleepPolicy {
                allow_backoff: true,
                allow_tests: false,
            }
        )
        .is_empty());
        assert_eq!(scan(&code, SleepPolicy::default()).len(), 1);
    }

    #[test]
    fn test_sleep_in_test_function() {
        let code = [
            "#[tokio::test]",
            "async fn test_slow() {",
            "    tokio::time::sleep(d).await;",
            "}",
        ];
        assert!(is_in_test_function(&code, 2));
    }

    #[test]
    fn test_interval_detection() {
        let code = [
            "let mut interval = tokio::time::interval(period);",
            "loop {",
            "    interval.tick().await;",
            "    tokio::time::sleep(d).await;",
            "}",
        ];
        assert!(is_interval_pattern(&code, 3));
    }
}
