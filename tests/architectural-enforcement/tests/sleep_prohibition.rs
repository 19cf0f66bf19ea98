//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in relay-core and relay-daemon MUST NOT call
//! sleep methods. Readers park on the buffer's change notification; writers
//! are driven by their producer.
//! **Exceptions**: exponential backoff (reconnect logic only), test code

use architectural_enforcement::{check_directory, workspace_root, SleepPolicy};

#[test]
fn test_no_sleep_in_production_code() {
    let root = workspace_root();
    let policy = SleepPolicy {
        allow_backoff: true,
        allow_tests: true,
    };

    let mut violations = Vec::new();
    for dir in ["relay/core/src", "relay/daemon/src"] {
        let path = root.join(dir);
        assert!(path.exists(), "missing source directory {}", path.display());
        check_directory(&path, &mut violations, &policy);
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in reconnect logic");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops (wait on TokenBuffer::wait_for_change)");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}
