//! Counters for failures the monitor swallows
//!
//! Nothing the monitor does is allowed to fail loudly inside the host, so
//! every skipped unit, rejected hook and dropped timing is counted here.
//! Tests assert on these counts; the demo prints them.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Category of a swallowed failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Reflection or binary parsing failed while enumerating a module
    Introspection,
    /// A specific hook could not be attached
    Installation,
    /// A post-call arrived without a matching pre-call
    TimingMismatch,
    /// A hook could not be detached
    Teardown,
}

/// Live counters, shared between the controller and its hook bodies
#[derive(Debug, Default)]
pub struct Diagnostics {
    introspection_failures: AtomicU64,
    installation_failures: AtomicU64,
    timing_mismatches: AtomicU64,
    teardown_failures: AtomicU64,
    ineligible_skipped: AtomicU64,
    hooks_installed: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Introspection => &self.introspection_failures,
            FailureKind::Installation => &self.installation_failures,
            FailureKind::TimingMismatch => &self.timing_mismatches,
            FailureKind::Teardown => &self.teardown_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A candidate was rejected by policy (trivial body, installs hooks)
    pub fn record_ineligible(&self) {
        self.ineligible_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_installed(&self) {
        self.hooks_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            introspection_failures: self.introspection_failures.load(Ordering::Relaxed),
            installation_failures: self.installation_failures.load(Ordering::Relaxed),
            timing_mismatches: self.timing_mismatches.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
            ineligible_skipped: self.ineligible_skipped.load(Ordering::Relaxed),
            hooks_installed: self.hooks_installed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Diagnostics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub introspection_failures: u64,
    pub installation_failures: u64,
    pub timing_mismatches: u64,
    pub teardown_failures: u64,
    pub ineligible_skipped: u64,
    pub hooks_installed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(Diagnostics::new().snapshot(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn test_each_kind_has_its_own_counter() {
        let diag = Diagnostics::new();
        diag.record_failure(FailureKind::Introspection);
        diag.record_failure(FailureKind::Installation);
        diag.record_failure(FailureKind::Installation);
        diag.record_failure(FailureKind::TimingMismatch);
        diag.record_failure(FailureKind::Teardown);
        diag.record_ineligible();
        diag.record_installed();

        let snap = diag.snapshot();
        assert_eq!(snap.introspection_failures, 1);
        assert_eq!(snap.installation_failures, 2);
        assert_eq!(snap.timing_mismatches, 1);
        assert_eq!(snap.teardown_failures, 1);
        assert_eq!(snap.ineligible_skipped, 1);
        assert_eq!(snap.hooks_installed, 1);
    }
}
