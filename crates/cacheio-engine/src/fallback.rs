//! Fallback pass-through counter
//!
//! A monotonic I/O error counter per cache. When it reaches the configured
//! threshold the cache enters pass-through mode and reads/writes bypass the
//! cache entirely until an operator resets it. Only the increment that
//! crosses the threshold logs.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

pub struct FallbackPassthrough {
    /// 0 means the mechanism is inactive
    threshold: u64,
    errors: AtomicU64,
}

impl FallbackPassthrough {
    #[must_use]
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            errors: AtomicU64::new(0),
        }
    }

    /// Count one I/O error. Returns true when this increment tripped
    /// pass-through mode.
    pub fn report_error(&self) -> bool {
        let count = self.errors.fetch_add(1, Ordering::Relaxed) + 1;
        if self.threshold != 0 && count == self.threshold {
            error!(
                errors = count,
                "I/O error threshold reached, switching to pass-through mode"
            );
            return true;
        }
        false
    }

    /// Whether the cache is in pass-through mode.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.threshold != 0 && self.errors.load(Ordering::Relaxed) >= self.threshold
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Operator reset after the underlying device recovered.
    pub fn reset(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_exactly_once() {
        let pt = FallbackPassthrough::new(3);
        assert!(!pt.report_error());
        assert!(!pt.report_error());
        assert!(!pt.is_active());
        assert!(pt.report_error());
        assert!(pt.is_active());
        // further errors count but do not re-trip
        assert!(!pt.report_error());
        assert_eq!(pt.error_count(), 4);
    }

    #[test]
    fn test_inactive_when_threshold_zero() {
        let pt = FallbackPassthrough::new(0);
        for _ in 0..100 {
            assert!(!pt.report_error());
        }
        assert!(!pt.is_active());
    }

    #[test]
    fn test_reset() {
        let pt = FallbackPassthrough::new(1);
        pt.report_error();
        assert!(pt.is_active());
        pt.reset();
        assert!(!pt.is_active());
        assert_eq!(pt.error_count(), 0);
    }
}
