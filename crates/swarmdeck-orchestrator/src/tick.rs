use std::sync::atomic::{AtomicBool, Ordering};

/// Result of a periodic tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome<T> {
    /// Another tick of the same loop was still running.
    Skipped,
    Completed(T),
}

impl<T> TickOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            TickOutcome::Skipped => None,
            TickOutcome::Completed(value) => Some(value),
        }
    }
}

/// Re-entrancy guard: at most one tick of a loop runs at a time.
#[derive(Debug, Default)]
pub struct TickGuard {
    running: AtomicBool,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a tick is already in progress.
    pub fn try_acquire(&self) -> Option<TickPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit { guard: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held for the duration of a tick; releases the guard on drop.
#[derive(Debug)]
pub struct TickPermit<'a> {
    guard: &'a TickGuard,
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_exclusive() {
        let guard = TickGuard::new();
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());
        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn test_outcome_helpers() {
        let skipped: TickOutcome<u32> = TickOutcome::Skipped;
        assert!(skipped.is_skipped());
        assert_eq!(skipped.completed(), None);
        assert_eq!(TickOutcome::Completed(3).completed(), Some(3));
    }
}
