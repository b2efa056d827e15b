//! Scope guard that runs a closure when it leaves scope.

/// Runs its closure exactly once, when dropped.
///
/// The closure also runs during unwinding, so work placed in it happens no
/// matter how the enclosing scope exits.
///
/// ```
/// use tether_core::Defer;
///
/// let mut hits = 0;
/// {
///     let _guard = Defer::new(|| hits += 1);
/// }
/// assert_eq!(hits, 1);
/// ```
#[must_use = "the closure runs when the guard is dropped"]
pub struct Defer<F: FnOnce()> {
    f: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    /// Arm a guard around `f`.
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    /// Disarm the guard without running the closure.
    pub fn cancel(mut self) {
        self.f = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl<F: FnOnce()> std::fmt::Debug for Defer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Defer").field("armed", &self.f.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let hits = Cell::new(0);
        {
            let _guard = Defer::new(|| hits.set(hits.get() + 1));
            assert_eq!(hits.get(), 0);
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_cancel_skips_closure() {
        let hits = Cell::new(0);
        let guard = Defer::new(|| hits.set(1));
        guard.cancel();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_runs_during_unwind() {
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let inner = hits.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = Defer::new(move || {
                inner.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
            panic!("tick body failed");
        });
        assert!(result.is_err());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
