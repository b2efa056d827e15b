//! Millisecond tick source.
//!
//! Ticks are measured from a process-wide epoch captured on first use. Tick
//! `0` is reserved to mean "unset", so [`now`] never returns it.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// An absolute point in time, in milliseconds since the process epoch.
pub type Tick = u64;

/// The sentinel for "no deadline" / "not yet happened".
pub const UNSET: Tick = 0;

/// Current tick. Always `>= 1`.
pub fn now() -> Tick {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as Tick + 1
}

/// The tick `after` from now. Saturates at `Tick::MAX`.
pub fn deadline_after(after: Duration) -> Tick {
    let after = Tick::try_from(after.as_millis()).unwrap_or(Tick::MAX);
    now().saturating_add(after)
}

/// Whether `deadline` is set and has been reached at `now`.
#[inline]
pub fn is_expired(deadline: Tick, now: Tick) -> bool {
    deadline != UNSET && now >= deadline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_never_unset() {
        assert_ne!(now(), UNSET);
    }

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        std::thread::sleep(Duration::from_millis(5));
        let b = now();
        assert!(b >= a + 5);
    }

    #[test]
    fn test_deadline_after() {
        let before = now();
        let deadline = deadline_after(Duration::from_millis(250));
        assert!(deadline >= before + 250);
        assert!(!is_expired(deadline, before));
        assert!(is_expired(deadline, deadline));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let deadline = deadline_after(Duration::MAX);
        assert_eq!(deadline, Tick::MAX);
        assert!(!is_expired(deadline, now()));
    }

    #[test]
    fn test_unset_never_expires() {
        assert!(!is_expired(UNSET, u64::MAX));
    }
}
