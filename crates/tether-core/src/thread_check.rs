//! Thread affinity checks.
//!
//! Connection state may only be touched from the I/O thread that owns it. A
//! [`ThreadAffinity`] records the owning thread when an object is created so
//! that entry points can reject, or assert against, calls from elsewhere.
//!
//! ```
//! use tether_core::ThreadAffinity;
//!
//! let affinity = ThreadAffinity::current();
//! assert!(affinity.is_same_thread());
//! ```

use std::thread::ThreadId;

/// Records the thread an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self::current()
    }
}

impl ThreadAffinity {
    /// Bind to the calling thread.
    #[inline]
    pub fn current() -> Self {
        Self {
            thread_id: std::thread::current().id(),
        }
    }

    /// Bind to an explicit thread.
    #[inline]
    pub fn of(thread_id: ThreadId) -> Self {
        Self { thread_id }
    }

    /// The bound thread's id.
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the calling thread is the bound thread.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Panic if called from a thread other than the bound one.
    #[track_caller]
    pub fn assert_same_thread(&self) {
        if !self.is_same_thread() {
            let current = std::thread::current();
            panic!(
                "thread affinity violation: bound to {:?}, called from {:?} ({})",
                self.thread_id,
                current.id(),
                current.name().unwrap_or("<unnamed>")
            );
        }
    }

    /// Like [`assert_same_thread`](Self::assert_same_thread), debug builds only.
    #[inline]
    #[track_caller]
    pub fn debug_assert_same_thread(&self) {
        #[cfg(debug_assertions)]
        self.assert_same_thread();
    }
}
