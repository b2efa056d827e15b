//! The periodic slicer.
//!
//! A slicer is a self-rearming timer on the I/O thread. Each tick runs the
//! session's housekeeping (keepalive enforcement, cross-thread queue
//! draining) and then decides, in a [`Defer`] finalizer, whether to schedule
//! the next tick. Scheduled ticks hold only a [`Weak`] reference, so a tick
//! that fires after its session was destroyed does nothing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tether_core::{Defer, Tick, ticks};

/// Slicer timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlicerConfig {
    /// Delay before the first tick.
    pub first_tick: Duration,
    /// Delay between subsequent ticks.
    pub interval: Duration,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            first_tick: Duration::from_millis(300),
            interval: Duration::from_millis(20),
        }
    }
}

impl SlicerConfig {
    pub fn first_tick(mut self, delay: Duration) -> Self {
        self.first_tick = delay;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// A session driven by a [`Slicer`].
pub trait SliceTarget: Send + Sync + 'static {
    /// The slicer owned by this target.
    fn slicer(&self) -> &Slicer;

    /// One tick of housekeeping.
    fn slice(&self, now: Tick);

    /// Whether another tick should be scheduled after this one.
    fn keep_running(&self) -> bool;
}

/// Scheduling state for one session's ticks.
#[derive(Debug)]
pub struct Slicer {
    config: SlicerConfig,
    running: AtomicBool,
    ticks: AtomicU64,
}

impl Slicer {
    pub fn new(config: SlicerConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> SlicerConfig {
        self.config
    }

    /// Whether a tick is scheduled or running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Schedule the first tick of `target`'s slicer on the current runtime.
    ///
    /// Returns `false` if the slicer is already running.
    pub fn start<T: SliceTarget>(target: &Arc<T>) -> bool {
        let slicer = target.slicer();
        if slicer
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(target: "tether_net::slicer", first_tick = ?slicer.config.first_tick, "slicer started");
        schedule(Arc::downgrade(target), slicer.config.first_tick);
        true
    }
}

fn schedule<T: SliceTarget>(target: Weak<T>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(target) = target.upgrade() {
            run_tick(&target);
        }
    });
}

fn run_tick<T: SliceTarget>(target: &Arc<T>) {
    let slicer = target.slicer();
    let _rearm = Defer::new(|| {
        if target.keep_running() {
            schedule(Arc::downgrade(target), slicer.config.interval);
        } else {
            slicer.running.store(false, Ordering::Release);
            tracing::debug!(target: "tether_net::slicer", ticks = slicer.tick_count(), "slicer stopped");
        }
    });

    slicer.ticks.fetch_add(1, Ordering::Relaxed);
    target.slice(ticks::now());
}
