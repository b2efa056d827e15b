//! The dedicated I/O thread.
//!
//! An [`IoThread`] owns one OS thread running a current-thread Tokio runtime.
//! Every socket, timer and state machine belonging to a session lives on that
//! thread, so nothing scheduled on it ever runs in parallel with anything else
//! scheduled on it. Other threads talk to it by posting futures.
//!
//! ```no_run
//! use tether_core::{IoThread, IoThreadConfig};
//!
//! let io = IoThread::spawn(IoThreadConfig::default().with_thread_name("worker-io"))?;
//! let answer = io.run_blocking(async { 6 * 7 })?;
//! assert_eq!(answer, 42);
//! io.shutdown();
//! # Ok::<(), tether_core::IoThreadError>(())
//! ```

use std::future::Future;
use std::sync::mpsc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::{IoThreadError, Result};
use crate::thread_check::ThreadAffinity;

/// Configuration for an [`IoThread`].
#[derive(Debug, Clone)]
pub struct IoThreadConfig {
    /// Name given to the OS thread.
    pub thread_name: String,
    /// Enable the I/O driver (required for sockets).
    pub enable_io: bool,
    /// Enable the time driver (required for `tokio::time`).
    pub enable_time: bool,
}

impl Default for IoThreadConfig {
    fn default() -> Self {
        Self {
            thread_name: "tether-io".to_string(),
            enable_io: true,
            enable_time: true,
        }
    }
}

impl IoThreadConfig {
    /// Set the OS thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Enable or disable the I/O driver.
    pub fn with_io(mut self, enabled: bool) -> Self {
        self.enable_io = enabled;
        self
    }

    /// Enable or disable the time driver.
    pub fn with_time(mut self, enabled: bool) -> Self {
        self.enable_time = enabled;
        self
    }
}

/// A running I/O thread.
///
/// Dropping the value shuts the thread down and joins it.
pub struct IoThread {
    name: String,
    handle: Handle,
    affinity: ThreadAffinity,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoThread {
    /// Spawn the thread and wait until its runtime is ready.
    pub fn spawn(config: IoThreadConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(Handle, ThreadId), String>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let name = config.thread_name.clone();

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let mut builder = Builder::new_current_thread();
                if config.enable_io {
                    builder.enable_io();
                }
                if config.enable_time {
                    builder.enable_time();
                }

                let runtime = match builder.build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok((runtime.handle().clone(), std::thread::current().id())));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime here cancels every task still parked on it.
            })
            .map_err(|e| IoThreadError::CreationFailed(e.to_string()))?;

        let (handle, thread_id) = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(msg)) => {
                let _ = thread.join();
                return Err(IoThreadError::CreationFailed(msg));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(IoThreadError::CreationFailed(
                    "I/O thread exited before reporting its runtime".to_string(),
                ));
            }
        };

        tracing::debug!(target: "tether_core::io_thread", thread = %name, "I/O thread started");

        Ok(Self {
            name,
            handle,
            affinity: ThreadAffinity::of(thread_id),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the runtime, for spawning directly.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Affinity describing the I/O thread.
    pub fn affinity(&self) -> ThreadAffinity {
        self.affinity
    }

    /// Whether the caller is running on this I/O thread.
    pub fn is_current(&self) -> bool {
        self.affinity.is_same_thread()
    }

    /// Whether the thread is still accepting work.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }

    /// Post a future onto the I/O thread without waiting for it.
    pub fn post<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Post a future and block the caller until it has run.
    ///
    /// Fails with [`IoThreadError::WouldDeadlock`] when called from the I/O
    /// thread itself, and with [`IoThreadError::Disconnected`] if the thread
    /// stops before the future completes.
    pub fn run_blocking<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return Err(IoThreadError::WouldDeadlock);
        }
        if !self.is_running() {
            return Err(IoThreadError::Disconnected);
        }

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let _ = done_tx.send(future.await);
        });
        done_rx.recv().map_err(|_| IoThreadError::Disconnected)
    }

    /// Stop the runtime and join the thread.
    ///
    /// Tasks still parked on the runtime are dropped. Calling this twice is a
    /// no-op; calling it from the I/O thread signals shutdown without joining.
    pub fn shutdown(&self) {
        let Some(tx) = self.shutdown_tx.lock().take() else {
            return;
        };
        let _ = tx.send(());

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if self.is_current() {
                tracing::warn!(
                    target: "tether_core::io_thread",
                    thread = %self.name,
                    "shutdown requested from the I/O thread; detaching instead of joining"
                );
                return;
            }
            if thread.join().is_err() {
                tracing::error!(target: "tether_core::io_thread", thread = %self.name, "I/O thread panicked");
            }
        }

        tracing::debug!(target: "tether_core::io_thread", thread = %self.name, "I/O thread stopped");
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IoThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoThread")
            .field("name", &self.name)
            .field("thread_id", &self.affinity.thread_id())
            .field("running", &self.is_running())
            .finish()
    }
}

static_assertions::assert_impl_all!(IoThread: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_run_blocking_returns_value() {
        let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
        assert_eq!(io.run_blocking(async { 42 }).unwrap(), 42);
    }

    #[test]
    fn test_runs_on_named_thread() {
        let io = IoThread::spawn(IoThreadConfig::default().with_thread_name("test-io")).unwrap();
        let name = io
            .run_blocking(async { std::thread::current().name().map(str::to_string) })
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-io"));
        assert!(!io.is_current());
    }

    #[test]
    fn test_run_blocking_from_io_thread_is_rejected() {
        let io = Arc::new(IoThread::spawn(IoThreadConfig::default()).unwrap());
        let inner = io.clone();
        let (tx, rx) = mpsc::channel();
        io.post(async move {
            let _ = tx.send(inner.run_blocking(async { 1 }));
        });
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result, Err(IoThreadError::WouldDeadlock));
    }

    #[test]
    fn test_tasks_run_in_post_order() {
        let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            io.post(async move { order.lock().push(i) });
        }
        io.run_blocking(async {}).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_timers_work() {
        let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
        let slept = io
            .run_blocking(async {
                let start = std::time::Instant::now();
                tokio::time::sleep(Duration::from_millis(20)).await;
                start.elapsed()
            })
            .unwrap();
        assert!(slept >= Duration::from_millis(20));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_drops_tasks() {
        let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let probe = Probe(dropped.clone());
        io.post(async move {
            let _probe = probe;
            std::future::pending::<()>().await;
        });
        io.run_blocking(async {}).unwrap();

        io.shutdown();
        io.shutdown();
        assert!(!io.is_running());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(io.run_blocking(async { 1 }), Err(IoThreadError::Disconnected));
    }
}
