//! Integration tests for the I/O thread working with the other core pieces.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether_core::{CancellationToken, Defer, IoThread, IoThreadConfig, ticks};

#[test]
fn test_cancellation_crosses_threads() {
    let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
    let token = CancellationToken::new();
    let waiter = token.clone();

    let (tx, rx) = std::sync::mpsc::channel();
    io.post(async move {
        waiter.cancelled().await;
        let _ = tx.send(());
    });

    std::thread::sleep(Duration::from_millis(20));
    assert!(rx.try_recv().is_err());
    token.cancel();
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_deferred_rearm_runs_once_per_tick() {
    let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
    let rearms = Arc::new(AtomicUsize::new(0));

    let counted = rearms.clone();
    io.run_blocking(async move {
        for _ in 0..3 {
            let counted = counted.clone();
            let _rearm = Defer::new(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .unwrap();

    assert_eq!(rearms.load(Ordering::SeqCst), 3);
}

#[test]
fn test_ticks_agree_across_threads() {
    let io = IoThread::spawn(IoThreadConfig::default()).unwrap();
    let before = ticks::now();
    let remote = io.run_blocking(async { ticks::now() }).unwrap();
    let after = ticks::now();
    assert!(before <= remote && remote <= after);
}

#[test]
fn test_drop_joins_thread() {
    let io = IoThread::spawn(IoThreadConfig::default().with_thread_name("drop-io")).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let flag = finished.clone();
    io.run_blocking(async move {
        flag.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    drop(io);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
