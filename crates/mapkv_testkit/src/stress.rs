//! Stress helpers for concurrent access.

use mapkv_core::Store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            duration,
        }
    }

    /// Operations per second.
    #[must_use]
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of threads.
    pub threads: usize,
    /// Size of each value in bytes.
    pub value_size: usize,
    /// Number of distinct keys per thread.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            value_size: 64,
            key_count: 50,
        }
    }
}

/// Runs `config.threads` writers against `store`, each overwriting its own
/// keys `t{thread}_{n}`. Thread `t` writes value byte `t` so the final
/// content can be checked with [`expected_value`].
pub fn concurrent_writers(store: &Arc<Store>, config: &StressConfig) -> StressTestResult {
    let ok = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let store = Arc::clone(store);
            let ok = Arc::clone(&ok);
            let failed = Arc::clone(&failed);
            let config = config.clone();
            thread::spawn(move || {
                let value = expected_value(t, config.value_size);
                for i in 0..config.operations {
                    let key = format!("t{t}_{}", i % config.key_count);
                    if store.set(&key, value.clone()) {
                        ok.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    StressTestResult::new(
        ok.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// The value thread `thread` writes in [`concurrent_writers`].
pub fn expected_value(thread: usize, size: usize) -> Vec<u8> {
    vec![thread as u8; size]
}
