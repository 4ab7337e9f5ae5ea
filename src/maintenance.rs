//! The background maintenance task.
//!
//! A single long-lived OS thread that wakes roughly once a second, advances
//! the timer wheel and removes anything that expired, then goes back to
//! sleep. It exits cleanly once told to stop, which the cache does from
//! `close()`. Running on a plain thread rather than a tokio task keeps
//! cache construction usable from purely synchronous embeddings (the
//! blocking single-flight memoizer in particular never touches an async
//! runtime).

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

/// Anything the maintenance loop can drive a tick against.
pub trait MaintenanceTarget: Send + Sync + 'static {
    fn run_once(&self, now_ns: u64);
}

pub struct MaintenanceHandle {
    stop: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signals the loop to stop and waits for it to exit.
    pub fn stop(self) {
        // The receiver may already be gone if the thread raced past its
        // last `recv_timeout` and exited on its own; either way the loop
        // is on its way out.
        let _ = self.stop.send(());
        let _ = self.join.join();
    }
}

/// Spawns the maintenance loop on a dedicated OS thread.
///
/// `now_ns` supplies the current time on each tick; it is a parameter
/// rather than a hardcoded `SystemTime::now()` call so tests can drive the
/// wheel with synthetic clocks.
pub fn spawn<T, F>(target: Arc<T>, interval: Duration, now_ns: F) -> MaintenanceHandle
where
    T: MaintenanceTarget,
    F: Fn() -> u64 + Send + Sync + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let join = std::thread::Builder::new()
        .name("cache-maintenance".into())
        .spawn(move || {
            info!(component = "maintenance", event = "start");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => target.run_once(now_ns()),
                }
            }
            debug!(component = "maintenance", event = "stop");
        })
        .expect("failed to spawn maintenance thread");

    MaintenanceHandle { stop: stop_tx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl MaintenanceTarget for Counter {
        fn run_once(&self, _now_ns: u64) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn ticks_at_least_once_then_stops_cleanly() {
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        let handle = spawn(counter.clone(), Duration::from_millis(5), || 0);
        std::thread::sleep(Duration::from_millis(30));
        handle.stop();
        assert!(counter.0.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn stop_does_not_block_past_the_in_flight_tick() {
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        let handle = spawn(counter.clone(), Duration::from_secs(60), || 0);
        handle.stop();
    }
}
