//! Cooperative shutdown signal shared by all workers.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A one-way latch that asks workers to stop.
///
/// Clones share the same latch. Workers poll it at the top of every cycle
/// and sleep on it while backing off, so triggering wakes a backoff at once.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Latch>,
}

#[derive(Debug, Default)]
struct Latch {
    triggered: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown and wakes every sleeper.
    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.wake.notify_all();
    }

    /// Returns true once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns true if the sleep was cut short by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut triggered = self.inner.triggered.lock();
        let Some(deadline) = Instant::now().checked_add(duration) else {
            while !*triggered {
                self.inner.wake.wait(&mut triggered);
            }
            return true;
        };

        while !*triggered {
            if self
                .inner
                .wake
                .wait_until(&mut triggered, deadline)
                .timed_out()
            {
                return *triggered;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn untriggered_sleep_runs_to_completion() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn triggered_signal_skips_sleep() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        assert!(signal.is_triggered());
        assert!(signal.sleep(Duration::from_secs(60)));
    }

    #[test]
    fn trigger_wakes_sleeper() {
        let signal = ShutdownSignal::new();
        let sleeper = signal.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let interrupted = sleeper.sleep(Duration::from_secs(30));
            (interrupted, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        signal.trigger();

        let (interrupted, elapsed) = handle.join().unwrap();
        assert!(interrupted);
        assert!(elapsed < Duration::from_secs(10));
    }
}
