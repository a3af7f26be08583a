// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Hooks into the external worker pool.
//!
//! The pool never runs protocol logic itself. Whenever contexts land in the
//! turning queue it pokes the workers through `WorkerWaker`; how many of
//! them actually wake up is the worker pool's business.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Notification hooks the pool calls when turning work is available.
pub trait WorkerWaker: Send + Sync {
    /// One context became ready.
    fn wake_one(&self);
    /// Several contexts became ready.
    fn wake_all(&self);
}

/// Condvar-backed `WorkerWaker` that worker loops can park on.
///
/// Workers call `wait_timeout` when `get_context(Turning)` comes back
/// empty, then poll the queue again. Spurious returns are fine.
pub struct WorkerSignal {
    ready: Mutex<bool>,
    cvar: Condvar,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Park until woken or `timeout` elapses. Returns true if a wake was
    /// pending or arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            self.cvar.wait_for(&mut ready, timeout);
        }
        std::mem::replace(&mut *ready, false)
    }
}

impl Default for WorkerSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerWaker for WorkerSignal {
    fn wake_one(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cvar.notify_one();
    }

    fn wake_all(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn pending_wake_is_consumed() {
        let signal = WorkerSignal::new();
        signal.wake_one();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wake_all_releases_parked_workers() {
        let signal = Arc::new(WorkerSignal::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let s = signal.clone();
                std::thread::spawn(move || {
                    let start = Instant::now();
                    s.wait_timeout(Duration::from_secs(5));
                    start.elapsed()
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        signal.wake_all();
        for h in handles {
            assert!(h.join().unwrap() < Duration::from_secs(5));
        }
    }
}
