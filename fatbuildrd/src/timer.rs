//! Idle-shutdown timer.
//!
//! Grounded on `timer.py::ServerTimer`: the daemon exits once no instance
//! worker has been active for `timeout` seconds. Workers register/unregister
//! themselves while running a task; the timer resets its clock back to zero
//! every time the last worker unregisters, so the idle window always starts
//! counting from the most recent activity.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct ServerTimer {
    start: Mutex<Instant>,
    timeout: Duration,
    workers: Mutex<HashSet<String>>,
    condvar: Condvar,
}

impl ServerTimer {
    pub fn new(timeout: Duration) -> Self {
        ServerTimer {
            start: Mutex::new(Instant::now()),
            timeout,
            workers: Mutex::new(HashSet::new()),
            condvar: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        *self.start.lock().unwrap() = Instant::now();
    }

    pub fn remaining(&self) -> Duration {
        let elapsed = self.start.lock().unwrap().elapsed();
        self.timeout.saturating_sub(elapsed)
    }

    pub fn notask(&self) -> bool {
        self.workers.lock().unwrap().is_empty()
    }

    pub fn over(&self) -> bool {
        self.notask() && self.remaining().is_zero()
    }

    pub fn register_worker(&self, worker: impl Into<String>) {
        self.workers.lock().unwrap().insert(worker.into());
    }

    pub fn unregister_worker(&self, worker: &str) {
        let mut workers = self.workers.lock().unwrap();
        workers.remove(worker);
        if workers.is_empty() {
            self.reset();
            self.condvar.notify_all();
        }
    }

    /// Block until no worker is registered, bounded by `timeout`. Returns
    /// true if the wait ended because the worker set became empty.
    pub fn wait_notask(&self, timeout: Duration) -> bool {
        let workers = self.workers.lock().unwrap();
        if workers.is_empty() {
            return true;
        }
        let (guard, result) = self
            .condvar
            .wait_timeout_while(workers, timeout, |w| !w.is_empty())
            .unwrap();
        drop(guard);
        !result.timed_out()
    }

    /// Wait for either idle workers plus the remaining idle window, or for a
    /// worker to register during the wait.
    pub fn wait(&self, timeout: Duration) {
        let notask = self.wait_notask(timeout);
        if notask {
            let remaining = self.remaining();
            if !remaining.is_zero() {
                std::thread::sleep(remaining.min(timeout));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn over_once_idle_and_timeout_elapsed() {
        let timer = ServerTimer::new(Duration::from_millis(1));
        assert!(timer.notask());
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.over());
    }

    #[test]
    fn register_blocks_over_until_unregistered() {
        let timer = ServerTimer::new(Duration::from_millis(1));
        timer.register_worker("inst1");
        assert!(!timer.notask());
        assert!(!timer.over());
        timer.unregister_worker("inst1");
        assert!(timer.notask());
    }
}
