//! FIFO task queue with disk persistence for crash recovery.
//!
//! Grounded on `tasks/manager.py`'s `ServerQueue`: a counting condition
//! variable supports a timeout-bounded, externally interruptible `get`;
//! every enqueue/dequeue rewrites a snapshot file of queued task ids so a
//! restart can garbage-collect orphaned workspace directories (`spec.md`
//! §4.9 "Crash recovery", E6).

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to read task queue snapshot {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to write task queue snapshot {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

struct Inner {
    items: VecDeque<String>,
    stopping: bool,
}

/// One instance's FIFO of queued task ids, persisted to
/// `<workspaces>/<instance>/tasks.queue` after every enqueue/dequeue.
pub struct TaskQueue {
    snapshot_path: PathBuf,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl TaskQueue {
    pub fn new(workspace: PathBuf) -> Self {
        TaskQueue {
            snapshot_path: workspace.join("tasks.queue"),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                stopping: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Load a persisted snapshot (one task id per line) written before a
    /// previous shutdown or crash.
    pub fn load(workspace: &Path) -> Result<Self> {
        let snapshot_path = workspace.join("tasks.queue");
        let items = if snapshot_path.exists() {
            let content = std::fs::read_to_string(&snapshot_path).context(ReadSnafu {
                path: snapshot_path.clone(),
            })?;
            content.lines().filter(|l| !l.is_empty()).map(String::from).collect()
        } else {
            VecDeque::new()
        };
        Ok(TaskQueue {
            snapshot_path,
            inner: Mutex::new(Inner { items, stopping: false }),
            condvar: Condvar::new(),
        })
    }

    fn persist(&self, items: &VecDeque<String>) -> Result<()> {
        let mut file = std::fs::File::create(&self.snapshot_path).context(WriteSnafu {
            path: self.snapshot_path.clone(),
        })?;
        for id in items {
            writeln!(file, "{id}").context(WriteSnafu {
                path: self.snapshot_path.clone(),
            })?;
        }
        Ok(())
    }

    /// Ids present in the persisted snapshot at load time, for crash
    /// recovery to reconcile against on-disk workspace directories.
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().items.iter().cloned().collect()
    }

    /// Replace the snapshot with an empty one, per `spec.md`'s crash
    /// recovery step ("rewrite the snapshot as empty").
    pub fn clear_snapshot(&self) -> Result<()> {
        self.persist(&VecDeque::new())
    }

    /// Enqueue a task id, waking exactly one waiter.
    pub fn put(&self, task_id: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push_back(task_id.into());
        self.persist(&inner.items)?;
        self.condvar.notify_one();
        Ok(())
    }

    /// Block up to `timeout` for a task id, or until `stop()` interrupts
    /// the wait. Returns `None` on timeout or interruption.
    pub fn get(&self, timeout: Duration) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(id) = inner.items.pop_front() {
                self.persist(&inner.items)?;
                return Ok(Some(id));
            }
            if inner.stopping {
                return Ok(None);
            }
            let (guard, timeout_result) = self.condvar.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if timeout_result.timed_out() && inner.items.is_empty() {
                return Ok(None);
            }
        }
    }

    /// Interrupt any blocked `get()`, e.g. on shutdown.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopping = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_get_returns_fifo_order() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(tmp.path().to_path_buf());
        queue.put("a").unwrap();
        queue.put("b").unwrap();
        assert_eq!(queue.get(Duration::from_millis(10)).unwrap(), Some("a".to_string()));
        assert_eq!(queue.get(Duration::from_millis(10)).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn get_times_out_when_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(tmp.path().to_path_buf());
        assert_eq!(queue.get(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn stop_interrupts_blocked_get() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(TaskQueue::new(tmp.path().to_path_buf()));
        let other = queue.clone();
        let handle = std::thread::spawn(move || other.get(Duration::from_secs(5)).unwrap());
        std::thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn load_restores_persisted_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = TaskQueue::new(tmp.path().to_path_buf());
        queue.put("orphan-a").unwrap();
        queue.put("orphan-b").unwrap();

        let reloaded = TaskQueue::load(tmp.path()).unwrap();
        assert_eq!(reloaded.snapshot_ids(), vec!["orphan-a", "orphan-b"]);
    }
}
