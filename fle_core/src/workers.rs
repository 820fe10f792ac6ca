use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Named background threads owned by a session and joined on cleanup.
#[derive(Default)]
pub struct WorkerSet {
    next_id: AtomicU64,
    workers: Mutex<Vec<Worker>>,
}

impl WorkerSet {
    pub fn spawn<F>(&self, prefix: &str, job: F) -> io::Result<String>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{prefix}-{id}");
        let (done_tx, done_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            job();
            let _ = done_tx.send(());
        })?;

        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.handle.is_finished());
        workers.push(Worker {
            name: name.clone(),
            handle,
            done: done_rx,
        });
        Ok(name)
    }

    /// Workers that have not finished yet.
    pub fn active(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|worker| !worker.handle.is_finished())
            .count()
    }

    /// Join every worker, waiting at most `timeout` for each one. Workers that
    /// are still running afterwards are detached and their names returned.
    pub fn join_all(&self, timeout: Duration) -> Vec<String> {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut stragglers = Vec::new();
        for worker in workers {
            match worker.done.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        tracing::warn!(target: "fle::session", worker = %worker.name, "worker.panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        target: "fle::session",
                        worker = %worker.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "worker.join_timeout"
                    );
                    stragglers.push(worker.name);
                }
            }
        }
        stragglers
    }
}
