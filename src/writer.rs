//! Single background writer for fire-and-forget persistence.
//!
//! Snapshots are queued in mutation order and written by one thread. Every save is a full
//! replace, so when several snapshots are waiting only the newest one is written.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::models::Task;
use crate::storage::{Storage, StorageError};

pub type SharedStorage = Arc<Mutex<Box<dyn Storage + Send>>>;

pub fn shared(storage: Box<dyn Storage + Send>) -> SharedStorage {
    Arc::new(Mutex::new(storage))
}

enum WriteRequest {
    Save(Vec<Task>),
    Flush(oneshot::Sender<Result<(), String>>),
}

pub struct WriteQueue {
    tx: Option<mpsc::UnboundedSender<WriteRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl WriteQueue {
    pub fn spawn(storage: SharedStorage) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("daily-plan-writer".to_string())
            .spawn(move || run_writer(storage, rx))?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn enqueue(&self, tasks: Vec<Task>) -> Result<(), StorageError> {
        self.send(WriteRequest::Save(tasks))
    }

    /// Waits until every snapshot queued so far has been written. Reports the outcome of the
    /// most recent write. Blocks the calling thread, so it must not be called from async code.
    pub fn flush(&self) -> Result<(), StorageError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(WriteRequest::Flush(done_tx))?;
        let outcome = done_rx.blocking_recv().map_err(|_| writer_gone())?;
        outcome.map_err(StorageError::Writer)
    }

    fn send(&self, request: WriteRequest) -> Result<(), StorageError> {
        self.tx
            .as_ref()
            .ok_or_else(writer_gone)?
            .send(request)
            .map_err(|_| writer_gone())
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("task writer thread panicked");
            }
        }
    }
}

fn writer_gone() -> StorageError {
    StorageError::Writer("writer thread is not running".to_string())
}

fn run_writer(storage: SharedStorage, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    let mut last_outcome: Result<(), String> = Ok(());
    while let Some(first) = rx.blocking_recv() {
        let mut latest: Option<Vec<Task>> = None;
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(request) = next {
            match request {
                WriteRequest::Save(tasks) => latest = Some(tasks),
                WriteRequest::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if let Some(tasks) = latest {
            let mut guard = storage.lock().unwrap_or_else(PoisonError::into_inner);
            last_outcome = match guard.save_tasks(&tasks) {
                Ok(()) => {
                    log::debug!("saved {} tasks to {}", tasks.len(), guard.describe());
                    Ok(())
                }
                Err(err) => {
                    log::warn!("background save to {} failed: {err}", guard.describe());
                    Err(err.to_string())
                }
            };
        }

        for done in waiters {
            let _ = done.send(last_outcome.clone());
        }
    }
    log::debug!("task writer stopped");
}
