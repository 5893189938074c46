//! Fixed-size worker pool.
//!
//! Workers pull boxed closures from a shared FIFO queue. The pool knows
//! nothing about sockets; the reactor decides what each task does.
//!
//! Teardown closes the queue: workers finish every task that was already
//! queued, then exit, and `shutdown` joins them.

use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// One unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pool of persistent worker threads consuming a shared task queue.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);

        for worker_id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver))?;
            workers.push(handle);
        }

        debug!(workers = size, "Worker pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Enqueue a task and return immediately.
    ///
    /// Fails only after `shutdown`; the rejected task is handed back.
    pub fn submit<F>(&self, task: F) -> Result<(), SendError<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        match &self.sender {
            Some(sender) => sender.send(task),
            None => Err(SendError(task)),
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, let the workers drain the queue, and join them.
    pub fn shutdown(&mut self) {
        // Dropping the only sender disconnects the channel once it is empty
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited abnormally");
            }
        }
        debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Task>) {
    // recv() keeps yielding queued tasks after the sender is gone
    while let Ok(task) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                worker = worker_id,
                panic = panic_message(payload.as_ref()),
                "Task panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
