//! Host worker threads that block on mailboxes.

use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{Error, Result};

type Stop = Box<dyn FnOnce() + Send + 'static>;

/// A handle for a host worker thread.
///
/// Workers block in [`Mailbox::wait_and_pop`](crate::Mailbox::wait_and_pop),
/// so stopping one means waking it: the `stop` closure given at spawn time
/// (typically deactivating the worker's mailbox) runs on
/// [`shutdown`](WorkerHandle::shutdown) and again, if it has not run yet, when
/// the handle is dropped. Dropping a handle also joins the thread.
///
/// # Example
///
/// ```ignore
/// let jobs = Arc::new(Mailbox::new());
/// let stop = {
///     let jobs = jobs.clone();
///     move || jobs.deactivate()
/// };
/// let task = {
///     let jobs = jobs.clone();
///     move || std::iter::from_fn(|| jobs.wait_and_pop()).count()
/// };
/// let worker = WorkerHandle::spawn("fill", stop, task)?;
/// jobs.push(1).unwrap();
/// // Dropping `worker` deactivates `jobs` and joins the thread.
/// ```
pub(crate) struct WorkerHandle<T> {
    name: &'static str,

    /// Becomes `None` once joined or dropped.
    handle: Option<JoinHandle<T>>,

    /// Becomes `None` once run, or when the worker is joined normally.
    stop: Option<Stop>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawns `task` on a named thread.
    ///
    /// # Parameters
    ///
    /// * `name` - Short worker name, used for the thread name and in logs.
    /// * `stop` - Wakes the worker so it can observe that it should exit.
    /// * `task` - The worker body; its return value is handed back by
    ///   [`join`](WorkerHandle::join).
    pub fn spawn<S, F>(name: &'static str, stop: S, task: F) -> Result<Self>
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("tandem-{name}"))
            .spawn(task)
            .map_err(|e| Error::WorkerSpawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(worker = name, "worker started");
        Ok(Self {
            name,
            handle: Some(handle),
            stop: Some(Box::new(stop)),
        })
    }

    /// Waits for the worker to finish on its own and returns its result.
    ///
    /// # Errors
    ///
    /// [`Error::WorkerPanicked`] if the worker thread panicked.
    pub fn join(mut self) -> Result<T> {
        self.stop = None;
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::WorkerPanicked(self.name.to_string()))?;
        let output = handle
            .join()
            .map_err(|_| Error::WorkerPanicked(self.name.to_string()))?;
        debug!(worker = self.name, "worker joined");
        Ok(output)
    }
}

impl<T> WorkerHandle<T> {
    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wakes the worker so it exits. Runs the stop closure at most once.
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            debug!(worker = self.name, "worker shutting down");
            stop();
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = self.name, "worker panicked during shutdown");
            }
        }
    }
}
