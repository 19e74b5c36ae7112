use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use super::event::Event;
use super::software::Device;
use crate::error::{Error, Result};
use crate::status::{CommandKind, Status};

static NEXT_QUEUE_ID: AtomicUsize = AtomicUsize::new(0);

/// Device-side work of a command. Built lazily: nothing runs until the queue
/// reaches the command and its wait list has resolved.
pub(crate) type Work = BoxFuture<'static, std::result::Result<(), Status>>;

pub(crate) fn work<F>(future: F) -> Work
where
    F: Future<Output = std::result::Result<(), Status>> + Send + 'static,
{
    Box::pin(future)
}

struct Command {
    kind: CommandKind,
    wait: Vec<Event>,
    work: Work,
    done: Event,
}

/// # Queue
///
/// An in-order command queue on a [`Device`].
///
/// Commands start in submission order. Each command first waits for every
/// event in its wait list; if any of them failed, the command is skipped and
/// its own event fails with [`Status::ExecStatusErrorForEventsInWaitList`].
/// Submission never blocks.
#[derive(Clone)]
pub struct Queue {
    id: usize,
    device: Device,
    sender: UnboundedSender<Command>,
}

impl Queue {
    pub fn new(device: &Device) -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        device.handle().spawn(run_queue(id, receiver));
        debug!(queue = id, "queue created");
        Self {
            id,
            device: device.clone(),
            sender,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Submits a command and returns its completion event.
    pub(crate) fn submit(
        &self,
        kind: CommandKind,
        wait: &[Event],
        work: Work,
    ) -> std::result::Result<Event, Status> {
        self.device.check_submit(kind)?;
        let done = Event::new(kind);
        let command = Command {
            kind,
            wait: wait.to_vec(),
            work,
            done: done.clone(),
        };
        self.sender
            .send(command)
            .map_err(|_| Status::InvalidCommandQueue)?;
        trace!(queue = self.id, %kind, event = done.id(), waits = wait.len(), "command submitted");
        Ok(done)
    }

    /// Enqueues a marker that resolves once every event in `wait` and every
    /// earlier command on this queue has resolved.
    pub fn marker(&self, wait: &[Event]) -> Result<Event> {
        self.submit(CommandKind::Marker, wait, work(async { Ok(()) }))
            .map_err(|status| Error::dispatch("marker", status))
    }

    /// Blocks until every command submitted so far has finished.
    ///
    /// Must not be called from a device runtime thread.
    pub fn finish(&self) -> Result<()> {
        self.marker(&[])?
            .wait()
            .map_err(|status| Error::dispatch("finish", status))
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("id", &self.id).finish()
    }
}

async fn run_queue(id: usize, mut receiver: UnboundedReceiver<Command>) {
    while let Some(command) = receiver.recv().await {
        let Command { kind, wait, work, done } = command;

        let mut outcome = Ok(());
        for event in wait {
            if let Err(status) = event.await {
                debug!(queue = id, %kind, %status, "wait list entry failed");
                outcome = Err(Status::ExecStatusErrorForEventsInWaitList);
                break;
            }
        }
        if outcome.is_ok() {
            outcome = work.await;
        }
        if let Err(status) = outcome {
            warn!(queue = id, %kind, event = done.id(), %status, "command failed");
        }
        done.resolve(outcome);
    }
    debug!(queue = id, "queue closed");
}
