use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::status::{CommandKind, Status};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Current state of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Complete,
    Failed(Status),
}

impl EventStatus {
    fn outcome(self) -> Option<Result<(), Status>> {
        match self {
            EventStatus::Queued => None,
            EventStatus::Complete => Some(Ok(())),
            EventStatus::Failed(status) => Some(Err(status)),
        }
    }
}

type Callback = Box<dyn FnOnce(Result<(), Status>) + Send + 'static>;

struct Inner {
    id: u64,
    kind: CommandKind,
    state: Mutex<State>,
    resolved: Condvar,
}

struct State {
    status: EventStatus,
    callbacks: Vec<Callback>,
    wakers: Vec<Waker>,
}

/// # Event
///
/// A completion handle for an asynchronous device command.
///
/// An event resolves exactly once, either to success or to a failing
/// [`Status`]. It can be observed three ways:
///
/// * [`wait`](Event::wait) blocks the calling thread.
/// * `.await` suspends an async task; `Event` implements [`Future`].
/// * [`on_complete`](Event::on_complete) registers a callback that runs on the
///   thread that resolves the event, typically a device runtime thread.
///
/// Cloning an event retains the same underlying handle; the handle is released
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Event {
    pub(crate) fn new(kind: CommandKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                state: Mutex::new(State {
                    status: EventStatus::Queued,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Resolves the event, running callbacks and waking waiters.
    ///
    /// Returns `false` if the event had already been resolved, in which case
    /// nothing happens.
    pub(crate) fn resolve(&self, outcome: Result<(), Status>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.inner.state.lock();
            if state.status != EventStatus::Queued {
                return false;
            }
            state.status = match outcome {
                Ok(()) => EventStatus::Complete,
                Err(status) => EventStatus::Failed(status),
            };
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        self.inner.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(outcome);
        }
        true
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> CommandKind {
        self.inner.kind
    }

    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().status
    }

    pub fn is_resolved(&self) -> bool {
        self.status() != EventStatus::Queued
    }

    /// Blocks until the event resolves.
    pub fn wait(&self) -> Result<(), Status> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = state.status.outcome() {
                return outcome;
            }
            self.inner.resolved.wait(&mut state);
        }
    }

    /// Like [`wait`](Event::wait) but gives up after `timeout`, returning
    /// `None` if the event is still queued.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), Status>> {
        let mut state = self.inner.state.lock();
        self.inner
            .resolved
            .wait_while_for(&mut state, |state| state.status == EventStatus::Queued, timeout);
        state.status.outcome()
    }

    /// Registers a completion callback.
    ///
    /// If the event has already resolved the callback runs immediately on the
    /// calling thread. Callbacks must not block: they run on whichever thread
    /// resolves the event.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), Status>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match state.status.outcome() {
                Some(outcome) => outcome,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(outcome);
    }

    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Future for Event {
    type Output = Result<(), Status>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        match state.status.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// # UserEvent
///
/// A completion handle resolved by the host rather than by a device command.
///
/// User events gate downstream commands: a command whose wait list contains a
/// user event does not start until the host calls
/// [`set_complete`](UserEvent::set_complete). Dereferences to [`Event`] so it
/// can be placed in wait lists directly. Clones share the same handle.
#[derive(Clone)]
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    pub fn new() -> Self {
        Self {
            event: Event::new(CommandKind::User),
        }
    }

    /// Marks the event complete, releasing every command that waits on it.
    pub fn set_complete(&self) -> bool {
        self.event.resolve(Ok(()))
    }

    /// Marks the event failed; dependent commands fail with
    /// [`Status::ExecStatusErrorForEventsInWaitList`].
    pub fn set_failed(&self, status: Status) -> bool {
        self.event.resolve(Err(status))
    }

    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for UserEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.event
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UserEvent").field(&self.event).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_resolves_once() {
        let event = Event::new(CommandKind::Marker);
        assert_eq!(event.status(), EventStatus::Queued);
        assert!(event.resolve(Ok(())));
        assert!(!event.resolve(Err(Status::OutOfResources)));
        assert_eq!(event.status(), EventStatus::Complete);
    }

    #[test]
    fn test_callback_fires_once_on_resolve() {
        let event = Event::new(CommandKind::Map);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            event.on_complete(move |outcome| {
                assert_eq!(outcome, Err(Status::MapFailure));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        event.resolve(Err(Status::MapFailure));
        event.resolve(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_on_resolved_event_runs_immediately() {
        let event = Event::new(CommandKind::Unmap);
        event.resolve(Ok(()));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        event.on_complete(move |outcome| {
            assert!(outcome.is_ok());
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_blocks_until_user_event_set() {
        let trigger = UserEvent::new();
        let event = trigger.event().clone();
        let waiter = thread::spawn(move || event.wait());
        thread::sleep(Duration::from_millis(20));
        trigger.set_complete();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_wait_timeout_on_queued_event() {
        let event = Event::new(CommandKind::Marker);
        assert_eq!(event.wait_timeout(Duration::from_millis(10)), None);
        event.resolve(Ok(()));
        assert_eq!(event.wait_timeout(Duration::from_millis(10)), Some(Ok(())));
    }

    #[test]
    fn test_wait_timeout_survives_wakeup_without_resolution() {
        let event = Event::new(CommandKind::Map);
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        event.inner.resolved.notify_all();
        thread::sleep(Duration::from_millis(20));
        event.resolve(Err(Status::MapFailure));
        assert_eq!(waiter.join().unwrap(), Some(Err(Status::MapFailure)));
    }

    #[tokio::test]
    async fn test_event_is_awaitable() {
        let trigger = UserEvent::new();
        let event = trigger.event().clone();
        let task = tokio::spawn(async move { event.await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.set_failed(Status::Aborted);
        assert_eq!(task.await.unwrap(), Err(Status::Aborted));
    }

    #[test]
    fn test_clones_share_state() {
        let event = Event::new(CommandKind::NdRange);
        let clone = event.clone();
        assert!(event.ptr_eq(&clone));
        clone.resolve(Ok(()));
        assert!(event.is_resolved());
        assert_eq!(event.kind(), CommandKind::NdRange);
    }
}
