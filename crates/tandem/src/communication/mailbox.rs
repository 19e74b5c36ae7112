use std::collections::VecDeque;
use std::fmt;

use parking_lot::{Condvar, Mutex};

/// # Mailbox
///
/// A thread-safe FIFO used to hand work from driver callback context over to
/// host worker threads.
///
/// ## Lifecycle
///
/// A mailbox starts out active. [`deactivate`](Mailbox::deactivate) clears every
/// queued item and wakes all threads blocked in
/// [`wait_and_pop`](Mailbox::wait_and_pop); they return `None`. While inactive,
/// [`push`](Mailbox::push) hands the item back inside [`Closed`] instead of
/// queueing it. [`activate`](Mailbox::activate) re-opens the mailbox.
///
/// ## Ordering
///
/// Items pushed while the mailbox is active are popped in push order.
///
/// ## Callback Safety
///
/// `push` never blocks beyond the internal lock, so it is safe to call from a
/// completion callback running on a driver thread.
pub struct Mailbox<T> {
    state: Mutex<State<T>>,
    condition: Condvar,
}

struct State<T> {
    queue: VecDeque<T>,
    active: bool,
}

/// Returned by [`Mailbox::push`] when the mailbox is inactive. Holds the
/// rejected item.
#[derive(PartialEq, Eq)]
pub struct Closed<T>(pub T);

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

impl<T> fmt::Display for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mailbox is closed")
    }
}

impl<T> std::error::Error for Closed<T> {}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: true,
            }),
            condition: Condvar::new(),
        }
    }

    /// Queues an item and wakes one waiter.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`Closed`] if the mailbox has been deactivated.
    pub fn push(&self, item: T) -> Result<(), Closed<T>> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Closed(item));
        }
        state.queue.push_back(item);
        self.condition.notify_one();
        Ok(())
    }

    /// Pops the front item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().queue.pop_front()
    }

    /// Blocks until an item is available or the mailbox is deactivated.
    ///
    /// Returns `None` only when the mailbox is inactive and empty.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        // the predicate is re-checked after every wakeup, spurious or not
        while state.active && state.queue.is_empty() {
            self.condition.wait(&mut state);
        }
        state.queue.pop_front()
    }

    pub fn activate(&self) {
        self.state.lock().active = true;
    }

    /// Clears all queued items and releases every waiting thread.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.queue.clear();
        self.condition.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
