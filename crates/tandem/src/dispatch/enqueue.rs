use crate::device::{Event, Queue};
use crate::error::{Error, Result};
use crate::status::Status;

/// Capacity of a [`WaitList`].
pub const MAX_ENQUEUE_WAIT_EVENTS: usize = 64;

/// Dimensioned work-size descriptor for a compute invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkSize {
    /// Number of used dimensions, 1 to 3.
    pub dimension: usize,
    pub global: [usize; 3],
    /// Work-group size per dimension; zero lets the device choose.
    pub local: [usize; 3],
    /// Added to every work-item id; `global + offset` must fit a `usize`.
    pub offset: Option<[usize; 3]>,
}

impl WorkSize {
    pub fn linear(global: usize) -> Self {
        Self {
            dimension: 1,
            global: [global, 1, 1],
            ..Default::default()
        }
    }

    /// A 2-D range covering `extent` with work groups of size `local`; the
    /// global size is rounded up to a whole number of groups.
    pub fn planar(extent: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            dimension: 2,
            global: [
                Self::cover(extent[0], local[0]),
                Self::cover(extent[1], local[1]),
                1,
            ],
            local: [local[0], local[1], 0],
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: [usize; 3]) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Smallest multiple of `local` that is at least `extent`.
    pub fn cover(extent: usize, local: usize) -> usize {
        if local == 0 {
            return extent;
        }
        extent.div_ceil(local) * local
    }

    /// Total number of work items.
    pub fn items(&self) -> usize {
        self.global[..self.dimension.min(3)].iter().product()
    }

    pub fn validate(&self) -> std::result::Result<(), Status> {
        if !(1..=3).contains(&self.dimension) {
            return Err(Status::InvalidWorkDimension);
        }
        for dim in 0..self.dimension {
            let (global, local) = (self.global[dim], self.local[dim]);
            if global == 0 {
                return Err(Status::InvalidValue);
            }
            if local != 0 && global % local != 0 {
                return Err(Status::InvalidWorkGroupSize);
            }
            if self.offset.is_some_and(|offset| offset[dim].checked_add(global).is_none()) {
                return Err(Status::InvalidGlobalOffset);
            }
        }
        Ok(())
    }
}

/// A bounded list of events a command waits for.
#[derive(Debug, Clone, Default)]
pub struct WaitList {
    events: Vec<Event>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// [`Error::WaitListFull`] once [`MAX_ENQUEUE_WAIT_EVENTS`] are held.
    pub fn push(&mut self, event: Event) -> Result<()> {
        if self.events.len() >= MAX_ENQUEUE_WAIT_EVENTS {
            return Err(Error::WaitListFull {
                capacity: MAX_ENQUEUE_WAIT_EVENTS,
            });
        }
        self.events.push(event);
        Ok(())
    }

    /// Replaces the event at `index`. Returns `false` if `index` is not
    /// below [`len`](WaitList::len).
    pub fn set(&mut self, index: usize, event: Event) -> bool {
        match self.events.get_mut(index) {
            Some(slot) => {
                *slot = event;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }
}

/// Everything a [`Kernel::enqueue`](super::Kernel::enqueue) call needs besides
/// the bound arguments.
#[derive(Debug, Clone)]
pub struct EnqueueInfo {
    pub queue: Queue,
    pub work: WorkSize,
    pub wait_list: WaitList,
    pub needs_completion_event: bool,
    /// Set by a successful enqueue when `needs_completion_event` is true.
    pub completion_event: Option<Event>,
}

impl EnqueueInfo {
    pub fn new(queue: &Queue, work: WorkSize) -> Self {
        Self {
            queue: queue.clone(),
            work,
            wait_list: WaitList::new(),
            needs_completion_event: false,
            completion_event: None,
        }
    }

    pub fn push_wait_event(&mut self, event: Event) -> Result<()> {
        self.wait_list.push(event)
    }

    pub fn set_wait_event(&mut self, index: usize, event: Event) -> bool {
        self.wait_list.set(index, event)
    }
}
