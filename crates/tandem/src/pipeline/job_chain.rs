use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::device::{Event, UserEvent};
use crate::error::{Error, Result};
use crate::status::Status;

/// Names one generation of a slot: the work for `batch` in `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId {
    pub slot: usize,
    pub batch: usize,
}

impl JobId {
    pub fn new(slot: usize, batch: usize) -> Self {
        Self { slot, batch }
    }

    /// The generation that used this slot before.
    pub fn previous(&self) -> Option<JobId> {
        self.batch.checked_sub(1).map(|batch| JobId::new(self.slot, batch))
    }

    fn cell(&self) -> usize {
        self.batch % 2
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot, self.batch)
    }
}

/// Current and peak number of live [`JobChain`] nodes.
#[derive(Debug, Default)]
pub struct LiveNodes {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl LiveNodes {
    fn enter(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Handles of a node that its successor's commands wait on.
#[derive(Debug, Clone, Default)]
pub(crate) struct Links {
    pub input_unmapped: Option<Event>,
    pub compute_done: Option<Event>,
    pub output_unmapped: Option<Event>,
}

/// # JobChain
///
/// Bookkeeping for one (slot, batch) generation.
///
/// A node owns the two host triggers that gate its input unmap (fill) and its
/// output unmap (drain), plus the device completion handles its successor in
/// the same slot waits on. It never owns its predecessor's handles; dropping a
/// node releases only its own.
pub struct JobChain {
    id: JobId,
    fill_trigger: UserEvent,
    drain_trigger: UserEvent,
    links: Links,
    tracker: Arc<LiveNodes>,
}

impl JobChain {
    fn new(id: JobId, tracker: &Arc<LiveNodes>) -> Self {
        tracker.enter();
        trace!(job = %id, "node created");
        Self {
            id,
            fill_trigger: UserEvent::new(),
            drain_trigger: UserEvent::new(),
            links: Links::default(),
            tracker: tracker.clone(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn fill_trigger(&self) -> &UserEvent {
        &self.fill_trigger
    }

    pub fn drain_trigger(&self) -> &UserEvent {
        &self.drain_trigger
    }

    pub fn input_unmapped(&self) -> Option<&Event> {
        self.links.input_unmapped.as_ref()
    }

    pub fn compute_done(&self) -> Option<&Event> {
        self.links.compute_done.as_ref()
    }

    pub fn output_unmapped(&self) -> Option<&Event> {
        self.links.output_unmapped.as_ref()
    }
}

impl Drop for JobChain {
    fn drop(&mut self) {
        self.tracker.exit();
        trace!(job = %self.id, "node retired");
    }
}

impl fmt::Debug for JobChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobChain")
            .field("id", &self.id)
            .field("links", &self.links)
            .finish()
    }
}

struct ArenaState {
    cells: Vec<[Option<JobChain>; 2]>,
    aborted: bool,
}

/// Owns every live [`JobChain`] of a run, two cells per slot indexed by
/// `batch % 2`.
///
/// Installing generation `b` of a slot blocks until generation `b - 2` has
/// been retired from the cell it shares. This is the pipeline's only
/// backpressure.
pub(crate) struct JobArena {
    state: Mutex<ArenaState>,
    vacated: Condvar,
    tracker: Arc<LiveNodes>,
}

impl JobArena {
    pub fn new(slots: usize) -> Self {
        Self {
            state: Mutex::new(ArenaState {
                cells: (0..slots).map(|_| [None, None]).collect(),
                aborted: false,
            }),
            vacated: Condvar::new(),
            tracker: Arc::new(LiveNodes::default()),
        }
    }

    pub fn tracker(&self) -> &LiveNodes {
        &self.tracker
    }

    /// Creates and installs the node for `id`, returning clones of its fill and
    /// drain triggers.
    ///
    /// # Errors
    ///
    /// [`Error::Aborted`] if the arena is aborted before the cell frees up.
    pub fn install(&self, id: JobId) -> Result<(UserEvent, UserEvent)> {
        let mut state = self.state.lock();
        while !state.aborted && state.cells[id.slot][id.cell()].is_some() {
            self.vacated.wait(&mut state);
        }
        if state.aborted {
            return Err(Error::Aborted);
        }
        let node = JobChain::new(id, &self.tracker);
        let triggers = (node.fill_trigger.clone(), node.drain_trigger.clone());
        state.cells[id.slot][id.cell()] = Some(node);
        Ok(triggers)
    }

    /// Runs `f` on the node for `id` if it is live.
    pub fn with<R>(&self, id: JobId, f: impl FnOnce(&mut JobChain) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.cells[id.slot][id.cell()]
            .as_mut()
            .filter(|node| node.id == id)
            .map(f)
    }

    pub(crate) fn links(&self, id: JobId) -> Option<Links> {
        self.with(id, |node| node.links.clone())
    }

    pub(crate) fn set_links(&self, id: JobId, links: Links) -> bool {
        self.with(id, |node| node.links = links).is_some()
    }

    /// Removes and drops the node for `id`. Returns `false` if it was not live.
    ///
    /// The node is dropped under the arena lock, so it has left the live count
    /// before any installer can see its cell empty.
    pub fn retire(&self, id: JobId) -> bool {
        let retired = {
            let mut state = self.state.lock();
            let cell = &mut state.cells[id.slot][id.cell()];
            if matches!(cell, Some(node) if node.id == id) {
                drop(cell.take());
                true
            } else {
                false
            }
        };
        self.vacated.notify_all();
        retired
    }

    /// Retires every live node.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            for cells in state.cells.iter_mut() {
                cells.iter_mut().for_each(|cell| drop(cell.take()));
            }
        }
        self.vacated.notify_all();
    }

    /// Rejects further installs, wakes blocked installers and fails every
    /// unresolved trigger of the live nodes with [`Status::Aborted`].
    pub fn abort(&self) {
        let triggers: Vec<UserEvent> = {
            let mut state = self.state.lock();
            state.aborted = true;
            state
                .cells
                .iter()
                .flatten()
                .flatten()
                .flat_map(|node| [node.fill_trigger.clone(), node.drain_trigger.clone()])
                .collect()
        };
        self.vacated.notify_all();
        for trigger in triggers {
            trigger.set_failed(Status::Aborted);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}
