use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{Span, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

use super::config::PipelineConfig;
use super::io::{BatchSink, BatchSource, BufferPool, ProcessedBatch};
use super::job_chain::{JobArena, JobId, Links};
use super::worker::WorkerHandle;
use crate::communication::Mailbox;
use crate::device::{Device, Event, Queue};
use crate::dispatch::{EnqueueInfo, Kernel};
use crate::error::{Error, Result};
use crate::memory::{Direction, MappedResource};
use crate::status::Status;

/// One lane of the pipeline: an input and an output resource reused by every
/// batch, and the queue its compute invocations run on.
pub struct Slot {
    index: usize,
    input: MappedResource,
    output: MappedResource,
    compute: Queue,
}

impl Slot {
    fn new(device: &Device, index: usize, config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            index,
            input: MappedResource::new(device, config.input, Direction::HostToDevice)?,
            output: MappedResource::new(device, config.output, Direction::DeviceToHost)?,
            compute: Queue::new(device),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input(&self) -> &MappedResource {
        &self.input
    }

    pub fn output(&self) -> &MappedResource {
        &self.output
    }

    pub fn compute_queue(&self) -> &Queue {
        &self.compute
    }

    fn queues(&self) -> [&Queue; 3] {
        [self.input.queue(), &self.compute, self.output.queue()]
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

type Binder = Box<dyn Fn(&mut Kernel, &Slot) -> Result<()> + Send>;

fn bind_input_output(kernel: &mut Kernel, slot: &Slot) -> Result<()> {
    kernel.push_arg(slot.input())?;
    kernel.push_arg(slot.output())
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub slots: usize,
    pub batches: usize,
    pub filled: usize,
    pub drained: usize,
    pub peak_live_nodes: usize,
    pub elapsed: Duration,
}

impl RunReport {
    /// Mean wall time per (slot, batch) job.
    pub fn per_batch(&self) -> Duration {
        match u32::try_from(self.slots * self.batches) {
            Ok(jobs) if jobs > 0 => self.elapsed / jobs,
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {} slots x {} batches, {} filled, {} drained, peak {} nodes, {:?} \
             ({:?} per batch)",
            self.run_id,
            self.slots,
            self.batches,
            self.filled,
            self.drained,
            self.peak_live_nodes,
            self.elapsed,
            self.per_batch()
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Fill,
    Drain,
}

/// State shared between graph construction, the workers and device callbacks.
struct Shared {
    arena: JobArena,
    fill: Mailbox<JobId>,
    drain: Mailbox<JobId>,
    post: Mailbox<ProcessedBatch>,
    pool: Arc<BufferPool>,
    failure: Mutex<Option<Error>>,
    posted: AtomicUsize,
    total: usize,
}

impl Shared {
    fn mailbox(&self, stage: Stage) -> &Mailbox<JobId> {
        match stage {
            Stage::Fill => &self.fill,
            Stage::Drain => &self.drain,
        }
    }

    /// Stops the run. Only the first error is kept; later calls are no-ops.
    fn abort(&self, error: Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                debug!(%error, "run already aborted");
                return;
            }
            error!(%error, "aborting run");
            *failure = Some(error);
        }
        self.fill.deactivate();
        self.drain.deactivate();
        self.post.deactivate();
        self.pool.close();
        self.arena.abort();
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    /// Records a failed command.
    ///
    /// A command that failed only because its wait list did is skipped: every
    /// event a command can wait on is either watched itself or a trigger that
    /// fails only on abort, so the root cause is reported by its own callback.
    fn fail(&self, op: &'static str, status: Status) {
        if status == Status::ExecStatusErrorForEventsInWaitList {
            trace!(op, "command skipped after upstream failure");
            return;
        }
        self.abort(Error::dispatch(op, status));
    }

    /// Forwards `job` to the stage's mailbox once `mapped` completes, or
    /// aborts the run if the map failed.
    fn forward(self: &Arc<Self>, mapped: &Event, stage: Stage, job: JobId) {
        let shared = self.clone();
        mapped.on_complete(move |outcome| match outcome {
            Ok(()) => {
                if shared.mailbox(stage).push(job).is_err() {
                    trace!(%job, ?stage, "mailbox closed, notification dropped");
                }
            }
            Err(status) => shared.fail("map", status),
        });
    }

    /// Aborts the run if `event` fails.
    fn watch(self: &Arc<Self>, event: &Event, op: &'static str) {
        let shared = self.clone();
        event.on_complete(move |outcome| {
            if let Err(status) = outcome {
                shared.fail(op, status);
            }
        });
    }
}

/// Aborts the run if the worker holding it unwinds.
struct AbortOnPanic {
    shared: Arc<Shared>,
    worker: &'static str,
}

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared.abort(Error::WorkerPanicked(self.worker.to_string()));
        }
    }
}

/// # Pipeline
///
/// Double-buffers `N` slots between host I/O and device compute.
///
/// Every slot owns one input and one output [`MappedResource`]. A run pushes
/// `M` batches (the configured `batches`) through every slot. For each
/// (slot, batch) job the main thread wires an event graph:
///
/// 1. map the input, gated on the slot's previous compute;
/// 2. the fill worker writes the batch through the [`BatchSource`];
/// 3. unmap the input, gated on the fill;
/// 4. run the kernel, gated on this input unmap and on the previous
///    generation's input and output unmaps;
/// 5. map the output, gated on the compute;
/// 6. the drain worker copies the batch into a pooled buffer and hands it to
///    the [`BatchSink`];
/// 7. unmap the output, gated on the drain (not for the last batch, whose
///    outputs are unmapped at teardown).
///
/// Device completion callbacks only push [`JobId`]s into the fill and drain
/// mailboxes. Within a slot, generation `b`'s input unmap precedes generation
/// `b + 1`'s compute; slots are not ordered against each other. At most two
/// generations of a slot are live at once.
///
/// Any failed map, unmap or enqueue aborts the run: mailboxes are closed,
/// pending triggers fail, the workers are joined and the first error is
/// returned. Batches already handed to the sink stay delivered.
///
/// # Example
///
/// ```ignore
/// let device = Device::cpu()?;
/// let kernel = Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough)))?;
/// let config = PipelineConfig::new(16, ResourceKind::bytes(4096), ResourceKind::bytes(4096), WorkSize::linear(4096));
/// let mut pipeline = Pipeline::<2>::new(&device, kernel, config)?;
///
/// let collector = Arc::new(Collector::new());
/// let report = pipeline.run(|job: JobId, input: &mut [u8]| { input.fill(job.batch as u8); Ok(()) }, collector.clone())?;
/// assert_eq!(report.drained, 32);
/// ```
pub struct Pipeline<const N: usize> {
    kernel: Kernel,
    config: PipelineConfig,
    slots: Arc<[Slot; N]>,
    binder: Binder,
}

impl<const N: usize> Pipeline<N> {
    /// Allocates the slots' resources and queues on `device`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for `N == 0` or an invalid `config`,
    /// [`Error::Allocation`] if a resource cannot be created.
    #[tracing::instrument(skip_all, fields(slots = N, batches = config.batches))]
    pub fn new(device: &Device, kernel: Kernel, config: PipelineConfig) -> Result<Self> {
        if N == 0 {
            return Err(Error::InvalidConfig("a pipeline needs at least one slot".into()));
        }
        config.validate()?;

        let slots = (0..N)
            .map(|index| Slot::new(device, index, &config))
            .collect::<Result<Vec<_>>>()?;
        let slots: [Slot; N] = slots
            .try_into()
            .map_err(|_| Error::InvalidConfig("slot count mismatch".into()))?;
        debug!(
            input_bytes = config.input.byte_size(),
            output_bytes = config.output.byte_size(),
            "pipeline slots allocated"
        );

        Ok(Self {
            kernel,
            config,
            slots: Arc::new(slots),
            binder: Box::new(bind_input_output),
        })
    }

    /// Replaces the argument binder.
    ///
    /// The binder runs before every enqueue and must bind the kernel's full
    /// parameter list for the given slot. The default binds the slot's input
    /// and then its output.
    pub fn with_binder<F>(mut self, binder: F) -> Self
    where
        F: Fn(&mut Kernel, &Slot) -> Result<()> + Send + 'static,
    {
        self.binder = Box::new(binder);
        self
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots[..]
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pushes every batch of every slot through the pipeline.
    ///
    /// # Parameters
    ///
    /// * `source` - Fills each job's input; runs on the fill worker.
    /// * `sink` - Receives each processed batch; runs on the drain worker or
    ///   on the post-processing workers.
    ///
    /// # Returns
    ///
    /// A [`RunReport`] on success, or the first error that aborted the run.
    pub fn run<Src, Snk>(&mut self, source: Src, sink: Arc<Snk>) -> Result<RunReport>
    where
        Src: BatchSource,
        Snk: BatchSink,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run = %run_id, slots = N, batches = self.config.batches);
        let _entered = span.enter();
        let started = Instant::now();

        let total = N * self.config.batches;
        let shared = Arc::new(Shared {
            arena: JobArena::new(N),
            fill: Mailbox::new(),
            drain: Mailbox::new(),
            post: Mailbox::new(),
            pool: Arc::new(BufferPool::new(
                self.config.pooled_buffers,
                self.config.output.byte_size(),
            )),
            failure: Mutex::new(None),
            posted: AtomicUsize::new(0),
            total,
        });
        info!(total, post_workers = self.config.post_workers, "run started");

        let fill = spawn_fill(&shared, &self.slots, source, &span)?;
        let drain = spawn_drain(&shared, &self.slots, &sink, self.config.post_workers == 0, &span)?;
        let post = (0..self.config.post_workers)
            .map(|_| spawn_post(&shared, &sink, &span))
            .collect::<Result<Vec<_>>>()?;

        if let Err(error) = self.build_graph(&shared) {
            shared.abort(error);
        }

        let filled = fill.join();
        let drained = drain.join();
        let posted = post
            .into_iter()
            .map(WorkerHandle::join)
            .collect::<Result<Vec<()>>>();

        if let Some(error) = shared.take_failure() {
            self.kernel.clear_args();
            self.quiesce();
            shared.arena.clear();
            return Err(error);
        }
        let (filled, drained) = (filled?, drained?);
        posted?;

        for slot in self.slots.iter() {
            slot.output
                .unmap(&[])?
                .wait()
                .map_err(|status| Error::dispatch("unmap", status))?;
        }
        shared.arena.clear();

        let report = RunReport {
            run_id,
            slots: N,
            batches: self.config.batches,
            filled,
            drained,
            peak_live_nodes: shared.arena.tracker().peak(),
            elapsed: started.elapsed(),
        };
        info!(
            filled,
            drained,
            peak_live_nodes = report.peak_live_nodes,
            elapsed = ?report.elapsed,
            "run finished"
        );
        Ok(report)
    }

    fn build_graph(&mut self, shared: &Arc<Shared>) -> Result<()> {
        for batch in 0..self.config.batches {
            for slot in 0..N {
                if shared.arena.is_aborted() {
                    return Err(Error::Aborted);
                }
                self.issue(shared, JobId::new(slot, batch))?;
            }
            debug!(batch, "batch issued");
        }
        Ok(())
    }

    /// Wires the event graph of one job.
    fn issue(&mut self, shared: &Arc<Shared>, job: JobId) -> Result<()> {
        let slots = self.slots.clone();
        let slot = &slots[job.slot];
        let last = job.batch + 1 == self.config.batches;

        // the predecessor stays live until this job has been drained
        let prev = job
            .previous()
            .and_then(|prev| shared.arena.links(prev))
            .unwrap_or_default();
        let (fill_trigger, drain_trigger) = shared.arena.install(job)?;

        let wait: Vec<Event> = prev.compute_done.iter().cloned().collect();
        let input_mapped = slot.input.map(&wait, false)?;
        shared.forward(&input_mapped, Stage::Fill, job);

        let input_unmapped = slot.input.unmap(&[fill_trigger.event().clone()])?;
        shared.watch(&input_unmapped, "unmap");

        (self.binder)(&mut self.kernel, slot)?;
        let mut info = EnqueueInfo::new(&slot.compute, self.config.work);
        info.needs_completion_event = true;
        info.push_wait_event(input_unmapped.clone())?;
        if let Some(event) = &prev.input_unmapped {
            info.push_wait_event(event.clone())?;
        }
        if let Some(event) = &prev.output_unmapped {
            info.push_wait_event(event.clone())?;
        }
        self.kernel.enqueue(&mut info)?;
        let compute_done = info
            .completion_event
            .take()
            .ok_or_else(|| Error::dispatch("enqueue", Status::InvalidEvent))?;
        shared.watch(&compute_done, "enqueue");

        let output_mapped = slot.output.map(&[compute_done.clone()], false)?;
        shared.forward(&output_mapped, Stage::Drain, job);

        let output_unmapped = if last {
            None
        } else {
            let event = slot.output.unmap(&[drain_trigger.event().clone()])?;
            shared.watch(&event, "unmap");
            Some(event)
        };

        shared.arena.set_links(
            job,
            Links {
                input_unmapped: Some(input_unmapped),
                compute_done: Some(compute_done),
                output_unmapped,
            },
        );
        trace!(%job, "job issued");
        Ok(())
    }

    /// Waits until every queue of every slot is idle.
    fn quiesce(&self) {
        for slot in self.slots.iter() {
            for queue in slot.queues() {
                if let Err(error) = queue.finish() {
                    warn!(slot = slot.index, queue = queue.id(), %error, "queue did not drain");
                }
            }
        }
    }
}

impl<const N: usize> fmt::Debug for Pipeline<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("slots", &N)
            .field("kernel", &self.kernel)
            .field("config", &self.config)
            .finish()
    }
}

fn spawn_fill<Src, const N: usize>(
    shared: &Arc<Shared>,
    slots: &Arc<[Slot; N]>,
    mut source: Src,
    span: &Span,
) -> Result<WorkerHandle<usize>>
where
    Src: BatchSource,
{
    let stop = shared.clone();
    let shared = shared.clone();
    let slots = slots.clone();
    let span = span.clone();
    WorkerHandle::spawn("fill", move || stop.fill.deactivate(), move || {
        let _entered = span.enter();
        let _guard = AbortOnPanic {
            shared: shared.clone(),
            worker: "fill",
        };
        let mut filled = 0;
        while filled < shared.total {
            let Some(job) = shared.fill.wait_and_pop() else {
                break;
            };
            let written = slots[job.slot]
                .input
                .with_host_mut(|input| source.fill(job, input));
            if let Err(error) = written {
                shared.abort(error);
                break;
            }
            if let Some(trigger) = shared.arena.with(job, |node| node.fill_trigger().clone()) {
                trigger.set_complete();
            }
            filled += 1;
            trace!(%job, "filled");
        }
        debug!(filled, "fill loop finished");
        filled
    })
}

fn spawn_drain<Snk, const N: usize>(
    shared: &Arc<Shared>,
    slots: &Arc<[Slot; N]>,
    sink: &Arc<Snk>,
    inline: bool,
    span: &Span,
) -> Result<WorkerHandle<usize>>
where
    Snk: BatchSink,
{
    let stop = shared.clone();
    let shared = shared.clone();
    let slots = slots.clone();
    let sink = sink.clone();
    let span = span.clone();
    WorkerHandle::spawn("drain", move || stop.drain.deactivate(), move || {
        let _entered = span.enter();
        let _guard = AbortOnPanic {
            shared: shared.clone(),
            worker: "drain",
        };
        let mut drained = 0;
        while drained < shared.total {
            let Some(job) = shared.drain.wait_and_pop() else {
                break;
            };
            let Some(mut buffer) = shared.pool.take() else {
                break;
            };
            slots[job.slot]
                .output
                .with_host(|output| buffer.copy_from_slice(output));
            let batch = ProcessedBatch::pooled(job, buffer, shared.pool.clone());
            let delivered = if inline {
                sink.consume(batch)
            } else {
                shared.post.push(batch).map_err(|_| Error::MailboxClosed)
            };
            if let Err(error) = delivered {
                shared.abort(error);
                break;
            }
            if let Some(trigger) = shared.arena.with(job, |node| node.drain_trigger().clone()) {
                trigger.set_complete();
            }
            if let Some(prev) = job.previous() {
                shared.arena.retire(prev);
            }
            drained += 1;
            trace!(%job, "drained");
        }
        debug!(drained, "drain loop finished");
        drained
    })
}

fn spawn_post<Snk>(shared: &Arc<Shared>, sink: &Arc<Snk>, span: &Span) -> Result<WorkerHandle<()>>
where
    Snk: BatchSink,
{
    let stop = shared.clone();
    let shared = shared.clone();
    let sink = sink.clone();
    let span = span.clone();
    WorkerHandle::spawn("post", move || stop.post.deactivate(), move || {
        let _entered = span.enter();
        let _guard = AbortOnPanic {
            shared: shared.clone(),
            worker: "post",
        };
        while let Some(batch) = shared.post.wait_and_pop() {
            if let Err(error) = sink.consume(batch) {
                shared.abort(error);
                break;
            }
            if shared.posted.fetch_add(1, Ordering::SeqCst) + 1 == shared.total {
                shared.post.deactivate();
            }
        }
    })
}
