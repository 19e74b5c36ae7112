use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use super::job_chain::JobId;
use crate::communication::Mailbox;
use crate::error::Result;

/// Produces the input bytes of every batch.
///
/// Called on the fill worker thread with the slot's host-visible input region
/// while it is mapped.
pub trait BatchSource: Send + 'static {
    fn fill(&mut self, job: JobId, input: &mut [u8]) -> Result<()>;
}

impl<F> BatchSource for F
where
    F: FnMut(JobId, &mut [u8]) -> Result<()> + Send + 'static,
{
    fn fill(&mut self, job: JobId, input: &mut [u8]) -> Result<()> {
        self(job, input)
    }
}

/// Receives every processed batch.
///
/// Called on the drain worker thread, or concurrently on the post-processing
/// workers when the pipeline has any. The pipeline shares the sink through an
/// `Arc`, so the caller can keep a handle to inspect it after the run.
pub trait BatchSink: Send + Sync + 'static {
    fn consume(&self, batch: ProcessedBatch) -> Result<()>;
}

impl<F> BatchSink for F
where
    F: Fn(ProcessedBatch) -> Result<()> + Send + Sync + 'static,
{
    fn consume(&self, batch: ProcessedBatch) -> Result<()> {
        self(batch)
    }
}

/// A sink that keeps every batch in memory.
#[derive(Debug, Default)]
pub struct Collector {
    batches: Mutex<Vec<(JobId, Vec<u8>)>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }

    /// Takes the collected batches, sorted by slot then batch.
    pub fn take(&self) -> Vec<(JobId, Vec<u8>)> {
        let mut batches = std::mem::take(&mut *self.batches.lock());
        batches.sort_by_key(|(job, _)| (job.slot, job.batch));
        batches
    }
}

impl BatchSink for Collector {
    fn consume(&self, batch: ProcessedBatch) -> Result<()> {
        let job = batch.job();
        self.batches.lock().push((job, batch.into_vec()));
        Ok(())
    }
}

/// Fixed set of equally sized host buffers recycled between drained batches.
pub(crate) struct BufferPool {
    free: Mailbox<Vec<u8>>,
    buffer_len: usize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_len: usize) -> Self {
        let free = Mailbox::new();
        for _ in 0..count {
            // a fresh mailbox is active
            let _ = free.push(vec![0; buffer_len]);
        }
        Self { free, buffer_len }
    }

    /// Blocks until a buffer is free. Returns `None` once the pool is closed.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.free.wait_and_pop()
    }

    pub fn put(&self, buffer: Vec<u8>) {
        // a closed pool just frees the buffer
        let _ = self.free.push(buffer);
    }

    pub fn close(&self) {
        self.free.deactivate();
    }

    #[allow(dead_code)]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }
}

/// One drained batch held in a pooled host buffer.
///
/// Dropping the batch returns the buffer to the pipeline's pool, so a sink
/// that holds on to batches eventually stalls the drain loop. Use
/// [`into_vec`](ProcessedBatch::into_vec) to keep the bytes.
pub struct ProcessedBatch {
    job: JobId,
    bytes: Vec<u8>,
    pool: Option<Arc<BufferPool>>,
}

impl ProcessedBatch {
    /// A batch that does not belong to any pool.
    pub fn new(job: JobId, bytes: Vec<u8>) -> Self {
        Self {
            job,
            bytes,
            pool: None,
        }
    }

    pub(crate) fn pooled(job: JobId, bytes: Vec<u8>, pool: Arc<BufferPool>) -> Self {
        Self {
            job,
            bytes,
            pool: Some(pool),
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Detaches the bytes. The pool gets a fresh buffer in their place.
    pub fn into_vec(mut self) -> Vec<u8> {
        let bytes = std::mem::take(&mut self.bytes);
        if let Some(pool) = self.pool.take() {
            pool.put(vec![0; pool.buffer_len()]);
        }
        bytes
    }
}

impl Deref for ProcessedBatch {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for ProcessedBatch {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.bytes));
        }
    }
}

impl fmt::Debug for ProcessedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedBatch")
            .field("job", &self.job)
            .field("len", &self.bytes.len())
            .finish()
    }
}
