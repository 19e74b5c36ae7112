use crate::dispatch::WorkSize;
use crate::error::{Error, Result};
use crate::memory::ResourceKind;

/// Numeric parameters of a [`Pipeline`](super::Pipeline) run.
///
/// The slot count is not part of the config: it is the pipeline's const
/// generic parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of batches pushed through every slot (M).
    pub batches: usize,

    /// Layout of each slot's input resource.
    pub input: ResourceKind,

    /// Layout of each slot's output resource.
    pub output: ResourceKind,

    /// Work size of every compute invocation.
    pub work: WorkSize,

    /// Threads handing drained batches to the sink. With zero, the drain loop
    /// calls the sink itself.
    pub post_workers: usize,

    /// Host buffers drained batches are copied into. The drain loop blocks
    /// while all of them are held downstream.
    pub pooled_buffers: usize,
}

impl PipelineConfig {
    pub fn new(batches: usize, input: ResourceKind, output: ResourceKind, work: WorkSize) -> Self {
        Self {
            batches,
            input,
            output,
            work,
            post_workers: 0,
            pooled_buffers: 2,
        }
    }

    pub fn with_post_workers(mut self, post_workers: usize) -> Self {
        self.post_workers = post_workers;
        self
    }

    pub fn with_pooled_buffers(mut self, pooled_buffers: usize) -> Self {
        self.pooled_buffers = pooled_buffers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batches == 0 {
            return Err(Error::InvalidConfig("batches must be at least 1".into()));
        }
        if self.pooled_buffers == 0 {
            return Err(Error::InvalidConfig(
                "pooled_buffers must be at least 1".into(),
            ));
        }
        self.work
            .validate()
            .map_err(|status| Error::InvalidConfig(format!("work size: {status}")))
    }
}
