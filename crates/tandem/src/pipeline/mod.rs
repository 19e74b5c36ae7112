//! # Pipeline
//!
//! The orchestrator and everything it runs: the per-generation
//! [`JobChain`] bookkeeping, the fill, drain and post-processing workers, and
//! the [`BatchSource`] / [`BatchSink`] seams to host I/O.

mod config;
mod io;
mod job_chain;
mod orchestrator;
mod worker;

pub use config::PipelineConfig;
pub use io::{BatchSink, BatchSource, Collector, ProcessedBatch};
pub use job_chain::{JobChain, JobId, LiveNodes};
pub use orchestrator::{Pipeline, RunReport, Slot};
