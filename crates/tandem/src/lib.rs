//! # Tandem
//!
//! Callback-driven double buffering between host I/O and device compute.
//!
//! ## Overview
//!
//! A [`Pipeline`] keeps `N` slots in flight. Each slot owns an input and an
//! output [`MappedResource`] that are reused for every batch. While the device
//! computes batch `b` of a slot, the host is already filling that slot's next
//! input and draining its previous output, so host I/O and device work overlap
//! instead of alternating.
//!
//! Nothing in the pipeline polls. Every map, unmap and compute invocation is
//! an asynchronous command on an in-order [`Queue`], gated on a wait list of
//! [`Event`]s. Host-side steps are represented by [`UserEvent`] triggers.
//! Device completion callbacks push job ids into [`Mailbox`]es that two host
//! worker threads block on.
//!
//! ## Architecture
//!
//! ### Device
//!
//! [`Device`], [`Queue`], [`Event`] and [`UserEvent`] model an asynchronous
//! accelerator driver in software. A device owns a multi-threaded runtime that
//! executes commands and delivers completion callbacks.
//!
//! ### Memory
//!
//! [`MappedResource`] is a buffer or 2-D image (see [`ResourceKind`]) visible
//! to the host between a resolved map and its paired unmap.
//!
//! ### Dispatch
//!
//! A [`Program`] is device code; [`Kernel`] binds its arguments positionally
//! and enqueues it with an [`EnqueueInfo`].
//!
//! ### Pipeline
//!
//! [`Pipeline`] wires one event graph per (slot, batch) [`JobId`], bounded to
//! two live generations per slot, and reports each run with a [`RunReport`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem::{Collector, Device, JobId, Kernel, KernelInitInfo, Passthrough, Pipeline, PipelineConfig, ResourceKind, WorkSize};
//!
//! let device = Device::cpu()?;
//! let kernel = Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough)))?;
//! let config = PipelineConfig::new(8, ResourceKind::bytes(1024), ResourceKind::bytes(1024), WorkSize::linear(1024));
//! let mut pipeline = Pipeline::<4>::new(&device, kernel, config)?;
//!
//! let sink = Arc::new(Collector::new());
//! let report = pipeline.run(|job: JobId, input: &mut [u8]| { input.fill(job.batch as u8); Ok(()) }, sink.clone())?;
//! println!("{report}");
//! ```

mod communication;
mod error;
mod status;

pub mod device;
pub mod dispatch;
pub mod memory;
pub mod pipeline;

pub use communication::{Closed, Mailbox};
pub use device::{
    Device, DeviceConfig, DeviceKind, DeviceSelector, Event, EventStatus, Queue, UserEvent,
};
pub use dispatch::{
    BuildOptions, EnqueueInfo, Kernel, KernelArg, KernelInitInfo, Launch, ParamKind, Passthrough,
    Program, WaitList, WorkSize,
};
pub use error::{Error, Result};
pub use memory::{Direction, ImageFormat, MappedResource, ResourceKind};
pub use pipeline::{
    BatchSink, BatchSource, Collector, JobId, Pipeline, PipelineConfig, ProcessedBatch, RunReport,
};
pub use status::{CommandKind, Status};
