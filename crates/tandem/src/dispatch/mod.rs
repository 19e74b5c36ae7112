//! # Dispatch
//!
//! Binding arguments to a compute program and submitting it on a queue.
//!
//! A [`Program`] is the device code; a [`Kernel`] is a built program plus its
//! positional argument state. [`EnqueueInfo`] carries the queue, the
//! [`WorkSize`] and the [`WaitList`] for one submission.

mod builtin;
mod enqueue;
mod kernel;

pub use builtin::Passthrough;
pub use enqueue::{EnqueueInfo, MAX_ENQUEUE_WAIT_EVENTS, WaitList, WorkSize};
pub use kernel::{BuildOptions, Kernel, KernelArg, KernelInitInfo, Launch, ParamKind, Program};
