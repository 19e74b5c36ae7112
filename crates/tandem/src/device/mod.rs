//! # Software Device
//!
//! The device layer models an asynchronous accelerator driver:
//!
//! * [`Device`] - opened from a [`DeviceSelector`], owns the runtime that
//!   executes commands and delivers completion callbacks.
//! * [`Queue`] - an in-order command queue; commands are gated on wait lists
//!   of events.
//! * [`Event`] / [`UserEvent`] - completion handles, resolved by the device or
//!   by the host respectively.

mod event;
mod queue;
mod software;

pub use event::{Event, EventStatus, UserEvent};
pub use queue::Queue;
pub(crate) use queue::work;
pub use software::{Device, DeviceConfig, DeviceInfo, DeviceKind, DeviceSelector};
