//! Host/device dual-visibility memory.

mod format;
mod resource;

pub use format::{ChannelOrder, Direction, ImageFormat, ResourceKind, SampleFormat};
pub use resource::{DeviceMem, MappedResource};
