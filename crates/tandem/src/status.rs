use std::fmt;

/// Status codes reported by the device runtime.
///
/// Every failing driver call is described by one of these codes. The
/// [`Display`](fmt::Display) implementation is the human-readable translation
/// that ends up in logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Status {
    #[error("device not found")]
    DeviceNotFound,
    #[error("device not available")]
    DeviceNotAvailable,
    #[error("compiler not available")]
    CompilerNotAvailable,
    #[error("memory object allocation failure")]
    MemObjectAllocationFailure,
    #[error("out of resources")]
    OutOfResources,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("image format not supported")]
    ImageFormatNotSupported,
    #[error("program build failure")]
    BuildProgramFailure,
    #[error("map failure")]
    MapFailure,
    #[error("execution status error for events in wait list")]
    ExecStatusErrorForEventsInWaitList,
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid device type")]
    InvalidDeviceType,
    #[error("invalid platform")]
    InvalidPlatform,
    #[error("invalid command queue")]
    InvalidCommandQueue,
    #[error("invalid memory object")]
    InvalidMemObject,
    #[error("invalid image size")]
    InvalidImageSize,
    #[error("invalid buffer size")]
    InvalidBufferSize,
    #[error("invalid kernel")]
    InvalidKernel,
    #[error("invalid argument index")]
    InvalidArgIndex,
    #[error("invalid argument value")]
    InvalidArgValue,
    #[error("invalid kernel arguments")]
    InvalidKernelArgs,
    #[error("invalid work dimension")]
    InvalidWorkDimension,
    #[error("invalid work group size")]
    InvalidWorkGroupSize,
    #[error("invalid global offset")]
    InvalidGlobalOffset,
    #[error("invalid event wait list")]
    InvalidEventWaitList,
    #[error("invalid event")]
    InvalidEvent,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("aborted by host")]
    Aborted,
}

/// The kind of command a queue executes. Used to label events and to target
/// injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Map,
    Unmap,
    NdRange,
    Marker,
    User,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Map => "map",
            CommandKind::Unmap => "unmap",
            CommandKind::NdRange => "enqueue",
            CommandKind::Marker => "marker",
            CommandKind::User => "user event",
        };
        f.write_str(name)
    }
}
