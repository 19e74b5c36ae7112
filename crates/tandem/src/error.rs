//! Typed errors for the pipeline.
//!
//! Every failure is terminal for the run that hit it; nothing in the crate
//! retries. Driver failures carry the translated [`Status`].

use crate::device::DeviceKind;
use crate::status::Status;

/// All errors originating from tandem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    // ── Device ───────────────────────────────────────────────────────
    #[error("no {kind} device at platform {platform}, index {index}")]
    DeviceNotFound {
        platform: usize,
        kind: DeviceKind,
        index: usize,
    },

    #[error("device runtime failed to start: {0}")]
    DeviceInit(String),

    // ── Resources ────────────────────────────────────────────────────
    #[error("allocation of {bytes} bytes failed: {status}")]
    Allocation { bytes: usize, status: Status },

    // ── Dispatch ─────────────────────────────────────────────────────
    #[error("{op} failed: {status}")]
    Dispatch { op: &'static str, status: Status },

    #[error("build of kernel `{kernel}` failed:\n{log}")]
    Build { kernel: String, log: String },

    #[error("wait list is full ({capacity} events)")]
    WaitListFull { capacity: usize },

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("mailbox is closed")]
    MailboxClosed,

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} worker panicked")]
    WorkerPanicked(String),

    #[error("failed to spawn {name} worker: {reason}")]
    WorkerSpawn { name: String, reason: String },

    #[error("host I/O failed: {0}")]
    Host(String),

    #[error("pipeline aborted")]
    Aborted,
}

impl Error {
    pub(crate) fn dispatch(op: &'static str, status: Status) -> Self {
        Error::Dispatch { op, status }
    }

    /// The driver status behind this error, if there is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Allocation { status, .. } | Error::Dispatch { status, .. } => Some(*status),
            Error::Build { .. } => Some(Status::BuildProgramFailure),
            Error::DeviceNotFound { .. } => Some(Status::DeviceNotFound),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
