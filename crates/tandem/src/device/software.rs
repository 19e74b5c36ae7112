use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::status::{CommandKind, Status};

/// The class of compute device requested by a [`DeviceSelector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    #[default]
    Cpu,
    Gpu,
    Accelerator,
    Custom,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Accelerator => "ACCELERATOR",
            DeviceKind::Custom => "CUSTOM",
        };
        f.write_str(name)
    }
}

/// Identifies a device by platform index, device kind and index within that
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSelector {
    pub platform: usize,
    pub kind: DeviceKind,
    pub index: usize,
}

/// Configuration for opening a [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub selector: DeviceSelector,
    /// Number of runtime threads executing queued commands and callbacks.
    pub compute_units: usize,
    /// Largest single allocation the device accepts, in bytes.
    pub max_alloc_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::default(),
            compute_units: 4,
            max_alloc_bytes: 1 << 30,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compute_units == 0 {
            return Err(Error::InvalidConfig(
                "device needs at least one compute unit".into(),
            ));
        }
        if self.max_alloc_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_alloc_bytes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Static description of an opened device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub selector: DeviceSelector,
    pub compute_units: usize,
    pub max_alloc_bytes: usize,
}

/// Devices exposed by the software backend, as `(platform, kind, index)`.
const AVAILABLE: &[(usize, DeviceKind, usize)] = &[(0, DeviceKind::Cpu, 0)];

/// # Device
///
/// Handle to the software compute device.
///
/// The device owns a multi-threaded runtime. Every [`Queue`](super::Queue)
/// created on the device runs as a task on that runtime, and completion
/// callbacks fire on its worker threads, which stand in for a driver's
/// callback thread pool.
///
/// Cloning a device is cheap; the runtime shuts down when the last clone (and
/// every queue and resource holding one) is dropped.
#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

struct Shared {
    info: DeviceInfo,
    handle: Handle,
    faults: FaultPlan,
    _runtime: RuntimeGuard,
}

/// Shuts the runtime down without blocking, so the last handle may be dropped
/// from any thread.
struct RuntimeGuard(Option<Runtime>);

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl Device {
    /// Opens the device named by `config.selector`.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the selector names no available device,
    /// [`Error::DeviceInit`] if the runtime could not be started.
    #[instrument(skip(config), fields(selector = ?config.selector))]
    pub fn open(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let DeviceSelector { platform, kind, index } = config.selector;
        if !AVAILABLE.contains(&(platform, kind, index)) {
            warn!(platform, %kind, index, "requested device is not available");
            return Err(Error::DeviceNotFound { platform, kind, index });
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.compute_units)
            .thread_name("tandem-device")
            .enable_time()
            .build()
            .map_err(|e| Error::DeviceInit(e.to_string()))?;
        let handle = runtime.handle().clone();

        let info = DeviceInfo {
            name: format!("tandem software {kind} {platform}.{index}"),
            selector: config.selector,
            compute_units: config.compute_units,
            max_alloc_bytes: config.max_alloc_bytes,
        };
        info!(name = %info.name, compute_units = info.compute_units, "device opened");

        Ok(Self {
            shared: Arc::new(Shared {
                info,
                handle,
                faults: FaultPlan::default(),
                _runtime: RuntimeGuard(Some(runtime)),
            }),
        })
    }

    /// Opens the default CPU device.
    pub fn cpu() -> Result<Self> {
        Self::open(DeviceConfig::default())
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    /// Makes the `nth` (zero-based) future submission of `kind` on this device
    /// fail synchronously with `status`.
    ///
    /// Intended for exercising failure paths; submissions are counted across
    /// every queue of the device.
    pub fn inject_fault(&self, kind: CommandKind, nth: usize, status: Status) {
        debug!(%kind, nth, %status, "fault injected");
        self.shared.faults.add(kind, nth, status);
    }

    pub(crate) fn check_submit(&self, kind: CommandKind) -> std::result::Result<(), Status> {
        self.shared.faults.check(kind)
    }

    pub(crate) fn check_alloc(&self, bytes: usize) -> std::result::Result<(), Status> {
        if bytes == 0 {
            return Err(Status::InvalidBufferSize);
        }
        if bytes > self.shared.info.max_alloc_bytes {
            return Err(Status::MemObjectAllocationFailure);
        }
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("info", &self.shared.info).finish()
    }
}

#[derive(Default)]
struct FaultPlan {
    state: Mutex<FaultState>,
}

#[derive(Default)]
struct FaultState {
    rules: Vec<(CommandKind, usize, Status)>,
    submitted: HashMap<CommandKind, usize>,
}

impl FaultPlan {
    fn add(&self, kind: CommandKind, nth: usize, status: Status) {
        self.state.lock().rules.push((kind, nth, status));
    }

    fn check(&self, kind: CommandKind) -> std::result::Result<(), Status> {
        let mut state = self.state.lock();
        let counter = state.submitted.entry(kind).or_insert(0);
        let nth = *counter;
        *counter += 1;
        match state.rules.iter().find(|(k, n, _)| *k == kind && *n == nth) {
            Some((_, _, status)) => Err(*status),
            None => Ok(()),
        }
    }
}
