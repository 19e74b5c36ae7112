use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, instrument, trace};

use super::enqueue::{EnqueueInfo, WorkSize};
use crate::device::{Device, work};
use crate::error::{Error, Result};
use crate::memory::{DeviceMem, MappedResource};
use crate::status::{CommandKind, Status};

/// Declared type of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Mem,
    U32,
    I32,
    F32,
}

/// A bound kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Mem(DeviceMem),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl KernelArg {
    pub fn kind(&self) -> ParamKind {
        match self {
            KernelArg::Mem(_) => ParamKind::Mem,
            KernelArg::U32(_) => ParamKind::U32,
            KernelArg::I32(_) => ParamKind::I32,
            KernelArg::F32(_) => ParamKind::F32,
        }
    }
}

impl From<DeviceMem> for KernelArg {
    fn from(mem: DeviceMem) -> Self {
        KernelArg::Mem(mem)
    }
}

impl From<&MappedResource> for KernelArg {
    fn from(resource: &MappedResource) -> Self {
        KernelArg::Mem(resource.device_mem())
    }
}

impl From<u32> for KernelArg {
    fn from(value: u32) -> Self {
        KernelArg::U32(value)
    }
}

impl From<i32> for KernelArg {
    fn from(value: i32) -> Self {
        KernelArg::I32(value)
    }
}

impl From<f32> for KernelArg {
    fn from(value: f32) -> Self {
        KernelArg::F32(value)
    }
}

/// One compute invocation as seen by a [`Program`].
#[derive(Debug, Clone)]
pub struct Launch {
    pub args: Vec<KernelArg>,
    pub work: WorkSize,
}

impl Launch {
    pub fn mem(&self, index: usize) -> std::result::Result<&DeviceMem, Status> {
        match self.args.get(index) {
            Some(KernelArg::Mem(mem)) => Ok(mem),
            Some(_) => Err(Status::InvalidArgValue),
            None => Err(Status::InvalidArgIndex),
        }
    }

    pub fn u32(&self, index: usize) -> std::result::Result<u32, Status> {
        match self.args.get(index) {
            Some(KernelArg::U32(value)) => Ok(*value),
            Some(_) => Err(Status::InvalidArgValue),
            None => Err(Status::InvalidArgIndex),
        }
    }

    pub fn i32(&self, index: usize) -> std::result::Result<i32, Status> {
        match self.args.get(index) {
            Some(KernelArg::I32(value)) => Ok(*value),
            Some(_) => Err(Status::InvalidArgValue),
            None => Err(Status::InvalidArgIndex),
        }
    }

    pub fn f32(&self, index: usize) -> std::result::Result<f32, Status> {
        match self.args.get(index) {
            Some(KernelArg::F32(value)) => Ok(*value),
            Some(_) => Err(Status::InvalidArgValue),
            None => Err(Status::InvalidArgIndex),
        }
    }
}

/// Preprocessor-style options handed to a program's build step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    includes: Vec<String>,
    defines: Vec<(String, Option<String>)>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, dir: impl Into<String>) -> Self {
        self.includes.push(dir.into());
        self
    }

    pub fn define(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.defines.push((name.into(), Some(value.to_string())));
        self
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.defines.push((name.into(), None));
        self
    }

    /// Looks up the value of a `-D NAME=VALUE` definition.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.iter().any(|(key, _)| key == name)
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dir in &self.includes {
            write!(f, " -I {dir}")?;
        }
        for (name, value) in &self.defines {
            match value {
                Some(value) => write!(f, " -D {name}={value}")?,
                None => write!(f, " -D {name}")?,
            }
        }
        Ok(())
    }
}

/// A compiled compute program with a single entry point.
///
/// # Implementation Notes
///
/// `execute` runs on a device runtime thread. Implementations lock the
/// [`DeviceMem`] arguments they touch for the duration of the invocation and
/// must lock each distinct allocation only once.
///
/// # Example
///
/// ```ignore
/// use tandem::dispatch::{Launch, ParamKind, Program};
/// use tandem::Status;
/// use async_trait::async_trait;
///
/// struct Invert;
///
/// #[async_trait]
/// impl Program for Invert {
///     fn name(&self) -> &str { "invert" }
///     fn params(&self) -> &[ParamKind] { &[ParamKind::Mem] }
///
///     async fn execute(&self, launch: Launch) -> Result<(), Status> {
///         launch.mem(0)?.lock().iter_mut().for_each(|b| *b = !*b);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Program: Send + Sync + 'static {
    /// Name of the entry point.
    fn name(&self) -> &str;

    /// Parameter kinds in declaration order.
    fn params(&self) -> &[ParamKind];

    /// Prepares the program for the given options. Returns the build log on
    /// failure.
    fn build(&self, options: &BuildOptions) -> std::result::Result<(), String> {
        let _ = options;
        Ok(())
    }

    async fn execute(&self, launch: Launch) -> std::result::Result<(), Status>;
}

/// Inputs for [`Kernel::build`].
#[derive(Clone)]
pub struct KernelInitInfo {
    pub program: Arc<dyn Program>,
    pub options: BuildOptions,
}

impl KernelInitInfo {
    pub fn new(program: Arc<dyn Program>) -> Self {
        Self {
            program,
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }
}

/// # Kernel
///
/// The dispatcher: one bound program entry point plus positional argument
/// state.
///
/// Arguments are bound with [`push_arg`](Kernel::push_arg) in the program's
/// declared parameter order. Each bind advances an internal counter, which is
/// reset only by a successful [`enqueue`](Kernel::enqueue). A failed enqueue
/// leaves the bound arguments in place.
pub struct Kernel {
    program: Arc<dyn Program>,
    args: Vec<KernelArg>,
}

impl Kernel {
    /// Builds the program for `device`.
    ///
    /// # Errors
    ///
    /// [`Error::Build`] carrying the program's build log.
    #[instrument(skip_all, fields(kernel = info.program.name()))]
    pub fn build(device: &Device, info: KernelInitInfo) -> Result<Self> {
        debug!(device = %device.info().name, options = %info.options, "building kernel");
        if let Err(log) = info.program.build(&info.options) {
            error!(%log, "kernel build failed");
            return Err(Error::Build {
                kernel: info.program.name().to_string(),
                log,
            });
        }
        Ok(Self {
            program: info.program,
            args: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.program.name()
    }

    /// Number of arguments bound since the last successful enqueue.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Drops the arguments bound since the last successful enqueue.
    pub fn clear_args(&mut self) {
        self.args.clear();
    }

    /// Binds the next positional argument.
    pub fn push_arg(&mut self, arg: impl Into<KernelArg>) -> Result<()> {
        let arg = arg.into();
        let index = self.args.len();
        let status = match self.program.params().get(index) {
            None => Some(Status::InvalidArgIndex),
            Some(kind) if *kind != arg.kind() => Some(Status::InvalidArgValue),
            Some(_) => None,
        };
        if let Some(status) = status {
            error!(kernel = self.name(), index, %status, "setting kernel argument failed");
            return Err(Error::dispatch("set kernel argument", status));
        }
        self.args.push(arg);
        Ok(())
    }

    /// Submits the program with the bound arguments.
    ///
    /// On success the argument counter resets and, if requested,
    /// `info.completion_event` holds the invocation's completion event.
    pub fn enqueue(&mut self, info: &mut EnqueueInfo) -> Result<()> {
        let fail = |status: Status| {
            error!(kernel = self.name(), %status, "enqueue failed");
            Error::dispatch("enqueue", status)
        };
        if self.args.len() != self.program.params().len() {
            return Err(fail(Status::InvalidKernelArgs));
        }
        info.work.validate().map_err(fail)?;

        let launch = Launch {
            args: self.args.clone(),
            work: info.work,
        };
        let program = self.program.clone();
        let event = info
            .queue
            .submit(
                CommandKind::NdRange,
                info.wait_list.as_slice(),
                work(async move { program.execute(launch).await }),
            )
            .map_err(fail)?;

        trace!(
            kernel = self.name(),
            event = event.id(),
            waits = info.wait_list.len(),
            "kernel enqueued"
        );
        info.completion_event = info.needs_completion_event.then_some(event);
        self.args.clear();
        Ok(())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name())
            .field("arg_count", &self.args.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Queue, UserEvent};
    use crate::dispatch::Passthrough;
    use crate::memory::{Direction, ResourceKind};
    use std::time::Duration;

    struct Strict;

    #[async_trait]
    impl Program for Strict {
        fn name(&self) -> &str {
            "strict"
        }

        fn params(&self) -> &[ParamKind] {
            &[ParamKind::Mem]
        }

        fn build(&self, options: &BuildOptions) -> std::result::Result<(), String> {
            match options.value("TILE_ROWS") {
                Some(_) => Ok(()),
                None => Err("error: TILE_ROWS undeclared".to_string()),
            }
        }

        async fn execute(&self, launch: Launch) -> std::result::Result<(), Status> {
            launch.mem(0)?.lock().fill(0xAB);
            Ok(())
        }
    }

    fn resources(device: &Device) -> (MappedResource, MappedResource) {
        let input =
            MappedResource::new(device, ResourceKind::bytes(16), Direction::HostToDevice).unwrap();
        let output =
            MappedResource::new(device, ResourceKind::bytes(16), Direction::DeviceToHost).unwrap();
        (input, output)
    }

    #[test]
    fn test_build_options_display() {
        let options = BuildOptions::new()
            .include("./")
            .define("TILE_ROWS", 5)
            .define("TILE_COLS", 32)
            .flag("NVIDIA_ARCH");
        assert_eq!(
            options.to_string(),
            " -I ./ -D TILE_ROWS=5 -D TILE_COLS=32 -D NVIDIA_ARCH"
        );
        assert_eq!(options.value("TILE_COLS"), Some("32"));
        assert!(options.is_defined("NVIDIA_ARCH"));
        assert_eq!(options.value("NVIDIA_ARCH"), None);
    }

    #[test]
    fn test_build_failure_carries_log() {
        let device = Device::cpu().unwrap();
        let err = Kernel::build(&device, KernelInitInfo::new(Arc::new(Strict))).unwrap_err();
        assert_eq!(
            err,
            Error::Build {
                kernel: "strict".into(),
                log: "error: TILE_ROWS undeclared".into()
            }
        );

        let info = KernelInitInfo::new(Arc::new(Strict))
            .with_options(BuildOptions::new().define("TILE_ROWS", 5));
        assert!(Kernel::build(&device, info).is_ok());
    }

    #[test]
    fn test_arg_binding_is_positional() {
        let device = Device::cpu().unwrap();
        let (input, output) = resources(&device);
        let mut kernel =
            Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();

        assert_eq!(
            kernel.push_arg(7u32).unwrap_err(),
            Error::dispatch("set kernel argument", Status::InvalidArgValue)
        );
        assert_eq!(kernel.arg_count(), 0);

        kernel.push_arg(&input).unwrap();
        kernel.push_arg(&output).unwrap();
        assert_eq!(kernel.arg_count(), 2);
        assert_eq!(
            kernel.push_arg(&output).unwrap_err(),
            Error::dispatch("set kernel argument", Status::InvalidArgIndex)
        );
    }

    #[test]
    fn test_enqueue_requires_all_args() {
        let device = Device::cpu().unwrap();
        let (input, _output) = resources(&device);
        let queue = Queue::new(&device);
        let mut kernel =
            Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();

        kernel.push_arg(&input).unwrap();
        let mut info = EnqueueInfo::new(&queue, WorkSize::linear(16));
        assert_eq!(
            kernel.enqueue(&mut info).unwrap_err(),
            Error::dispatch("enqueue", Status::InvalidKernelArgs)
        );
        // failure keeps the counter
        assert_eq!(kernel.arg_count(), 1);
        kernel.clear_args();
        assert_eq!(kernel.arg_count(), 0);
    }

    #[test]
    fn test_enqueue_resets_counter_and_returns_event() {
        let device = Device::cpu().unwrap();
        let (input, output) = resources(&device);
        let queue = Queue::new(&device);
        let mut kernel =
            Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();

        input.device_mem().lock().copy_from_slice(&[3; 16]);
        kernel.push_arg(&input).unwrap();
        kernel.push_arg(&output).unwrap();

        let gate = UserEvent::new();
        let mut info = EnqueueInfo::new(&queue, WorkSize::linear(16));
        info.needs_completion_event = true;
        info.push_wait_event(gate.event().clone()).unwrap();
        kernel.enqueue(&mut info).unwrap();
        assert_eq!(kernel.arg_count(), 0);

        let done = info.completion_event.clone().unwrap();
        assert_eq!(done.wait_timeout(Duration::from_millis(20)), None);
        gate.set_complete();
        assert_eq!(done.wait(), Ok(()));
        assert_eq!(*output.device_mem().lock(), [3; 16]);
    }

    #[test]
    fn test_no_completion_event_unless_requested() {
        let device = Device::cpu().unwrap();
        let (input, output) = resources(&device);
        let queue = Queue::new(&device);
        let mut kernel =
            Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();
        kernel.push_arg(&input).unwrap();
        kernel.push_arg(&output).unwrap();

        let mut info = EnqueueInfo::new(&queue, WorkSize::linear(16));
        kernel.enqueue(&mut info).unwrap();
        assert!(info.completion_event.is_none());
        queue.finish().unwrap();
    }

    #[test]
    fn test_injected_enqueue_fault() {
        let device = Device::cpu().unwrap();
        device.inject_fault(CommandKind::NdRange, 0, Status::OutOfResources);
        let (input, output) = resources(&device);
        let queue = Queue::new(&device);
        let mut kernel =
            Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();
        kernel.push_arg(&input).unwrap();
        kernel.push_arg(&output).unwrap();

        let mut info = EnqueueInfo::new(&queue, WorkSize::linear(16));
        let err = kernel.enqueue(&mut info).unwrap_err();
        assert_eq!(err.to_string(), "enqueue failed: out of resources");
        assert_eq!(kernel.arg_count(), 2);
    }

    /// Writes the first offset component into its only argument.
    struct StampOffset;

    #[async_trait]
    impl Program for StampOffset {
        fn name(&self) -> &str {
            "stamp_offset"
        }

        fn params(&self) -> &[ParamKind] {
            &[ParamKind::Mem]
        }

        async fn execute(&self, launch: Launch) -> std::result::Result<(), Status> {
            let offset = launch.work.offset.map_or(0, |offset| offset[0]);
            launch.mem(0)?.lock().fill(offset as u8);
            Ok(())
        }
    }

    #[test]
    fn test_global_offset_reaches_program() {
        let device = Device::cpu().unwrap();
        let (_input, output) = resources(&device);
        let queue = Queue::new(&device);
        let mut kernel =
            Kernel::build(&device, KernelInitInfo::new(Arc::new(StampOffset))).unwrap();

        kernel.push_arg(&output).unwrap();
        let mut info = EnqueueInfo::new(&queue, WorkSize::linear(16).with_offset([7, 0, 0]));
        kernel.enqueue(&mut info).unwrap();
        queue.finish().unwrap();
        assert_eq!(*output.device_mem().lock(), [7; 16]);

        kernel.push_arg(&output).unwrap();
        let work = WorkSize::linear(16).with_offset([usize::MAX, 0, 0]);
        let mut info = EnqueueInfo::new(&queue, work);
        assert_eq!(
            kernel.enqueue(&mut info).unwrap_err(),
            Error::dispatch("enqueue", Status::InvalidGlobalOffset)
        );
    }
}
