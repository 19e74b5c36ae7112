use async_trait::async_trait;

use super::kernel::{Launch, ParamKind, Program};
use crate::status::Status;

/// Copies its first memory argument into its second.
///
/// When the arguments differ in size the shorter length is copied. Useful as
/// the compute stage of a pipeline whose work happens entirely on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl Program for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn params(&self) -> &[ParamKind] {
        &[ParamKind::Mem, ParamKind::Mem]
    }

    async fn execute(&self, launch: Launch) -> Result<(), Status> {
        let src = launch.mem(0)?;
        let dst = launch.mem(1)?;
        if src.ptr_eq(dst) {
            return Ok(());
        }
        let src = src.lock();
        let mut dst = dst.lock();
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::dispatch::{KernelArg, WorkSize};
    use crate::memory::{Direction, MappedResource, ResourceKind};

    #[tokio::test]
    async fn test_copies_shorter_length() {
        let device = Device::cpu().unwrap();
        let src =
            MappedResource::new(&device, ResourceKind::bytes(4), Direction::HostToDevice).unwrap();
        let dst =
            MappedResource::new(&device, ResourceKind::bytes(6), Direction::DeviceToHost).unwrap();
        src.device_mem().lock().copy_from_slice(&[1, 2, 3, 4]);

        let launch = Launch {
            args: vec![KernelArg::from(&src), KernelArg::from(&dst)],
            work: WorkSize::linear(4),
        };
        Passthrough.execute(launch).await.unwrap();
        assert_eq!(*dst.device_mem().lock(), [1, 2, 3, 4, 0, 0]);
    }

    #[tokio::test]
    async fn test_rejects_scalar_argument() {
        let launch = Launch {
            args: vec![KernelArg::U32(1), KernelArg::U32(2)],
            work: WorkSize::linear(1),
        };
        assert_eq!(Passthrough.execute(launch).await, Err(Status::InvalidArgValue));
    }
}
