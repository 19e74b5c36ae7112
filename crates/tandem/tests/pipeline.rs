use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tandem::dispatch::KernelArg;
use tandem::memory::{ChannelOrder, SampleFormat};
use tandem::{
    Collector, CommandKind, Device, Direction, EnqueueInfo, Error, ImageFormat, JobId, Kernel,
    KernelInitInfo, Launch, MappedResource, ParamKind, Passthrough, Pipeline, PipelineConfig,
    ProcessedBatch, Program, ResourceKind, Result, Status, WorkSize,
};

const BYTES: usize = 64;

fn seed(job: JobId) -> u8 {
    (job.slot * 31 + job.batch * 7) as u8
}

/// Every byte depends on the job and its position, so stale data shows.
fn expected(job: JobId, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed(job).wrapping_add(i as u8)).collect()
}

fn stamp(job: JobId, input: &mut [u8]) -> Result<()> {
    input.copy_from_slice(&expected(job, input.len()));
    Ok(())
}

fn config(batches: usize) -> PipelineConfig {
    PipelineConfig::new(
        batches,
        ResourceKind::bytes(BYTES),
        ResourceKind::bytes(BYTES),
        WorkSize::linear(BYTES),
    )
}

fn passthrough<const N: usize>(device: &Device, config: PipelineConfig) -> Pipeline<N> {
    let kernel = Kernel::build(device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();
    Pipeline::new(device, kernel, config).unwrap()
}

fn assert_identity(batches: Vec<(JobId, Vec<u8>)>) {
    for (job, bytes) in batches {
        assert_eq!(bytes, expected(job, bytes.len()), "job {job}");
    }
}

fn run_counts<const N: usize>(batches: usize) {
    let device = Device::cpu().unwrap();
    let mut pipeline = passthrough::<N>(&device, config(batches));
    let collector = Arc::new(Collector::new());

    let report = pipeline.run(stamp, collector.clone()).unwrap();

    assert_eq!(report.filled, N * batches);
    assert_eq!(report.drained, N * batches);
    let collected = collector.take();
    assert_eq!(collected.len(), N * batches);
    for slot in 0..N {
        let ids: Vec<usize> = collected
            .iter()
            .filter(|(job, _)| job.slot == slot)
            .map(|(job, _)| job.batch)
            .collect();
        assert_eq!(ids, (0..batches).collect::<Vec<_>>());
    }
}

#[test]
fn test_every_job_is_filled_and_drained_once() {
    for batches in [1, 2, 5] {
        run_counts::<1>(batches);
        run_counts::<2>(batches);
        run_counts::<3>(batches);
        run_counts::<4>(batches);
    }
}

#[test]
fn test_identity_compute_preserves_bytes() {
    let device = Device::cpu().unwrap();
    let mut pipeline = passthrough::<3>(&device, config(6));
    let collector = Arc::new(Collector::new());

    pipeline.run(stamp, collector.clone()).unwrap();

    assert_identity(collector.take());
}

#[test]
fn test_live_nodes_stay_within_two_per_slot() {
    let device = Device::cpu().unwrap();
    let mut pipeline = passthrough::<3>(&device, config(8));
    let collector = Arc::new(Collector::new());
    let slow = {
        let collector = collector.clone();
        move |batch: ProcessedBatch| -> Result<()> {
            thread::sleep(Duration::from_millis(2));
            tandem::BatchSink::consume(&*collector, batch)
        }
    };

    let report = pipeline.run(stamp, Arc::new(slow)).unwrap();

    assert!(report.peak_live_nodes >= 3, "peak {}", report.peak_live_nodes);
    assert!(report.peak_live_nodes <= 6, "peak {}", report.peak_live_nodes);
    assert_identity(collector.take());
}

#[test]
fn test_live_nodes_bound_holds_across_repeated_runs() {
    let device = Device::cpu().unwrap();
    let mut pipeline = passthrough::<3>(&device, config(5));
    for _ in 0..100 {
        let report = pipeline.run(stamp, Arc::new(Collector::new())).unwrap();
        assert!(report.peak_live_nodes <= 6, "peak {}", report.peak_live_nodes);
    }
}

#[test]
fn test_single_job_matches_synchronous_cycle() {
    let device = Device::cpu().unwrap();
    let job = JobId::new(0, 0);

    // by hand: map, fill, unmap, compute, map, read, unmap
    let input =
        MappedResource::new(&device, ResourceKind::bytes(BYTES), Direction::HostToDevice).unwrap();
    let output =
        MappedResource::new(&device, ResourceKind::bytes(BYTES), Direction::DeviceToHost).unwrap();
    let mut kernel = Kernel::build(&device, KernelInitInfo::new(Arc::new(Passthrough))).unwrap();

    input.map(&[], true).unwrap();
    input.with_host_mut(|host| stamp(job, host)).unwrap();
    input.unmap(&[]).unwrap().wait().unwrap();
    kernel.push_arg(&input).unwrap();
    kernel.push_arg(&output).unwrap();
    let mut info = EnqueueInfo::new(input.queue(), WorkSize::linear(BYTES));
    info.needs_completion_event = true;
    kernel.enqueue(&mut info).unwrap();
    info.completion_event.unwrap().wait().unwrap();
    output.map(&[], true).unwrap();
    let by_hand = output.with_host(|host| host.to_vec());
    output.unmap(&[]).unwrap().wait().unwrap();

    let mut pipeline = passthrough::<1>(&device, config(1));
    let collector = Arc::new(Collector::new());
    let report = pipeline.run(stamp, collector.clone()).unwrap();

    assert_eq!(report.filled, 1);
    assert_eq!(collector.take(), vec![(job, by_hand)]);
    assert!(!pipeline.slots()[0].output().is_mapped());
}

#[test]
fn test_enqueue_failure_aborts_run() {
    let device = Device::cpu().unwrap();
    let mut pipeline = passthrough::<1>(&device, config(4));
    device.inject_fault(CommandKind::NdRange, 2, Status::OutOfResources);
    let collector = Arc::new(Collector::new());

    let err = pipeline.run(stamp, collector.clone()).unwrap_err();

    assert_eq!(
        err,
        Error::Dispatch {
            op: "enqueue",
            status: Status::OutOfResources
        }
    );
    let drained = collector.take();
    assert_eq!(drained.len(), 2);
    assert_identity(drained);

    // the pipeline is usable again
    let report = pipeline.run(stamp, collector.clone()).unwrap();
    assert_eq!(report.drained, 4);
}

struct FailOnMarker;

#[async_trait]
impl Program for FailOnMarker {
    fn name(&self) -> &str {
        "fail_on_marker"
    }

    fn params(&self) -> &[ParamKind] {
        &[ParamKind::Mem, ParamKind::Mem]
    }

    async fn execute(&self, launch: Launch) -> std::result::Result<(), Status> {
        let marked = launch.mem(0)?.lock()[0] == 0xFF;
        if marked {
            return Err(Status::OutOfResources);
        }
        Passthrough.execute(launch).await
    }
}

#[test]
fn test_device_side_failure_reports_root_cause() {
    let device = Device::cpu().unwrap();
    let kernel = Kernel::build(&device, KernelInitInfo::new(Arc::new(FailOnMarker))).unwrap();
    let mut pipeline = Pipeline::<2>::new(&device, kernel, config(4)).unwrap();
    let collector = Arc::new(Collector::new());
    let source = |job: JobId, input: &mut [u8]| -> Result<()> {
        stamp(job, input)?;
        if job == JobId::new(1, 2) {
            input[0] = 0xFF;
        }
        Ok(())
    };

    let err = pipeline.run(source, collector.clone()).unwrap_err();

    assert_eq!(
        err,
        Error::Dispatch {
            op: "enqueue",
            status: Status::OutOfResources
        }
    );
    let drained = collector.take();
    assert!(drained.iter().all(|(job, _)| *job != JobId::new(1, 2)));
    assert_identity(drained);
}

#[test]
fn test_sink_failure_aborts_run() {
    let device = Device::cpu().unwrap();
    let mut pipeline = passthrough::<2>(&device, config(3));
    let sink = |batch: ProcessedBatch| -> Result<()> {
        if batch.job() == JobId::new(0, 1) {
            return Err(Error::Host("disk full".into()));
        }
        Ok(())
    };

    let err = pipeline.run(stamp, Arc::new(sink)).unwrap_err();
    assert_eq!(err, Error::Host("disk full".into()));
}

#[test]
fn test_post_processing_workers_deliver_every_batch() {
    let device = Device::cpu().unwrap();
    let config = config(5).with_post_workers(3).with_pooled_buffers(2);
    let mut pipeline = passthrough::<2>(&device, config);
    let collector = Arc::new(Collector::new());

    let report = pipeline.run(stamp, collector.clone()).unwrap();

    assert_eq!(report.drained, 10);
    let collected = collector.take();
    assert_eq!(collected.len(), 10);
    assert_identity(collected);
}

struct AddScalar;

#[async_trait]
impl Program for AddScalar {
    fn name(&self) -> &str {
        "add_scalar"
    }

    fn params(&self) -> &[ParamKind] {
        &[ParamKind::Mem, ParamKind::Mem, ParamKind::U32]
    }

    async fn execute(&self, launch: Launch) -> std::result::Result<(), Status> {
        let delta = launch.u32(2)? as u8;
        let src = launch.mem(0)?.lock();
        let mut dst = launch.mem(1)?.lock();
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d = s.wrapping_add(delta);
        }
        Ok(())
    }
}

#[test]
fn test_custom_binder_passes_scalars() {
    let device = Device::cpu().unwrap();
    let kernel = Kernel::build(&device, KernelInitInfo::new(Arc::new(AddScalar))).unwrap();
    let mut pipeline = Pipeline::<2>::new(&device, kernel, config(3))
        .unwrap()
        .with_binder(|kernel, slot| {
            kernel.push_arg(slot.input())?;
            kernel.push_arg(slot.output())?;
            kernel.push_arg(KernelArg::U32(3))
        });
    let collector = Arc::new(Collector::new());

    pipeline.run(stamp, collector.clone()).unwrap();

    for (job, bytes) in collector.take() {
        let want: Vec<u8> = expected(job, BYTES).iter().map(|b| b.wrapping_add(3)).collect();
        assert_eq!(bytes, want, "job {job}");
    }
}

#[test]
fn test_binder_mismatch_aborts_run() {
    let device = Device::cpu().unwrap();
    let kernel = Kernel::build(&device, KernelInitInfo::new(Arc::new(AddScalar))).unwrap();
    let mut pipeline = Pipeline::<1>::new(&device, kernel, config(2)).unwrap();

    let err = pipeline.run(stamp, Arc::new(Collector::new())).unwrap_err();
    assert_eq!(
        err,
        Error::Dispatch {
            op: "enqueue",
            status: Status::InvalidKernelArgs
        }
    );
}

#[test]
fn test_image_slots() {
    let device = Device::cpu().unwrap();
    let format = ImageFormat::new(ChannelOrder::Rgba, SampleFormat::UInt8);
    let image = ResourceKind::image(8, 2, format);
    assert_eq!(image.byte_size(), BYTES);
    let config = PipelineConfig::new(3, image, image, WorkSize::planar([8, 2], [4, 2]));
    let mut pipeline = passthrough::<2>(&device, config);
    let collector = Arc::new(Collector::new());

    pipeline.run(stamp, collector.clone()).unwrap();

    let collected = collector.take();
    assert_eq!(collected.len(), 6);
    assert_identity(collected);
}
