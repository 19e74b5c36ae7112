//! Wide vector add through a four-slot pipeline.
//!
//! Every batch carries two vectors `a` and `b` of `u32`, packed back to back
//! in the slot's input. The kernel writes `c = a + b` to the output, and the
//! sink checks the result against a host-side add.
//!
//! ```text
//! wide-vadd [BATCHES] [ELEMENTS]
//! ```
//!
//! Set `RUST_LOG=tandem=debug` to watch the pipeline.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use clap::Parser;
use tandem::{
    BatchSink, BuildOptions, Device, Error, JobId, Kernel, KernelInitInfo, Launch, ParamKind,
    Pipeline, PipelineConfig, ProcessedBatch, Program, ResourceKind, Result, Status, WorkSize,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SLOTS: usize = 4;
const WORD: usize = std::mem::size_of::<u32>();

/// `c[i] = a[i] + b[i]`, processed `lanes` words at a time.
#[derive(Default)]
struct WideVadd {
    lanes: AtomicUsize,
}

#[async_trait]
impl Program for WideVadd {
    fn name(&self) -> &str {
        "wide_vadd"
    }

    fn params(&self) -> &[ParamKind] {
        &[ParamKind::Mem, ParamKind::Mem, ParamKind::U32]
    }

    fn build(&self, options: &BuildOptions) -> std::result::Result<(), String> {
        let lanes = options
            .value("LANES")
            .ok_or_else(|| "error: LANES is not defined".to_string())?
            .parse::<usize>()
            .map_err(|e| format!("error: LANES: {e}"))?;
        if lanes == 0 {
            return Err("error: LANES must be positive".into());
        }
        self.lanes.store(lanes, Ordering::Relaxed);
        Ok(())
    }

    async fn execute(&self, launch: Launch) -> std::result::Result<(), Status> {
        let elements = launch.u32(2)? as usize;
        let lanes = self.lanes.load(Ordering::Relaxed).max(1);
        let input = launch.mem(0)?.lock();
        let mut output = launch.mem(1)?.lock();
        if input.len() < 2 * elements * WORD || output.len() < elements * WORD {
            return Err(Status::InvalidBufferSize);
        }

        let (a, b) = input.split_at(elements * WORD);
        for ((c, a), b) in output
            .chunks_exact_mut(lanes * WORD)
            .zip(a.chunks_exact(lanes * WORD))
            .zip(b.chunks_exact(lanes * WORD))
        {
            add_words(c, a, b);
        }
        let tail = elements * WORD / (lanes * WORD) * (lanes * WORD);
        add_words(&mut output[tail..elements * WORD], &a[tail..], &b[tail..elements * WORD]);
        Ok(())
    }
}

fn add_words(c: &mut [u8], a: &[u8], b: &[u8]) {
    for ((c, a), b) in c
        .chunks_exact_mut(WORD)
        .zip(a.chunks_exact(WORD))
        .zip(b.chunks_exact(WORD))
    {
        let sum = word(a).wrapping_add(word(b));
        c.copy_from_slice(&sum.to_ne_bytes());
    }
}

fn word(bytes: &[u8]) -> u32 {
    let mut raw = [0; WORD];
    raw.copy_from_slice(bytes);
    u32::from_ne_bytes(raw)
}

fn operands(job: JobId, elements: usize, i: usize) -> (u32, u32) {
    let base = (job.batch * SLOTS + job.slot) * elements;
    ((base + i) as u32, (i * 3) as u32)
}

/// Checks every drained vector against a host-side add.
struct Verifier {
    elements: usize,
    mismatches: AtomicUsize,
    batches: AtomicUsize,
}

impl BatchSink for Verifier {
    fn consume(&self, batch: ProcessedBatch) -> Result<()> {
        let job = batch.job();
        let wrong = batch
            .chunks_exact(WORD)
            .enumerate()
            .filter(|(i, c)| {
                let (a, b) = operands(job, self.elements, *i);
                word(c) != a.wrapping_add(b)
            })
            .count();
        if wrong > 0 {
            warn!(%job, wrong, "result mismatch");
            self.mismatches.fetch_add(wrong, Ordering::Relaxed);
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "wide-vadd", version, about = "Wide vector add through a four-slot pipeline")]
struct Cli {
    /// Batches pushed through every slot.
    #[arg(default_value_t = 16)]
    batches: usize,

    /// `u32` elements per vector.
    #[arg(default_value_t = 1 << 16)]
    elements: usize,
}

fn run(cli: Cli) -> Result<()> {
    let Cli { batches, elements } = cli;
    let words = u32::try_from(elements)
        .map_err(|_| Error::InvalidConfig(format!("{elements} elements do not fit a u32")))?;

    let device = Device::cpu()?;
    let info = KernelInitInfo::new(Arc::new(WideVadd::default()))
        .with_options(BuildOptions::new().include("./").define("LANES", 16));
    let kernel = Kernel::build(&device, info)?;

    let config = PipelineConfig::new(
        batches,
        ResourceKind::bytes(2 * elements * WORD),
        ResourceKind::bytes(elements * WORD),
        WorkSize::linear(elements),
    )
    .with_post_workers(2)
    .with_pooled_buffers(SLOTS);
    let mut pipeline =
        Pipeline::<SLOTS>::new(&device, kernel, config)?.with_binder(move |kernel, slot| {
            kernel.push_arg(slot.input())?;
            kernel.push_arg(slot.output())?;
            kernel.push_arg(words)
        });

    let source = move |job: JobId, input: &mut [u8]| -> Result<()> {
        let (a, b) = input.split_at_mut(elements * WORD);
        for (i, (a, b)) in a.chunks_exact_mut(WORD).zip(b.chunks_exact_mut(WORD)).enumerate() {
            let (x, y) = operands(job, elements, i);
            a.copy_from_slice(&x.to_ne_bytes());
            b.copy_from_slice(&y.to_ne_bytes());
        }
        Ok(())
    };
    let verifier = Arc::new(Verifier {
        elements,
        mismatches: AtomicUsize::new(0),
        batches: AtomicUsize::new(0),
    });

    let report = pipeline.run(source, verifier.clone())?;
    info!(%report, "vector add finished");

    let mismatches = verifier.mismatches.load(Ordering::Relaxed);
    if mismatches > 0 {
        return Err(Error::Host(format!(
            "{mismatches} mismatched elements across {} batches",
            verifier.batches.load(Ordering::Relaxed)
        )));
    }
    info!(batches = verifier.batches.load(Ordering::Relaxed), "all results verified");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "wide-vadd failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["wide-vadd"]).unwrap();
        assert_eq!((cli.batches, cli.elements), (16, 1 << 16));
    }

    #[test]
    fn test_cli_positionals() {
        let cli = Cli::try_parse_from(["wide-vadd", "4", "128"]).unwrap();
        assert_eq!((cli.batches, cli.elements), (4, 128));
    }

    #[test]
    fn test_cli_rejects_non_numeric() {
        assert!(Cli::try_parse_from(["wide-vadd", "abc"]).is_err());
    }

    #[test]
    fn test_small_run_verifies() {
        let cli = Cli::try_parse_from(["wide-vadd", "3", "100"]).unwrap();
        assert_eq!(run(cli), Ok(()));
    }
}
