//! Experiment Runner for the Scalability Analysis.
//!
//! This executable orchestrates the scalability experiment. The primary process,
//! the "orchestrator," iterates through a range of front sizes. For each size it spawns
//! isolated "worker" child processes, one per driver (`host`, `device`), which generate
//! the front, run the partial factorization and report time and memory.
//!
//! Each worker runs in a separate process so that its peak RSS is not conflated with
//! that of the orchestrator or of other workers. The orchestrator captures the
//! single-row CSV output of each worker and aggregates all results into one CSV file.

use anyhow::{Context, Result, anyhow};
use blr_frontal::{
    BlrOptions, EliminationDriver,
    algorithms::{device::DeviceDriver, host::TaskDriver},
    device::HostDevice,
    stats::FactorStats,
    utils::{
        perf::peak_rss_kb,
        problems::{FrontalProblem, Kernel, ProblemSpec},
    },
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    process::{Command, Stdio},
    time::Instant,
};

/// Environment variable to differentiate between orchestrator and worker processes.
/// If this is set, the process runs in worker mode for the specified driver.
const DRIVER_ENV_VAR: &str = "BLR_SCALABILITY_DRIVER";

/// The elimination driver run by a worker process.
#[derive(ValueEnum, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Copy)]
#[serde(rename_all = "kebab-case")]
enum DriverKind {
    Host,
    Device,
}

/// Command-line arguments for the main orchestrator process.
#[derive(Parser, Debug)]
#[clap(
    name = "scalability-runner",
    about = "Runs the scalability analysis of the BLR partial factorization drivers."
)]
struct ScalabilityArgs {
    /// The smallest front size.
    #[clap(long)]
    size_start: usize,
    /// The largest front size.
    #[clap(long)]
    size_end: usize,
    /// The step between front sizes.
    #[clap(long)]
    size_step: usize,
    #[clap(flatten)]
    run: RunArgs,
    /// Path to the output CSV file for storing aggregated results.
    #[clap(long, value_name = "PATH")]
    output: PathBuf,
}

/// Parameters shared by the orchestrator and the workers.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// The kernel of the generated fronts.
    #[clap(long, default_value = "inverse")]
    kernel: Kernel,
    /// Fraction of the front that forms the pivot block.
    #[clap(long, default_value_t = 0.75)]
    pivot_fraction: f64,
    /// Tile size of both blocks.
    #[clap(long, default_value_t = 128)]
    tile: usize,
    /// Compression tolerance.
    #[clap(long, default_value_t = 1e-6)]
    tolerance: f64,
    /// Number of worker threads of the host driver, 0 for the rayon default.
    #[clap(long, default_value_t = 0)]
    threads: usize,
}

/// Command-line arguments for the isolated worker processes.
#[derive(Parser, Debug)]
struct WorkerArgs {
    /// The size of the front to factor.
    #[clap(long)]
    size: usize,
    #[clap(flatten)]
    run: RunArgs,
}

/// Represents a single row of data in the final output CSV.
#[derive(Debug, Serialize, Deserialize)]
struct ScalabilityResult {
    driver: DriverKind,
    size: usize,
    n: usize,
    threads: usize,
    time_s: f64,
    memory_bytes: usize,
    flops: u64,
    batched_calls: u64,
    rss_kb: u64,
}

/// Main entry point.
///
/// Dispatches to either the orchestrator or a worker based on the presence of the
/// `BLR_SCALABILITY_DRIVER` environment variable.
fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    if let Ok(driver_str) = std::env::var(DRIVER_ENV_VAR) {
        let driver = DriverKind::from_str(&driver_str, true)
            .map_err(|_| anyhow!("Invalid driver string in env var: {}", driver_str))?;
        run_worker(driver)
    } else {
        run_orchestrator()
    }
}

/// Orchestrator logic.
///
/// Results are written to the output CSV file incrementally so that data is kept even if
/// a run fails mid-way through the experiment.
fn run_orchestrator() -> Result<()> {
    let args = ScalabilityArgs::parse();
    log::info!("Orchestrator starting scalability experiment...");

    let mut writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("Failed to create CSV writer for {:?}", &args.output))?;

    for size in (args.size_start..=args.size_end).step_by(args.size_step.max(1)) {
        log::info!("Processing front size: {size}");
        for driver in [DriverKind::Host, DriverKind::Device] {
            let Some(name) = driver.to_possible_value() else {
                continue;
            };
            let current_exe = std::env::current_exe()?;
            let child = Command::new(current_exe)
                .arg("--size")
                .arg(size.to_string())
                .arg("--kernel")
                .arg(args.run.kernel.to_string())
                .arg("--pivot-fraction")
                .arg(args.run.pivot_fraction.to_string())
                .arg("--tile")
                .arg(args.run.tile.to_string())
                .arg("--tolerance")
                .arg(args.run.tolerance.to_string())
                .arg("--threads")
                .arg(args.run.threads.to_string())
                .env(DRIVER_ENV_VAR, name.get_name())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .with_context(|| format!("Failed to spawn worker for driver {driver:?}"))?;

            let output = child.wait_with_output()?;
            if !output.status.success() {
                log::error!(
                    "Worker for driver {:?} at size {} failed with status: {}. Skipping.",
                    driver,
                    size,
                    output.status
                );
                continue;
            }

            let mut rdr = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_reader(output.stdout.as_slice());
            match rdr.deserialize::<ScalabilityResult>().next() {
                Some(Ok(record)) => {
                    log::info!(
                        "Worker finished. Result: driver={:?}, size={}, time={:.2}s, rss={}KB",
                        record.driver,
                        record.size,
                        record.time_s,
                        record.rss_kb
                    );
                    writer.serialize(&record)?;
                    writer.flush()?;
                }
                Some(Err(e)) => {
                    log::error!("Failed to parse worker output as CSV: {}. Skipping record.", e);
                }
                None => {
                    log::warn!("Worker for {:?} produced no output. Skipping record.", driver);
                }
            }
        }
    }

    log::info!(
        "Scalability experiment complete. Results saved to {:?}.",
        &args.output
    );
    Ok(())
}

/// Worker logic.
///
/// Generates one front, factors it with the requested driver and prints a single
/// `ScalabilityResult` to stdout as a CSV row.
fn run_worker(driver: DriverKind) -> Result<()> {
    let args = WorkerArgs::parse();
    log::info!("Worker for {driver:?} started.");

    let n = ((args.size as f64) * args.run.pivot_fraction).round() as usize;
    let n = n.min(args.size);
    let spec = ProblemSpec::new(args.run.kernel, args.size);
    let mut problem = FrontalProblem::new(spec, n, args.run.tile, args.run.tile)?;
    let opts = BlrOptions::default().with_rel_tol(args.run.tolerance);
    let stats = FactorStats::new();

    let host;
    let device;
    let (elimination, threads): (&dyn EliminationDriver, usize) = match driver {
        DriverKind::Host => {
            host = if args.run.threads > 0 {
                TaskDriver::with_threads(args.run.threads)?
            } else {
                TaskDriver::new()
            };
            (&host, host.threads())
        }
        DriverKind::Device => {
            device = DeviceDriver::new(HostDevice::new());
            (&device, rayon::current_num_threads())
        }
    };

    let start_time = Instant::now();
    let factors = elimination.partial_factor(&mut problem.front, &problem.layout, &opts, &stats)?;
    let time_s = start_time.elapsed().as_secs_f64();
    let rss_kb = peak_rss_kb();
    let snapshot = stats.snapshot();

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(std::io::stdout());
    writer.serialize(ScalabilityResult {
        driver,
        size: args.size,
        n,
        threads,
        time_s,
        memory_bytes: factors.memory(),
        flops: snapshot.flops,
        batched_calls: snapshot.batched_calls,
        rss_kb,
    })?;
    writer.flush()?;

    log::info!("Worker for {driver:?} finished.");
    Ok(())
}
