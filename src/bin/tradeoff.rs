//! Experiment Runner for the Accuracy-Memory Trade-off Analysis.
//!
//! This executable loads one front from a MatrixMarket file and factors it once per
//! compression tolerance. For every tolerance it records the memory of the BLR factors,
//! the largest rank, the compression counters, the time of the factorization and the
//! relative error of the Schur complement against an uncompressed factorization of the
//! same front. Results are written as one CSV row per tolerance.
//!
//! With `--draw` the tile structure of `B11` at every tolerance is also written as a
//! gnuplot script next to the CSV file.

use anyhow::{Context, Result, anyhow, ensure};
use blr_frontal::{
    BlrOptions, Front, TileLayout,
    algorithms::{EliminationDriver, host::TaskDriver},
    stats::FactorStats,
    utils::data_loader::read_matrix_market,
};
use clap::Parser;
use faer::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufWriter, path::PathBuf, time::Instant};

/// Command-line arguments for the trade-off experiment.
#[derive(Parser, Debug)]
#[clap(
    name = "tradeoff-runner",
    about = "Sweeps the compression tolerance of a BLR partial factorization."
)]
struct TradeoffArgs {
    /// Path to the `.mtx` file holding the front.
    #[clap(long, value_name = "PATH")]
    input: PathBuf,
    /// Size of the pivot block; the rest of the front is the trailing block.
    #[clap(long)]
    n: usize,
    /// Tile size of the pivot block.
    #[clap(long, default_value_t = 64)]
    tile: usize,
    /// Tile size of the trailing block.
    #[clap(long, default_value_t = 64)]
    tile2: usize,
    /// Tolerances to sweep, comma separated.
    #[clap(long, value_delimiter = ',', default_value = "1e-2,1e-4,1e-6,1e-8,1e-10,1e-12")]
    tolerances: Vec<f64>,
    /// Number of worker threads, 0 for the rayon default.
    #[clap(long, default_value_t = 0)]
    threads: usize,
    /// Also write a gnuplot drawing of B11 per tolerance.
    #[clap(long)]
    draw: bool,
    /// Path to the output CSV file.
    #[clap(long, value_name = "PATH")]
    output: PathBuf,
}

/// A single row of the output CSV.
#[derive(Debug, Serialize, Deserialize)]
struct TradeoffResult {
    tolerance: f64,
    time_s: f64,
    memory_bytes: usize,
    dense_bytes: usize,
    max_rank: usize,
    tiles_compressed: u64,
    tiles_rejected: u64,
    tiles_skipped: u64,
    flops: u64,
    schur_error: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    let args = TradeoffArgs::parse();
    let f = read_matrix_market(&args.input)
        .with_context(|| format!("Failed to load front from {:?}", args.input))?;
    ensure!(f.nrows() == f.ncols(), "The front must be square.");
    ensure!(args.n <= f.nrows(), "The pivot block is larger than the front.");
    let n2 = f.nrows() - args.n;
    let layout = TileLayout::uniform(args.n, args.tile, n2, args.tile2);
    let driver = if args.threads > 0 {
        TaskDriver::with_threads(args.threads)?
    } else {
        TaskDriver::new()
    };
    log::info!("Loaded {}x{} front, n = {}, n2 = {n2}", f.nrows(), f.ncols(), args.n);

    // Reference: no tile is compressible when the minimum tile size exceeds the front.
    let exact = BlrOptions::default().with_min_tile_size(usize::MAX);
    let mut reference = Front::split(f.as_ref(), args.n)?;
    driver.partial_factor(&mut reference, &layout, &exact, &FactorStats::new())?;
    let reference_norm = reference.a22.norm_l2().max(f64::MIN_POSITIVE);
    let dense_bytes = (args.n * args.n + 2 * args.n * n2) * std::mem::size_of::<f64>();

    let mut writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("Failed to create CSV writer for {:?}", &args.output))?;

    for &tolerance in &args.tolerances {
        let opts = BlrOptions::default().with_rel_tol(tolerance);
        let stats = FactorStats::new();
        let mut front = Front::split(f.as_ref(), args.n)?;

        let start_time = Instant::now();
        let factors = driver.partial_factor(&mut front, &layout, &opts, &stats)?;
        let time_s = start_time.elapsed().as_secs_f64();

        let snapshot = stats.snapshot();
        let record = TradeoffResult {
            tolerance,
            time_s,
            memory_bytes: factors.memory(),
            dense_bytes,
            max_rank: factors.maximum_rank(),
            tiles_compressed: snapshot.tiles_compressed,
            tiles_rejected: snapshot.tiles_rejected,
            tiles_skipped: snapshot.tiles_skipped,
            flops: snapshot.flops,
            schur_error: (&front.a22 - &reference.a22).norm_l2() / reference_norm,
        };
        log::info!(
            "tol = {tolerance:e}: {:.2}s, {} of {} bytes, max rank {}, error {:.3e}",
            record.time_s,
            record.memory_bytes,
            record.dense_bytes,
            record.max_rank,
            record.schur_error
        );
        writer.serialize(&record)?;
        writer.flush()?;

        if args.draw {
            let path = args.output.with_extension(format!("tol{tolerance:e}.gnuplot"));
            let mut out = BufWriter::new(File::create(&path)?);
            factors.b11.draw(&mut out, 0, 0)?;
            log::info!("Drew B11 to {path:?}");
        }
    }

    log::info!("Trade-off experiment complete. Results saved to {:?}.", &args.output);
    Ok(())
}
