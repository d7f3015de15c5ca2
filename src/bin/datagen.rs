//! A data generation utility for creating synthetic frontal matrices.
//!
//! This binary samples points on the unit interval, fills a dense kernel matrix over
//! them and writes it in the MatrixMarket `array` format. The experiment binaries read
//! these files back, so every run of an experiment sees exactly the same front.

use anyhow::{Context, Result, anyhow, ensure};
use blr_frontal::utils::{
    data_loader::write_matrix_market,
    problems::{Kernel, ProblemSpec},
};
use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the data generator.
#[derive(Parser, Debug)]
#[clap(
    name = "datagen",
    about = "Generates a dense kernel matrix and writes it as a MatrixMarket file."
)]
struct DataGenArgs {
    /// The kernel: `exponential`, `inverse` or `random`.
    #[clap(long, default_value = "inverse")]
    kernel: Kernel,
    /// The size of the front (n + n2).
    #[clap(long)]
    size: usize,
    /// The correlation length of the kernel.
    #[clap(long, default_value_t = 0.1)]
    length: f64,
    /// The shift added to the diagonal.
    #[clap(long, default_value_t = 1.0)]
    shift: f64,
    /// The seed of the point sampler.
    #[clap(long, default_value_t = 42)]
    seed: u64,
    /// Path of the `.mtx` file to write.
    #[clap(long, value_name = "PATH")]
    output: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    let args = DataGenArgs::parse();
    ensure!(args.size > 0, "The size must be positive.");
    ensure!(args.length > 0.0, "The correlation length must be positive.");

    let spec = ProblemSpec::new(args.kernel, args.size)
        .with_length(args.length)
        .with_shift(args.shift)
        .with_seed(args.seed);
    log::info!("Generating {spec:?}");
    let a = spec.matrix();

    if let Some(parent) = args.output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {parent:?}"))?;
    }
    write_matrix_market(&args.output, a.as_ref())
        .with_context(|| format!("Failed to write {:?}", args.output))?;
    log::info!("Wrote {}x{} matrix to {:?}", a.nrows(), a.ncols(), args.output);
    Ok(())
}
