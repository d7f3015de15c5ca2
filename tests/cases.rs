//! Data-driven test cases.
//!
//! Each `data/cases/*.case` file describes a synthetic front, its tiling and a
//! compression tolerance as `key = value` lines. The build script turns every file into
//! one test per driver. A case passes when the Schur complement is within `max_error`
//! (relative) of a dense reference and a full frontal solve reproduces a known solution
//! to the same accuracy.

use anyhow::{Context, Result, anyhow, ensure};
use blr_frontal::{
    BlrOptions, EliminationDriver, FactorStats, Front, TileLayout,
    algorithms::{device::DeviceDriver, host::TaskDriver},
    dense_schur_solver,
    device::HostDevice,
    solve_front,
    utils::problems::{Kernel, ProblemSpec},
};
use faer::prelude::*;
use std::{collections::HashMap, path::Path};

#[derive(Debug, Clone, Copy)]
enum Driver {
    Host,
    Device,
}

#[derive(Debug)]
struct Case {
    kernel: Kernel,
    n: usize,
    n2: usize,
    tile: usize,
    tile2: usize,
    tolerance: f64,
    seed: u64,
    max_error: f64,
}

impl Case {
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
        let mut fields = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("Malformed line in {path:?}: '{line}'"))?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
        let get = |key: &str| {
            fields
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| anyhow!("Missing '{key}' in {path:?}"))
        };
        Ok(Self {
            kernel: get("kernel")?.parse().map_err(|e: String| anyhow!(e))?,
            n: get("n")?.parse()?,
            n2: get("n2")?.parse()?,
            tile: get("tile")?.parse()?,
            tile2: get("tile2")?.parse()?,
            tolerance: get("tolerance")?.parse()?,
            seed: get("seed")?.parse()?,
            max_error: get("max_error")?.parse()?,
        })
    }
}

fn run_case(case: &Case, driver: Driver) -> Result<()> {
    let size = case.n + case.n2;
    let f = ProblemSpec::new(case.kernel, size).with_seed(case.seed).matrix();
    let layout = TileLayout::uniform(case.n, case.tile, case.n2, case.tile2);
    let opts = BlrOptions::default().with_rel_tol(case.tolerance);

    let original = Front::split(f.as_ref(), case.n)?;
    let mut front = original.clone();
    let stats = FactorStats::new();
    let factors = match driver {
        Driver::Host => TaskDriver::new().partial_factor(&mut front, &layout, &opts, &stats)?,
        Driver::Device => DeviceDriver::new(HostDevice::new()).partial_factor(&mut front, &layout, &opts, &stats)?,
    };
    ensure!(front.is_released(), "front was not released");

    if case.n2 > 0 {
        let x = original.a11.partial_piv_lu().solve(original.a12.as_ref());
        let reference = &original.a22 - &original.a21 * &x;
        let error = (&front.a22 - &reference).norm_l2() / reference.norm_l2();
        ensure!(error <= case.max_error, "Schur complement: relative error {error:e}");
    }

    let x_true = Mat::from_fn(size, 1, |i, _| 1.0 + (i % 3) as f64);
    let b = &f * &x_true;
    let x = solve_front(&factors, front.a22.as_ref(), b.as_ref(), dense_schur_solver)?;
    let error = (&x - &x_true).norm_l2() / x_true.norm_l2();
    // The solution error is bounded by the condition number times the backward error.
    ensure!(error <= 100.0 * case.max_error, "solution: relative error {error:e}");
    log::debug!("{case:?} on {driver:?}: {:?}", stats.snapshot());
    Ok(())
}

include!(concat!(env!("OUT_DIR"), "/case_tests.rs"));
