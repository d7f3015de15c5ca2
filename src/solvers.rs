//! This module provides a high-level API for the partial factorization of a frontal
//! matrix and for solving with the result.
//!
//! The functions here pick a driver, run it with fresh statistics and log a summary.
//! Use [`crate::algorithms`] directly to reuse a driver (and its thread pool) across
//! fronts or to accumulate statistics over several fronts.

use crate::{
    algorithms::{
        EliminationDriver, Front, PartialFactorization, TileLayout, device::DeviceDriver,
        host::TaskDriver,
    },
    device::ComputeDevice,
    error::{BlrError, BlrErrorKind},
    options::BlrOptions,
    stats::{FactorStats, StatsSnapshot},
};
use faer::prelude::*;

/// Runs `driver` on `front` and returns the factors with the statistics of the run.
pub fn partial_factor_with<E: EliminationDriver + ?Sized>(
    driver: &E,
    front: &mut Front,
    layout: &TileLayout,
    opts: &BlrOptions,
) -> Result<(PartialFactorization, StatsSnapshot), BlrError> {
    let stats = FactorStats::new();
    let factors = driver.partial_factor(front, layout, opts, &stats)?;
    let snapshot = stats.snapshot();
    log::debug!(
        "{}: {} flops, {} tiles compressed, {} rejected, {} skipped",
        driver.name(),
        snapshot.flops,
        snapshot.tiles_compressed,
        snapshot.tiles_rejected,
        snapshot.tiles_skipped
    );
    Ok((factors, snapshot))
}

/// Factors `front` on the host with the task driver on the global rayon pool.
///
/// On success `front.a22` holds the Schur complement `A22 - B21 * B12` and the other
/// blocks of `front` are released.
///
/// # Arguments
/// * `front`: the four dense blocks of the frontal matrix.
/// * `layout`: tile partitions of both dimensions and the admissibility of `B11`.
/// * `opts`: compression tolerances and minimum tile size.
///
/// # Returns
/// The BLR factors and global pivot, or a `BlrError`. On error `front` is unchanged.
pub fn partial_factor(
    front: &mut Front,
    layout: &TileLayout,
    opts: &BlrOptions,
) -> Result<PartialFactorization, BlrError> {
    partial_factor_with(&TaskDriver::new(), front, layout, opts).map(|(f, _)| f)
}

/// Factors `front` on `device` with batched Schur updates.
///
/// Same contract as [`partial_factor`]. Fails with
/// [`BlrErrorKind::DeviceResourceExhausted`] if the working buffers do not fit on the
/// device.
pub fn partial_factor_on_device<D: ComputeDevice>(
    device: D,
    front: &mut Front,
    layout: &TileLayout,
    opts: &BlrOptions,
) -> Result<PartialFactorization, BlrError> {
    partial_factor_with(&DeviceDriver::new(device), front, layout, opts).map(|(f, _)| f)
}

/// Solves `F * x = b` with the frontal matrix `F = [A11 A12; A21 A22]`.
///
/// The pivot block is handled with `factors`; the Schur complement system
/// `S * x2 = b2 - B21 * y1` is delegated to `schur_solver`, which receives the Schur
/// complement (as left in `front.a22` by the factorization) and the reduced right-hand
/// side.
///
/// # Arguments
/// * `factors`: the result of a partial factorization.
/// * `schur`: the Schur complement.
/// * `b`: right-hand sides, `(n + n2) x k`.
/// * `schur_solver`: a closure returning the solution of `S * x2 = rhs`.
///
/// # Returns
/// The solution `x`, `(n + n2) x k`.
pub fn solve_front<F>(
    factors: &PartialFactorization,
    schur: MatRef<'_, f64>,
    b: MatRef<'_, f64>,
    mut schur_solver: F,
) -> Result<Mat<f64>, BlrError>
where
    F: FnMut(MatRef<'_, f64>, MatRef<'_, f64>) -> Result<Mat<f64>, anyhow::Error>,
{
    let n = factors.b11.rows();
    let n2 = schur.nrows();
    if b.nrows() != n + n2 {
        return Err(BlrErrorKind::DimensionMismatch {
            what: "right-hand side rows",
            expected: n + n2,
            actual: b.nrows(),
        }
        .into());
    }

    let mut x = b.to_owned();
    let (mut x1, mut x2) = x.as_mut().split_at_row_mut(n);
    factors.forward_solve(x1.rb_mut(), x2.rb_mut())?;

    if n2 > 0 {
        let y2 = schur_solver(schur, x2.rb())
            .map_err(|e| BlrError::from(BlrErrorKind::SchurSolver(e.to_string())))?;
        if y2.nrows() != n2 || y2.ncols() != b.ncols() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "Schur solution",
                expected: n2 * b.ncols(),
                actual: y2.nrows() * y2.ncols(),
            }
            .into());
        }
        x2.copy_from(y2.as_ref());
    }
    factors.backward_solve(x1, x2.rb())?;
    Ok(x)
}

/// A `schur_solver` for [`solve_front`] using a dense partial-pivoting LU.
pub fn dense_schur_solver(s: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Result<Mat<f64>, anyhow::Error> {
    anyhow::ensure!(s.nrows() == s.ncols(), "Schur complement must be square");
    Ok(s.partial_piv_lu().solve(rhs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    fn front_matrix(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| {
            if i == j {
                4.0 + i as f64
            } else {
                1.0 / (1.0 + (i as f64 - j as f64).abs())
            }
        })
    }

    #[test]
    fn test_solve_front_recovers_solution() -> Result<(), BlrError> {
        let f = front_matrix(12);
        let x_true = Mat::from_fn(12, 2, |i, j| (i + 3 * j) as f64 - 5.0);
        let b = &f * &x_true;

        let mut front = Front::split(f.as_ref(), 8)?;
        let layout = TileLayout::uniform(8, 4, 4, 2);
        let factors = partial_factor(&mut front, &layout, &BlrOptions::default())?;
        let x = solve_front(&factors, front.a22.as_ref(), b.as_ref(), dense_schur_solver)?;

        let err = (&x - &x_true).norm_l2() / x_true.norm_l2();
        assert!(err < 1e-12, "relative error {err}");
        Ok(())
    }

    #[test]
    fn test_host_and_device_agree() -> Result<(), BlrError> {
        let f = front_matrix(10);
        let layout = TileLayout::uniform(6, 3, 4, 2);
        let opts = BlrOptions::default();

        let mut host_front = Front::split(f.as_ref(), 6)?;
        let host = partial_factor(&mut host_front, &layout, &opts)?;
        let mut device_front = Front::split(f.as_ref(), 6)?;
        let device = partial_factor_on_device(HostDevice::new(), &mut device_front, &layout, &opts)?;

        assert_eq!(host.piv, device.piv);
        let diff = (&host_front.a22 - &device_front.a22).norm_l2();
        assert!(diff < 1e-12 * host_front.a22.norm_l2());
        Ok(())
    }

    #[test]
    fn test_schur_solver_errors_are_reported() -> Result<(), BlrError> {
        let f = front_matrix(6);
        let mut front = Front::split(f.as_ref(), 4)?;
        let factors = partial_factor(&mut front, &TileLayout::uniform(4, 2, 2, 2), &BlrOptions::default())?;
        let b = Mat::<f64>::zeros(6, 1);
        let err = solve_front(&factors, front.a22.as_ref(), b.as_ref(), |_, _| {
            anyhow::bail!("not today")
        })
        .unwrap_err();
        assert_eq!(err.kind(), &BlrErrorKind::SchurSolver("not today".to_string()));

        let bad = Mat::<f64>::zeros(5, 1);
        let err = solve_front(&factors, front.a22.as_ref(), bad.as_ref(), dense_schur_solver)
            .unwrap_err();
        assert!(matches!(err.kind(), BlrErrorKind::DimensionMismatch { .. }));
        Ok(())
    }
}
