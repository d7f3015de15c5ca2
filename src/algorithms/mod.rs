//! Partial LU factorization of a frontal matrix in block low-rank form.
//!
//! ** NOTE: We recommend using the high-level functions in [`crate::solvers`] instead. This
//! module is intended for use cases where the choice of driver or the reuse of a front
//! across calls must be controlled directly.
//!
//! A frontal matrix is split by the enclosing sparse solver into four dense blocks:
//!
//! ```text
//!     | A11  A12 |     A11: n  x n   pivot block, fully factored
//!     | A21  A22 |     A22: n2 x n2  trailing block, overwritten with the Schur complement
//! ```
//!
//! Given a tile partition of both dimensions and the admissibility of the tiles of
//! `A11`, an [`EliminationDriver`] computes
//!
//! - `P * A11 = L * U`, with `L` and `U` stored tile-wise in the BLR matrix `B11`,
//! - `B12 = L^-1 * P * A12` and `B21 = A21 * U^-1`,
//! - `A22 <- A22 - B21 * B12`, the Schur complement,
//!
//! compressing admissible tiles of `B11` and all tiles of `B12`/`B21` on the way. The row
//! permutation `P` only exchanges rows inside each diagonal tile.
//!
//! Two drivers implement the same contract:
//!
//! - [`host::TaskDriver`]: a task-dependency graph of per-tile operations on the rayon
//!   thread pool.
//! - [`device::DeviceDriver`]: the same block-column elimination on a
//!   [`crate::device::ComputeDevice`], with Schur updates grouped into batched multiplies
//!   built by [`batched::SchurBatch`].
//!
//! For identical inputs both return the same pivot vector and the same Schur complement up
//! to rounding.

pub mod batched;
pub mod device;
pub mod host;
pub mod schedule;

use crate::{
    error::{BlrError, BlrErrorKind},
    matrix::{Admissibility, BlrMatrix, Partition},
    options::BlrOptions,
    stats::FactorStats,
};
use faer::prelude::*;

/// The four dense blocks of a frontal matrix.
///
/// After a successful factorization `a11`, `a12` and `a21` are released (left as `0 x 0`
/// matrices) and `a22` holds the Schur complement.
#[derive(Debug, Clone)]
pub struct Front {
    pub a11: Mat<f64>,
    pub a12: Mat<f64>,
    pub a21: Mat<f64>,
    pub a22: Mat<f64>,
}

impl Front {
    pub fn new(a11: Mat<f64>, a12: Mat<f64>, a21: Mat<f64>, a22: Mat<f64>) -> Self {
        Self { a11, a12, a21, a22 }
    }

    /// Splits a square frontal matrix after its first `n` rows and columns.
    ///
    /// # Errors
    /// `DimensionMismatch` if `f` is not square, `InconsistentPartition` if `n` exceeds
    /// its size.
    pub fn split(f: MatRef<'_, f64>, n: usize) -> Result<Self, BlrError> {
        if f.ncols() != f.nrows() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "frontal matrix columns",
                expected: f.nrows(),
                actual: f.ncols(),
            }
            .into());
        }
        let n2 = f.nrows().checked_sub(n).ok_or_else(|| {
            BlrErrorKind::InconsistentPartition(format!(
                "pivot block of size {n} does not fit in a front of size {}",
                f.nrows()
            ))
        })?;
        Ok(Self {
            a11: f.submatrix(0, 0, n, n).to_owned(),
            a12: f.submatrix(0, n, n, n2).to_owned(),
            a21: f.submatrix(n, 0, n2, n).to_owned(),
            a22: f.submatrix(n, n, n2, n2).to_owned(),
        })
    }

    /// Size of the pivot block.
    pub fn n(&self) -> usize {
        self.a11.nrows()
    }

    /// Size of the trailing block.
    pub fn n2(&self) -> usize {
        self.a22.nrows()
    }

    /// Frees the pivot and coupling blocks.
    pub fn release(&mut self) {
        self.a11 = Mat::zeros(0, 0);
        self.a12 = Mat::zeros(0, 0);
        self.a21 = Mat::zeros(0, 0);
    }

    /// Whether the pivot and coupling blocks have been released.
    pub fn is_released(&self) -> bool {
        [&self.a11, &self.a12, &self.a21]
            .iter()
            .all(|m| m.nrows() == 0 && m.ncols() == 0)
    }
}

/// Tile partition and admissibility of a front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    /// Partition of the pivot dimension `n`.
    pub tiles: Partition,
    /// Partition of the trailing dimension `n2`.
    pub tiles2: Partition,
    /// Which tiles of `B11` may be compressed. Coupling tiles always may.
    pub admissibility: Admissibility,
}

impl TileLayout {
    pub fn new(tiles: Partition, tiles2: Partition, admissibility: Admissibility) -> Self {
        Self {
            tiles,
            tiles2,
            admissibility,
        }
    }

    /// Uniform tiles of size `tile` over `n` and `tile2` over `n2`, with every
    /// off-diagonal tile of `B11` admissible.
    pub fn uniform(n: usize, tile: usize, n2: usize, tile2: usize) -> Self {
        let tiles = Partition::uniform(n, tile);
        let admissibility = Admissibility::off_diagonal(tiles.len());
        Self::new(tiles, Partition::uniform(n2, tile2), admissibility)
    }

    /// Same partition with a different admissibility.
    pub fn with_admissibility(mut self, admissibility: Admissibility) -> Self {
        self.admissibility = admissibility;
        self
    }

    /// Checks that the layout matches the blocks of `front`.
    pub fn validate(&self, front: &Front) -> Result<(), BlrError> {
        let (n, n2) = (front.n(), front.n2());
        let shapes = [
            ("A11 columns", n, front.a11.ncols()),
            ("A12 rows", n, front.a12.nrows()),
            ("A12 columns", n2, front.a12.ncols()),
            ("A21 rows", n2, front.a21.nrows()),
            ("A21 columns", n, front.a21.ncols()),
            ("A22 columns", n2, front.a22.ncols()),
        ];
        for (what, expected, actual) in shapes {
            if expected != actual {
                return Err(BlrErrorKind::DimensionMismatch {
                    what,
                    expected,
                    actual,
                }
                .into());
            }
        }
        self.tiles.check_total(n, "pivot block")?;
        self.tiles2.check_total(n2, "trailing block")?;
        self.admissibility
            .check_shape(self.tiles.len(), self.tiles.len())
    }
}

/// Result of a partial factorization.
#[derive(Debug, Clone)]
pub struct PartialFactorization {
    /// `L \ U` of the pivot block, tile-wise.
    pub b11: BlrMatrix,
    /// `L^-1 * P * A12`.
    pub b12: BlrMatrix,
    /// `A21 * U^-1`.
    pub b21: BlrMatrix,
    /// Global forward pivot: row `r` of `P * A11` is row `piv[r]` of `A11`.
    pub piv: Vec<usize>,
}

impl PartialFactorization {
    /// Bytes stored in the three BLR matrices.
    pub fn memory(&self) -> usize {
        self.b11.memory() + self.b12.memory() + self.b21.memory()
    }

    /// Scalars stored in the three BLR matrices.
    pub fn nonzeros(&self) -> usize {
        self.b11.nonzeros() + self.b12.nonzeros() + self.b21.nonzeros()
    }

    /// Largest rank over the three BLR matrices.
    pub fn maximum_rank(&self) -> usize {
        self.b11
            .maximum_rank()
            .max(self.b12.maximum_rank())
            .max(self.b21.maximum_rank())
    }

    /// Solves `A11 * x = b` in place.
    pub fn pivot_block_solve_in_place(&self, mut b: MatMut<'_, f64>) -> Result<(), BlrError> {
        crate::kernels::permute_rows(b.rb_mut(), &self.piv, true);
        self.b11.unit_lower_solve_in_place(b.rb_mut())?;
        self.b11.upper_solve_in_place(b)
    }

    /// First half of a frontal solve.
    ///
    /// Overwrites `b1` with `y1 = L^-1 * P * b1` and updates `b2 -= B21 * y1`, after which
    /// `b2` is the right-hand side of the Schur complement system.
    pub fn forward_solve(&self, mut b1: MatMut<'_, f64>, b2: MatMut<'_, f64>) -> Result<(), BlrError> {
        crate::kernels::permute_rows(b1.rb_mut(), &self.piv, true);
        self.b11.unit_lower_solve_in_place(b1.rb_mut())?;
        self.b21.apply_into(-1.0, b1.rb(), b2)
    }

    /// Second half of a frontal solve.
    ///
    /// Given `y1` from [`Self::forward_solve`] and the Schur solution `x2`, overwrites
    /// `y1` with `x1 = U^-1 * (y1 - B12 * x2)`.
    pub fn backward_solve(&self, mut y1: MatMut<'_, f64>, x2: MatRef<'_, f64>) -> Result<(), BlrError> {
        self.b12.apply_into(-1.0, x2, y1.rb_mut())?;
        self.b11.upper_solve_in_place(y1)
    }
}

/// A strategy for the partial factorization of a front.
pub trait EliminationDriver {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    /// Factors `front` in BLR form.
    ///
    /// On success `front.a22` holds the Schur complement and the other three blocks are
    /// released. On failure `front` is left untouched and no partial result is returned.
    ///
    /// # Arguments
    /// * `front`: the four dense blocks.
    /// * `layout`: tile partitions and admissibility.
    /// * `opts`: compression options.
    /// * `stats`: accumulator for flop and compression counters.
    fn partial_factor(
        &self,
        front: &mut Front,
        layout: &TileLayout,
        opts: &BlrOptions,
        stats: &FactorStats,
    ) -> Result<PartialFactorization, BlrError>;
}

/// Concatenates tile-local pivots into the global pivot vector.
pub(crate) fn global_pivot(tiles: &Partition, local: &[Vec<usize>]) -> Vec<usize> {
    let mut piv = Vec::with_capacity(tiles.total());
    for (i, p) in local.iter().enumerate() {
        let off = tiles.offset(i);
        piv.extend(p.iter().map(|&r| r + off));
    }
    piv
}

/// Shifts the row of a tile-local singular pivot to the pivot block.
pub(crate) fn globalize_singular(err: BlrError, row_offset: usize) -> BlrError {
    let local = match err.kind() {
        BlrErrorKind::SingularPivot { row } => Some(*row),
        _ => None,
    };
    match local {
        Some(row) => BlrErrorKind::SingularPivot {
            row: row + row_offset,
        }
        .into(),
        None => err,
    }
}
