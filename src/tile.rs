//! The tile: one block of a BLR matrix, stored dense or as a pair of low-rank factors.
//!
//! A [`Tile`] is a tagged variant with exactly two representations:
//!
//! - [`Tile::Dense`]: an `m x n` matrix.
//! - [`Tile::LowRank`]: factors `u` (`m x r`) and `v` (`r x n`) with the tile equal to
//!   `u * v`. Every low-rank tile built by the compression policy satisfies
//!   `r * (m + n) < m * n`.
//!
//! The shape of a tile never changes. Its representation changes only through
//! [`Tile::compress`] (which returns a new tile) and [`Tile::decompress`].
//!
//! Operations that touch a low-rank tile work on its factors directly: row permutations
//! and left triangular solves act on `u`, right triangular solves act on `v`, and products
//! go through rank-sized intermediates as planned by [`ProductPlan`].

use crate::{
    compression::{self, Compression},
    error::{BlrError, BlrErrorKind},
    kernels::{self, Diag, Side, Trans, Triangle},
    options::BlrOptions,
    stats::FactorStats,
};
use faer::prelude::*;

const SCALAR_BYTES: usize = std::mem::size_of::<f64>();

/// A dense or low-rank block.
#[derive(Debug, Clone, PartialEq)]
pub enum Tile {
    Dense(Mat<f64>),
    LowRank { u: Mat<f64>, v: Mat<f64> },
}

/// How a product of two tiles is evaluated.
///
/// For a left operand of shape `m x k` and a right operand of shape `k x n`, the plan
/// names the sequence of dense products that realizes `C += alpha * left * right`. Low-rank
/// operands are never expanded; when both are low-rank the rank-sized product
/// `w = V_left * U_right` is formed first and then expanded on the side with the smaller
/// intermediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductPlan {
    /// `C += alpha * A * B`.
    DenseDense,
    /// `t = A * U`, `C += alpha * t * V`.
    DenseLowRank,
    /// `t = V * B`, `C += alpha * U * t`.
    LowRankDense,
    /// `w = Va * Ub`, `t = Ua * w`, `C += alpha * t * Vb`.
    LowRankLowRankLeft,
    /// `w = Va * Ub`, `t = w * Vb`, `C += alpha * Ua * t`.
    LowRankLowRankRight,
}

impl ProductPlan {
    /// Chooses the plan for operands with the given ranks (`None` for dense).
    pub fn choose(m: usize, n: usize, left_rank: Option<usize>, right_rank: Option<usize>) -> Self {
        match (left_rank, right_rank) {
            (None, None) => ProductPlan::DenseDense,
            (None, Some(_)) => ProductPlan::DenseLowRank,
            (Some(_), None) => ProductPlan::LowRankDense,
            (Some(ra), Some(rb)) => {
                if m * rb < ra * n {
                    ProductPlan::LowRankLowRankLeft
                } else {
                    ProductPlan::LowRankLowRankRight
                }
            }
        }
    }

    /// Number of scalars of intermediate storage the plan needs.
    pub fn workspace(&self, m: usize, n: usize, ra: usize, rb: usize) -> usize {
        match self {
            ProductPlan::DenseDense => 0,
            ProductPlan::DenseLowRank => m * rb,
            ProductPlan::LowRankDense => ra * n,
            ProductPlan::LowRankLowRankLeft => ra * rb + m * rb,
            ProductPlan::LowRankLowRankRight => ra * rb + ra * n,
        }
    }

    /// Floating-point operations of the plan. `ra`/`rb` are ignored for dense operands.
    pub fn flops(&self, m: usize, n: usize, k: usize, ra: usize, rb: usize) -> u64 {
        let f = match self {
            ProductPlan::DenseDense => m * n * k,
            ProductPlan::DenseLowRank => m * rb * k + m * n * rb,
            ProductPlan::LowRankDense => ra * n * k + m * n * ra,
            ProductPlan::LowRankLowRankLeft => ra * rb * k + m * rb * ra + m * n * rb,
            ProductPlan::LowRankLowRankRight => ra * rb * k + ra * n * rb + m * n * ra,
        };
        2 * f as u64
    }
}

impl Tile {
    /// Wraps a pair of factors, checking that their shapes agree.
    pub fn low_rank(u: Mat<f64>, v: Mat<f64>) -> Result<Self, BlrError> {
        if u.ncols() != v.nrows() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "low-rank factor rank",
                expected: u.ncols(),
                actual: v.nrows(),
            }
            .into());
        }
        Ok(Tile::LowRank { u, v })
    }

    pub fn rows(&self) -> usize {
        match self {
            Tile::Dense(d) => d.nrows(),
            Tile::LowRank { u, .. } => u.nrows(),
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Tile::Dense(d) => d.ncols(),
            Tile::LowRank { v, .. } => v.ncols(),
        }
    }

    /// `min(rows, cols)` for a dense tile, the stored rank for a low-rank one.
    pub fn rank(&self) -> usize {
        match self {
            Tile::Dense(d) => d.nrows().min(d.ncols()),
            Tile::LowRank { u, .. } => u.ncols(),
        }
    }

    pub fn is_low_rank(&self) -> bool {
        matches!(self, Tile::LowRank { .. })
    }

    /// Rank of a low-rank tile, `None` for a dense one.
    pub fn low_rank_rank(&self) -> Option<usize> {
        match self {
            Tile::Dense(_) => None,
            Tile::LowRank { u, .. } => Some(u.ncols()),
        }
    }

    /// Number of stored scalars.
    pub fn nonzeros(&self) -> usize {
        match self {
            Tile::Dense(d) => d.nrows() * d.ncols(),
            Tile::LowRank { u, v } => u.nrows() * u.ncols() + v.nrows() * v.ncols(),
        }
    }

    /// Bytes of storage.
    pub fn memory(&self) -> usize {
        self.nonzeros() * SCALAR_BYTES
    }

    /// Rank of a low-rank tile, `0` for a dense one.
    pub fn maximum_rank(&self) -> usize {
        self.low_rank_rank().unwrap_or(0)
    }

    /// Returns the full dense form of the tile.
    pub fn to_dense(&self) -> Mat<f64> {
        match self {
            Tile::Dense(d) => d.clone(),
            Tile::LowRank { u, v } => kernels::product(u.as_ref(), v.as_ref()),
        }
    }

    /// Writes the full dense form of the tile into `dst`.
    pub fn materialize_into(&self, mut dst: MatMut<'_, f64>) {
        match self {
            Tile::Dense(d) => dst.copy_from(d.as_ref()),
            Tile::LowRank { u, v } => kernels::gemm(1.0, u.as_ref(), v.as_ref(), 0.0, dst),
        }
    }

    /// Dense storage of the tile, or an error for a low-rank tile.
    pub fn dense(&self) -> Result<MatRef<'_, f64>, BlrError> {
        match self {
            Tile::Dense(d) => Ok(d.as_ref()),
            Tile::LowRank { .. } => {
                Err(BlrErrorKind::UnsupportedRepresentation("expected a dense tile").into())
            }
        }
    }

    /// Mutable dense storage of the tile, or an error for a low-rank tile.
    pub fn dense_mut(&mut self) -> Result<MatMut<'_, f64>, BlrError> {
        match self {
            Tile::Dense(d) => Ok(d.as_mut()),
            Tile::LowRank { .. } => {
                Err(BlrErrorKind::UnsupportedRepresentation("expected a dense tile").into())
            }
        }
    }

    /// Applies the compression policy to a dense tile.
    ///
    /// # Returns
    /// A new low-rank tile when compression pays off, otherwise a clone of `self`. The
    /// tile itself is never modified. Low-rank tiles are returned unchanged.
    pub fn compress(&self, opts: &BlrOptions, stats: &FactorStats) -> Result<Tile, BlrError> {
        let Tile::Dense(d) = self else {
            return Ok(self.clone());
        };
        Ok(match compression::compress_block(d.as_ref(), opts)? {
            Compression::LowRank { u, v } => {
                stats.tile_compressed();
                Tile::LowRank { u, v }
            }
            Compression::Rejected { .. } => {
                stats.tile_rejected();
                self.clone()
            }
            Compression::Skipped => {
                stats.tile_skipped();
                self.clone()
            }
        })
    }

    /// Converts a low-rank tile to its dense form in place.
    pub fn decompress(&mut self) {
        if self.is_low_rank() {
            *self = Tile::Dense(self.to_dense());
        }
    }

    /// Factors a dense diagonal tile in place with partial pivoting.
    ///
    /// # Returns
    /// The local forward pivot. Fails with [`BlrErrorKind::SingularPivot`] carrying the
    /// *local* row of the first unusable pivot.
    pub fn factor_pivoted(&mut self) -> Result<Vec<usize>, BlrError> {
        let d = self.dense_mut()?;
        if d.nrows() != d.ncols() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "diagonal tile columns",
                expected: d.nrows(),
                actual: d.ncols(),
            }
            .into());
        }
        let (perm, singular) = kernels::getrf(d);
        match singular {
            Some(row) => Err(BlrErrorKind::SingularPivot { row }.into()),
            None => Ok(perm),
        }
    }

    /// Permutes the rows of the tile (the rows of `u` for a low-rank tile).
    pub fn permute_rows(&mut self, perm: &[usize], forward: bool) -> Result<(), BlrError> {
        if perm.len() != self.rows() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "pivot length",
                expected: self.rows(),
                actual: perm.len(),
            }
            .into());
        }
        match self {
            Tile::Dense(d) => kernels::permute_rows(d.as_mut(), perm, forward),
            Tile::LowRank { u, .. } => kernels::permute_rows(u.as_mut(), perm, forward),
        }
        Ok(())
    }

    /// In-place triangular solve against a factored dense diagonal tile.
    ///
    /// A low-rank tile solves through a single factor: `u` from the left, `v` from the
    /// right.
    pub fn solve_triangular(
        &mut self,
        side: Side,
        triangle: Triangle,
        trans: Trans,
        diag: Diag,
        alpha: f64,
        diag_tile: &Tile,
    ) -> Result<(), BlrError> {
        let t = diag_tile.dense()?;
        let (expected, actual) = match side {
            Side::Left => (self.rows(), t.nrows()),
            Side::Right => (self.cols(), t.ncols()),
        };
        if expected != actual || t.nrows() != t.ncols() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "triangular solve",
                expected,
                actual,
            }
            .into());
        }
        let target = match (self, side) {
            (Tile::Dense(d), _) => d.as_mut(),
            (Tile::LowRank { u, .. }, Side::Left) => u.as_mut(),
            (Tile::LowRank { v, .. }, Side::Right) => v.as_mut(),
        };
        kernels::trsm(side, triangle, trans, diag, alpha, t, target);
        Ok(())
    }

    /// Flops of a triangular solve of this tile against an `n x n` diagonal block.
    pub fn solve_flops(&self, side: Side) -> u64 {
        let (n, other) = match (self, side) {
            (Tile::Dense(d), Side::Left) => (d.nrows(), d.ncols()),
            (Tile::Dense(d), Side::Right) => (d.ncols(), d.nrows()),
            (Tile::LowRank { u, .. }, Side::Left) => (u.nrows(), u.ncols()),
            (Tile::LowRank { v, .. }, Side::Right) => (v.ncols(), v.nrows()),
        };
        (n * n * other) as u64
    }

    /// Computes `c += alpha * self * other`.
    ///
    /// The four combinations of representations are dispatched through [`ProductPlan`].
    ///
    /// # Returns
    /// The floating-point operations performed.
    pub fn accumulate_into(
        &self,
        other: &Tile,
        alpha: f64,
        c: MatMut<'_, f64>,
    ) -> Result<u64, BlrError> {
        let (m, k, n) = (self.rows(), self.cols(), other.cols());
        if other.rows() != k {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "tile product inner dimension",
                expected: k,
                actual: other.rows(),
            }
            .into());
        }
        if c.nrows() != m || c.ncols() != n {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "tile product target",
                expected: m * n,
                actual: c.nrows() * c.ncols(),
            }
            .into());
        }
        let plan = ProductPlan::choose(m, n, self.low_rank_rank(), other.low_rank_rank());
        match (self, other) {
            (Tile::Dense(a), Tile::Dense(b)) => {
                kernels::gemm(alpha, a.as_ref(), b.as_ref(), 1.0, c);
            }
            (Tile::Dense(a), Tile::LowRank { u, v }) => {
                let t = kernels::product(a.as_ref(), u.as_ref());
                kernels::gemm(alpha, t.as_ref(), v.as_ref(), 1.0, c);
            }
            (Tile::LowRank { u, v }, Tile::Dense(b)) => {
                let t = kernels::product(v.as_ref(), b.as_ref());
                kernels::gemm(alpha, u.as_ref(), t.as_ref(), 1.0, c);
            }
            (Tile::LowRank { u: ua, v: va }, Tile::LowRank { u: ub, v: vb }) => {
                let w = kernels::product(va.as_ref(), ub.as_ref());
                if plan == ProductPlan::LowRankLowRankLeft {
                    let t = kernels::product(ua.as_ref(), w.as_ref());
                    kernels::gemm(alpha, t.as_ref(), vb.as_ref(), 1.0, c);
                } else {
                    let t = kernels::product(w.as_ref(), vb.as_ref());
                    kernels::gemm(alpha, ua.as_ref(), t.as_ref(), 1.0, c);
                }
            }
        }
        Ok(plan.flops(m, n, k, self.maximum_rank(), other.maximum_rank()))
    }

    /// Computes `c += alpha * self * x` for a dense block `x`.
    pub fn multiply_into(&self, alpha: f64, x: MatRef<'_, f64>, c: MatMut<'_, f64>) {
        match self {
            Tile::Dense(d) => kernels::gemm(alpha, d.as_ref(), x, 1.0, c),
            Tile::LowRank { u, v } => {
                let t = kernels::product(v.as_ref(), x);
                kernels::gemm(alpha, u.as_ref(), t.as_ref(), 1.0, c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn random(m: usize, n: usize, rng: &mut StdRng) -> Mat<f64> {
        Mat::from_fn(m, n, |_, _| rng.random::<f64>() - 0.5)
    }

    fn low_rank(m: usize, n: usize, r: usize, rng: &mut StdRng) -> Tile {
        Tile::LowRank {
            u: random(m, r, rng),
            v: random(r, n, rng),
        }
    }

    #[test]
    fn test_shape_and_rank() {
        let mut rng = StdRng::seed_from_u64(1);
        let d = Tile::Dense(random(5, 7, &mut rng));
        assert_eq!((d.rows(), d.cols(), d.rank()), (5, 7, 5));
        assert_eq!(d.nonzeros(), 35);
        assert_eq!(d.maximum_rank(), 0);

        let lr = low_rank(20, 30, 3, &mut rng);
        assert_eq!((lr.rows(), lr.cols(), lr.rank()), (20, 30, 3));
        assert_eq!(lr.nonzeros(), 3 * 50);
        assert_eq!(lr.memory(), 3 * 50 * 8);
        assert!(lr.is_low_rank());
    }

    #[test]
    fn test_low_rank_constructor_checks_rank() {
        let err = Tile::low_rank(Mat::zeros(4, 2), Mat::zeros(3, 5)).unwrap_err();
        assert!(matches!(err.kind(), BlrErrorKind::DimensionMismatch { .. }));
    }

    #[test]
    fn test_plan_choice_prefers_smaller_intermediate() {
        // m * rb = 100 * 2 < ra * n = 3 * 100
        assert_eq!(
            ProductPlan::choose(100, 100, Some(3), Some(2)),
            ProductPlan::LowRankLowRankLeft
        );
        assert_eq!(
            ProductPlan::choose(100, 100, Some(2), Some(3)),
            ProductPlan::LowRankLowRankRight
        );
        assert_eq!(ProductPlan::choose(8, 8, None, Some(1)), ProductPlan::DenseLowRank);
        assert_eq!(
            ProductPlan::LowRankLowRankLeft.workspace(100, 100, 3, 2),
            6 + 200
        );
    }

    #[test]
    fn test_accumulate_matches_dense_for_all_combinations() -> Result<(), BlrError> {
        let mut rng = StdRng::seed_from_u64(2);
        let (m, k, n) = (24, 20, 18);
        let lefts = [Tile::Dense(random(m, k, &mut rng)), low_rank(m, k, 3, &mut rng)];
        let rights = [Tile::Dense(random(k, n, &mut rng)), low_rank(k, n, 5, &mut rng)];
        for a in &lefts {
            for b in &rights {
                let c0 = random(m, n, &mut rng);
                let mut c = c0.clone();
                a.accumulate_into(b, -1.0, c.as_mut())?;
                let expected = &c0 - kernels::product(a.to_dense().as_ref(), b.to_dense().as_ref());
                assert!((&c - &expected).norm_l2() < 1e-12 * expected.norm_l2().max(1.0));
            }
        }
        Ok(())
    }

    #[test]
    fn test_accumulate_rejects_bad_target() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = Tile::Dense(random(4, 4, &mut rng));
        let mut c = Mat::zeros(3, 4);
        assert!(a.accumulate_into(&a, 1.0, c.as_mut()).is_err());
    }

    #[test]
    fn test_compress_returns_new_tile_and_keeps_original() -> Result<(), BlrError> {
        let mut rng = StdRng::seed_from_u64(4);
        let lr = low_rank(32, 32, 2, &mut rng);
        let dense = Tile::Dense(lr.to_dense());
        let stats = FactorStats::new();
        let opts = BlrOptions::default().with_rel_tol(1e-10);
        let compressed = dense.compress(&opts, &stats)?;
        assert!(!dense.is_low_rank());
        assert_eq!(compressed.rank(), 2);
        assert!((compressed.to_dense() - dense.to_dense()).norm_l2() < 1e-10);
        assert_eq!(stats.snapshot().tiles_compressed, 1);

        let full = Tile::Dense(random(32, 32, &mut rng));
        let kept = full.compress(&opts, &stats)?;
        assert_eq!(kept, full);
        assert_eq!(stats.snapshot().tiles_rejected, 1);
        Ok(())
    }

    #[test]
    fn test_decompress_round_trip() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut t = low_rank(10, 12, 2, &mut rng);
        let dense = t.to_dense();
        t.decompress();
        assert_eq!(t, Tile::Dense(dense));
    }

    #[test]
    fn test_permute_and_solve_on_low_rank_factors() -> Result<(), BlrError> {
        let mut rng = StdRng::seed_from_u64(6);
        let mut diag = random(16, 16, &mut rng);
        for i in 0..16 {
            diag[(i, i)] += 8.0;
        }
        let mut diag = Tile::Dense(diag);
        let perm = diag.factor_pivoted()?;

        let mut lr = low_rank(16, 20, 3, &mut rng);
        let mut dense = Tile::Dense(lr.to_dense());
        for t in [&mut lr, &mut dense] {
            t.permute_rows(&perm, true)?;
            t.solve_triangular(Side::Left, Triangle::Lower, Trans::No, Diag::Unit, 1.0, &diag)?;
        }
        assert!(lr.is_low_rank());
        assert!((lr.to_dense() - dense.to_dense()).norm_l2() < 1e-10);

        let mut lr = low_rank(20, 16, 3, &mut rng);
        let mut dense = Tile::Dense(lr.to_dense());
        for t in [&mut lr, &mut dense] {
            t.solve_triangular(Side::Right, Triangle::Upper, Trans::No, Diag::NonUnit, 1.0, &diag)?;
        }
        assert!((lr.to_dense() - dense.to_dense()).norm_l2() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_factor_reports_local_singular_row() {
        let mut t = Tile::Dense(Mat::zeros(3, 3));
        let err = t.factor_pivoted().unwrap_err();
        assert_eq!(err.kind(), &BlrErrorKind::SingularPivot { row: 0 });

        let mut lr = Tile::LowRank {
            u: Mat::zeros(3, 1),
            v: Mat::zeros(1, 3),
        };
        assert!(matches!(
            lr.factor_pivoted().unwrap_err().kind(),
            BlrErrorKind::UnsupportedRepresentation(_)
        ));
    }
}
