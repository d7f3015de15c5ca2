//! Dense host kernels used by tiles and by the host device backend.
//!
//! This module is the only place that calls into the dense decompositions and solvers of
//! [`faer`]. It exposes them with the BLAS/LAPACK-like contracts the factorization is
//! written against:
//!
//! - [`getrf`]: in-place pivoted LU of a square block, packed as `L \ U`.
//! - [`permute_rows`]: applies a row permutation in place.
//! - [`trsm`]: in-place triangular solve from either side.
//! - [`gemm`]: `C = beta * C + alpha * A * B` with `beta` restricted to `0` or `1`.
//! - [`svd`]: thin singular value decomposition, `A = U * diag(s) * V^T`.
//!
//! All kernels run sequentially; parallelism lives at the task level.
//!
//! ## Pivot convention
//!
//! Row permutations are represented as *forward* arrays: after a pivoted factorization
//! with pivot `p`, row `r` of `P * A` is row `p[r]` of `A`.

use crate::error::{BlrError, BlrErrorKind};
use faer::{Accum, Par, linalg::matmul::matmul, linalg::triangular_solve, prelude::*};

/// Side of a triangular solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Solve `op(T) * X = alpha * B`.
    Left,
    /// Solve `X * op(T) = alpha * B`.
    Right,
}

/// Which triangle of the factored diagonal block is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triangle {
    Lower,
    Upper,
}

impl Triangle {
    fn flip(self) -> Self {
        match self {
            Triangle::Lower => Triangle::Upper,
            Triangle::Upper => Triangle::Lower,
        }
    }
}

/// Whether the triangular factor is used as is or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trans {
    No,
    Yes,
}

/// Whether the diagonal of the triangular factor is implicitly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diag {
    Unit,
    NonUnit,
}

/// Factors a square block in place with partial pivoting.
///
/// On return `a` holds the unit lower factor strictly below the diagonal and the upper
/// factor on and above it, as LAPACK's `getrf` does.
///
/// # Returns
/// The forward row permutation, and the index of the first zero or non-finite diagonal
/// entry of `U` if there is one. The factors are written back in both cases.
///
/// Only an exactly zero or non-finite pivot is flagged, matching the `info > 0` contract
/// of LAPACK. A tiny nonzero pivot is accepted; no threshold relative to the block norm
/// is applied.
pub fn getrf(mut a: MatMut<'_, f64>) -> (Vec<usize>, Option<usize>) {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    if n == 0 {
        return (Vec::new(), None);
    }

    let lu = a.rb().partial_piv_lu();
    let l = lu.L();
    let u = lu.U();
    for j in 0..n {
        for i in 0..n {
            a[(i, j)] = if i > j { l[(i, j)] } else { u[(i, j)] };
        }
    }

    let perm = lu.P().arrays().0.to_vec();
    let singular = (0..n).find(|&k| {
        let d = u[(k, k)];
        d == 0.0 || !d.is_finite()
    });
    (perm, singular)
}

/// Permutes the rows of `a` in place.
///
/// With `forward = true`, row `r` becomes the old row `perm[r]`; with `forward = false`
/// the inverse permutation is applied.
pub fn permute_rows(mut a: MatMut<'_, f64>, perm: &[usize], forward: bool) {
    debug_assert_eq!(perm.len(), a.nrows());
    let old = a.rb().to_owned();
    for (r, &p) in perm.iter().enumerate() {
        let (dst, src) = if forward { (r, p) } else { (p, r) };
        for j in 0..old.ncols() {
            a[(dst, j)] = old[(src, j)];
        }
    }
}

/// Multiplies every entry of `a` by `alpha`.
pub fn scale(mut a: MatMut<'_, f64>, alpha: f64) {
    if alpha == 1.0 {
        return;
    }
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            a[(i, j)] *= alpha;
        }
    }
}

/// Multiplies row `i` of `a` by `d[i]`.
pub fn scale_rows(mut a: MatMut<'_, f64>, d: &[f64]) {
    debug_assert_eq!(d.len(), a.nrows());
    for j in 0..a.ncols() {
        for (i, &di) in d.iter().enumerate() {
            a[(i, j)] *= di;
        }
    }
}

/// In-place triangular solve against a factored block `t`.
///
/// Only the requested triangle of `t` is read, so `t` can be the packed output of
/// [`getrf`].
///
/// # Arguments
/// * `side`: whether `t` multiplies the unknown from the left or from the right.
/// * `triangle`, `trans`, `diag`: select `op(T)` from the packed block.
/// * `alpha`: scale applied to the right-hand side.
/// * `t`: square factored block.
/// * `b`: right-hand side, overwritten with the solution.
pub fn trsm(
    side: Side,
    triangle: Triangle,
    trans: Trans,
    diag: Diag,
    alpha: f64,
    t: MatRef<'_, f64>,
    mut b: MatMut<'_, f64>,
) {
    scale(b.rb_mut(), alpha);
    if b.nrows() == 0 || b.ncols() == 0 {
        return;
    }

    // op(T) X = B, with op(T) expressed as a plain triangular view.
    let (op_t, op_triangle) = match trans {
        Trans::No => (t, triangle),
        Trans::Yes => (t.transpose(), triangle.flip()),
    };

    match side {
        Side::Left => solve_left(op_t, op_triangle, diag, b),
        // X op(T) = B  <=>  op(T)^T X^T = B^T
        Side::Right => solve_left(
            op_t.transpose(),
            op_triangle.flip(),
            diag,
            b.transpose_mut(),
        ),
    }
}

fn solve_left(t: MatRef<'_, f64>, triangle: Triangle, diag: Diag, b: MatMut<'_, f64>) {
    match (triangle, diag) {
        (Triangle::Lower, Diag::Unit) => {
            triangular_solve::solve_unit_lower_triangular_in_place(t, b, Par::Seq)
        }
        (Triangle::Lower, Diag::NonUnit) => {
            triangular_solve::solve_lower_triangular_in_place(t, b, Par::Seq)
        }
        (Triangle::Upper, Diag::Unit) => {
            triangular_solve::solve_unit_upper_triangular_in_place(t, b, Par::Seq)
        }
        (Triangle::Upper, Diag::NonUnit) => {
            triangular_solve::solve_upper_triangular_in_place(t, b, Par::Seq)
        }
    }
}

/// Computes `c = beta * c + alpha * a * b`.
///
/// `beta` must be `0.0` (overwrite) or `1.0` (accumulate).
pub fn gemm(alpha: f64, a: MatRef<'_, f64>, b: MatRef<'_, f64>, beta: f64, c: MatMut<'_, f64>) {
    let accum = if beta == 0.0 {
        Accum::Replace
    } else {
        debug_assert_eq!(beta, 1.0);
        Accum::Add
    };
    matmul(c, accum, a, b, alpha, Par::Seq);
}

/// Returns `a * b` as a new matrix.
pub fn product(a: MatRef<'_, f64>, b: MatRef<'_, f64>) -> Mat<f64> {
    let mut c = Mat::zeros(a.nrows(), b.ncols());
    gemm(1.0, a, b, 0.0, c.as_mut());
    c
}

/// Thin singular value decomposition.
///
/// # Returns
/// `(u, s, vt)` with `u` of size `m x k`, `s` the `k` singular values in non-increasing
/// order and `vt` of size `k x n`, where `k = min(m, n)`.
pub fn svd(a: MatRef<'_, f64>) -> Result<(Mat<f64>, Vec<f64>, Mat<f64>), BlrError> {
    let (m, n) = (a.nrows(), a.ncols());
    let k = m.min(n);
    if k == 0 {
        return Ok((Mat::zeros(m, 0), Vec::new(), Mat::zeros(0, n)));
    }
    let dec = a
        .thin_svd()
        .map_err(|e| BlrError::from(BlrErrorKind::Decomposition(format!("{e:?}"))))?;
    let s_diag = dec.S().column_vector();
    let s = (0..k).map(|i| s_diag[i]).collect();
    Ok((dec.U().to_owned(), s, dec.V().transpose().to_owned()))
}
