//! Adaptive low-rank compression of dense tiles.
//!
//! A dense `m x n` block `A` is decomposed as `A = U * diag(s) * V^T`. The rank kept is
//! the number of *leading* singular values that are at least the threshold `τ` of
//! [`BlrOptions::threshold`]: the scan starts at `s[0]` and stops at the first value below
//! `τ`. This is a hard cut on the raw singular values, not a cumulative energy criterion,
//! and it relies on the values being non-increasing.
//!
//! The truncated factors are kept only when they are smaller than the dense block, that
//! is when `r * (m + n) < m * n`. The singular values are absorbed into the right factor,
//! so a compressed block is stored as `U[:, :r]` and `diag(s[:r]) * V^T[:r, :]`.
//!
//! A leading singular value already below `τ` gives rank `0`: the block is replaced by an
//! empty pair of factors representing an exact zero.

use crate::{error::BlrError, kernels, options::BlrOptions};
use faer::prelude::*;

/// Outcome of the compression policy for one block.
#[derive(Debug, Clone)]
pub enum Compression {
    /// Low-rank factors `u` (`m x r`) and `v` (`r x n`) with `A ≈ u * v`.
    LowRank { u: Mat<f64>, v: Mat<f64> },
    /// Truncation did not reduce storage; the block stays dense.
    Rejected { rank: usize },
    /// The block is smaller than the minimum tile size and was not decomposed.
    Skipped,
}

/// Counts the leading singular values that are `>= tau`.
pub fn select_rank(s: &[f64], tau: f64) -> usize {
    s.iter().take_while(|&&sigma| sigma >= tau).count()
}

/// Whether a rank-`rank` factorization of an `m x n` block stores fewer scalars than the
/// block itself.
pub fn rank_pays_off(rank: usize, m: usize, n: usize) -> bool {
    rank * (m + n) < m * n
}

/// Largest rank that still satisfies [`rank_pays_off`] for an `m x n` block.
pub fn max_beneficial_rank(m: usize, n: usize) -> usize {
    if m == 0 || n == 0 {
        return 0;
    }
    (m * n - 1) / (m + n)
}

/// Builds the factors from a thin SVD truncated at `rank`.
///
/// # Arguments
/// * `u`: left singular vectors, `m x k`.
/// * `s`: singular values, length `k`.
/// * `vt`: transposed right singular vectors, `k x n`.
/// * `rank`: number of leading triplets to keep, `rank <= k`.
pub fn truncate(u: MatRef<'_, f64>, s: &[f64], vt: MatRef<'_, f64>, rank: usize) -> (Mat<f64>, Mat<f64>) {
    let u_r = u.submatrix(0, 0, u.nrows(), rank).to_owned();
    let mut v_r = vt.submatrix(0, 0, rank, vt.ncols()).to_owned();
    kernels::scale_rows(v_r.as_mut(), &s[..rank]);
    (u_r, v_r)
}

/// Applies the compression policy to a dense block.
pub fn compress_block(a: MatRef<'_, f64>, opts: &BlrOptions) -> Result<Compression, BlrError> {
    let (m, n) = (a.nrows(), a.ncols());
    if !opts.allows_compression(m, n) {
        return Ok(Compression::Skipped);
    }
    let (u, s, vt) = kernels::svd(a)?;
    let rank = select_rank(&s, opts.threshold());
    if !rank_pays_off(rank, m, n) {
        return Ok(Compression::Rejected { rank });
    }
    let (u, v) = truncate(u.as_ref(), &s, vt.as_ref(), rank);
    Ok(Compression::LowRank { u, v })
}
