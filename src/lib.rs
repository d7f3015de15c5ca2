//! Block low-rank (BLR) partial LU factorization of frontal matrices.
//!
//! Multifrontal sparse direct solvers spend most of their time factoring dense frontal
//! matrices
//!
//! ```text
//!     F = | A11  A12 |
//!         | A21  A22 |
//! ```
//!
//! where the `n x n` pivot block `A11` is fully eliminated and the `n2 x n2` trailing
//! block `A22` is replaced by the Schur complement `A22 - A21 * A11^-1 * A12`, which is
//! handed to the parent front. For many problems (elliptic PDEs, kernel matrices) the
//! off-diagonal tiles of these blocks are numerically low-rank. This crate stores them as
//! `U * V` factor pairs obtained by truncated SVD, which reduces both the memory of the
//! factors and the cost of the Schur updates.
//!
//! ## Layout
//!
//! - [`tile`]: the dense / low-rank tile type and its operations.
//! - [`compression`]: the rank selection and compression policy.
//! - [`matrix`]: tile partitions, admissibility and the BLR matrix container.
//! - [`algorithms`]: the elimination drivers, a task-graph driver on the rayon pool and a
//!   driver for a [`device::ComputeDevice`] with batched Schur updates.
//! - [`solvers`]: the high-level entry points.
//! - [`kernels`]: the dense kernels, built on [`faer`].
//!
//! ## Example Usage
//!
//! Factor a small front, then solve a system with it, delegating the Schur complement
//! system to a dense LU.
//!
//! ```rust
//! use blr_frontal::{BlrOptions, Front, TileLayout, dense_schur_solver, partial_factor, solve_front};
//! use faer::Mat;
//!
//! let f = Mat::from_fn(48, 48, |i, j| {
//!     let d = (i as f64 - j as f64).abs();
//!     if i == j { 10.0 } else { (-d / 8.0).exp() }
//! });
//! let x_true = Mat::from_fn(48, 1, |i, _| (i % 5) as f64);
//! let b = &f * &x_true;
//!
//! let mut front = Front::split(f.as_ref(), 32).unwrap();
//! let layout = TileLayout::uniform(32, 16, 16, 16);
//! let opts = BlrOptions::default().with_rel_tol(1e-12);
//!
//! let factors = partial_factor(&mut front, &layout, &opts).unwrap();
//! assert!(front.is_released());
//!
//! let x = solve_front(&factors, front.a22.as_ref(), b.as_ref(), dense_schur_solver).unwrap();
//! assert!((&x - &x_true).norm_l2() < 1e-8 * x_true.norm_l2());
//! ```

pub mod algorithms;
pub mod compression;
pub mod device;
pub mod error;
pub mod kernels;
pub mod matrix;
pub mod options;
pub mod solvers;
pub mod stats;
pub mod tile;
pub mod utils;

// Re-export the types and entry points most callers need.
pub use algorithms::{EliminationDriver, Front, PartialFactorization, TileLayout};
pub use error::{BlrError, BlrErrorKind};
pub use matrix::{Admissibility, BlrMatrix, Partition};
pub use options::BlrOptions;
pub use solvers::{dense_schur_solver, partial_factor, partial_factor_on_device, solve_front};
pub use stats::{FactorStats, StatsSnapshot};
pub use tile::Tile;
