//! Synthetic frontal matrices for tests, benchmarks and experiments.
//!
//! Kernel matrices `K(x_i, x_j)` over sorted points on a line have numerically low-rank
//! off-diagonal blocks, with ranks that decay as the blocks move away from the diagonal,
//! which is the structure BLR compression exploits. A diagonal shift keeps them
//! comfortably nonsingular under tile-local pivoting.

use crate::{
    algorithms::{Front, TileLayout},
    error::BlrError,
};
use faer::Mat;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The kernel used to fill a synthetic front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kernel {
    /// `exp(-|x - y| / l)`; off-diagonal blocks have rank one.
    Exponential,
    /// `1 / (1 + |x - y| / l)`; off-diagonal ranks grow slowly with the tolerance.
    Inverse,
    /// Uniform random entries in `[-0.5, 0.5)`; incompressible.
    Random,
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kernel::Exponential => "exponential",
            Kernel::Inverse => "inverse",
            Kernel::Random => "random",
        };
        f.write_str(name)
    }
}

impl FromStr for Kernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" | "exp" => Ok(Kernel::Exponential),
            "inverse" | "inv" => Ok(Kernel::Inverse),
            "random" => Ok(Kernel::Random),
            other => Err(format!("unknown kernel '{other}'")),
        }
    }
}

/// Parameters of a synthetic front.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProblemSpec {
    pub kernel: Kernel,
    /// Total size of the front, `n + n2`.
    pub size: usize,
    /// Correlation length, relative to the unit interval.
    pub length: f64,
    /// Added to the diagonal.
    pub shift: f64,
    pub seed: u64,
}

impl ProblemSpec {
    pub fn new(kernel: Kernel, size: usize) -> Self {
        Self {
            kernel,
            size,
            length: 0.1,
            shift: 1.0,
            seed: 42,
        }
    }

    pub fn with_length(mut self, length: f64) -> Self {
        self.length = length;
        self
    }

    pub fn with_shift(mut self, shift: f64) -> Self {
        self.shift = shift;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The full `size x size` frontal matrix.
    pub fn matrix(&self) -> Mat<f64> {
        let n = self.size;
        let mut rng = StdRng::seed_from_u64(self.seed);
        match self.kernel {
            Kernel::Random => {
                let mut a = Mat::from_fn(n, n, |_, _| rng.random::<f64>() - 0.5);
                // Diagonal dominance so that tile-local pivots stay usable.
                for i in 0..n {
                    a[(i, i)] += n as f64 * 0.5 + self.shift;
                }
                a
            }
            kernel => {
                let mut x: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
                x.sort_by(f64::total_cmp);
                let l = self.length;
                Mat::from_fn(n, n, |i, j| {
                    let d = (x[i] - x[j]).abs() / l;
                    let k = match kernel {
                        Kernel::Exponential => (-d).exp(),
                        _ => 1.0 / (1.0 + d),
                    };
                    if i == j { k + self.shift } else { k }
                })
            }
        }
    }

    /// The front split after its first `n` rows and columns.
    pub fn front(&self, n: usize) -> Result<Front, BlrError> {
        Front::split(self.matrix().as_ref(), n)
    }
}

/// A synthetic front together with a uniform tile layout.
#[derive(Debug, Clone)]
pub struct FrontalProblem {
    pub spec: ProblemSpec,
    pub front: Front,
    pub layout: TileLayout,
}

impl FrontalProblem {
    /// Splits the front of `spec` after `n` and tiles it uniformly.
    pub fn new(spec: ProblemSpec, n: usize, tile: usize, tile2: usize) -> Result<Self, BlrError> {
        let front = spec.front(n)?;
        let layout = TileLayout::uniform(n, tile, front.n2(), tile2);
        Ok(Self {
            spec,
            front,
            layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_is_deterministic() {
        let spec = ProblemSpec::new(Kernel::Inverse, 20).with_seed(3);
        assert_eq!(spec.matrix(), spec.matrix());
        assert_ne!(spec.matrix(), spec.with_seed(4).matrix());
    }

    #[test]
    fn test_exponential_blocks_are_rank_one() {
        let a = ProblemSpec::new(Kernel::Exponential, 40).matrix();
        // Every 2 x 2 minor strictly above the diagonal vanishes.
        let minor = a[(0, 20)] * a[(1, 30)] - a[(0, 30)] * a[(1, 20)];
        assert!(minor.abs() < 1e-14);
    }

    #[test]
    fn test_kernel_names_round_trip() {
        for k in [Kernel::Exponential, Kernel::Inverse, Kernel::Random] {
            assert_eq!(k.to_string().parse::<Kernel>(), Ok(k));
        }
        assert!("gaussian".parse::<Kernel>().is_err());
    }

    #[test]
    fn test_problem_layout_matches_front() {
        let p = FrontalProblem::new(ProblemSpec::new(Kernel::Random, 30), 20, 8, 4).unwrap();
        assert!(p.layout.validate(&p.front).is_ok());
        assert_eq!(p.front.n2(), 10);
        assert!(FrontalProblem::new(ProblemSpec::new(Kernel::Random, 30), 31, 8, 4).is_err());
    }
}
