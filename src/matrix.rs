//! Tiled block low-rank matrices.
//!
//! A [`BlrMatrix`] covers an `M x N` region split into row blocks and column blocks by two
//! [`Partition`]s. It owns one [`Tile`] per (row block, column block) pair, stored in
//! column-major order, and every tile has exactly the shape its partition entries give it.
//!
//! The [`Admissibility`] grid is supplied by the caller (it comes from the clustering that
//! produced the partition) and says which tiles of the pivot block may be compressed.
//!
//! Besides tile access, the matrix offers the aggregate statistics used to report
//! compression savings, dense reconstruction, block triangular solves and products with
//! dense blocks, and a gnuplot dump of its tile map.

use crate::{
    error::{BlrError, BlrErrorKind},
    kernels::{Diag, Side, Trans, Triangle},
    tile::Tile,
};
use faer::prelude::*;
use std::io::{self, Write};

/// An ordered sequence of block sizes over one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
}

impl Partition {
    /// Builds a partition from block sizes. Empty blocks are allowed.
    pub fn new(sizes: Vec<usize>) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        let mut acc = 0;
        offsets.push(0);
        for &s in &sizes {
            acc += s;
            offsets.push(acc);
        }
        Self { sizes, offsets }
    }

    /// Splits `n` into blocks of size `block`, the last one possibly smaller.
    pub fn uniform(n: usize, block: usize) -> Self {
        let block = block.max(1);
        let sizes = (0..n.div_ceil(block))
            .map(|b| block.min(n - b * block))
            .collect();
        Self::new(sizes)
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Sum of the block sizes.
    pub fn total(&self) -> usize {
        self.offsets[self.sizes.len()]
    }

    /// Size of block `i`.
    pub fn size(&self, i: usize) -> usize {
        self.sizes[i]
    }

    /// Offset of block `i`. `offset(len())` equals `total()`.
    pub fn offset(&self, i: usize) -> usize {
        self.offsets[i]
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Largest block size, `0` for an empty partition.
    pub fn max_size(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0)
    }

    /// Checks that the partition covers exactly `n` entries.
    pub fn check_total(&self, n: usize, what: &str) -> Result<(), BlrError> {
        if self.total() != n {
            return Err(BlrErrorKind::InconsistentPartition(format!(
                "{what}: tile sizes sum to {}, but the dimension is {n}",
                self.total()
            ))
            .into());
        }
        Ok(())
    }
}

/// Boolean grid saying which tiles may be compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admissibility {
    rows: usize,
    cols: usize,
    flags: Vec<bool>,
}

impl Admissibility {
    /// Builds a grid from a predicate on block coordinates.
    pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> bool) -> Self {
        let mut flags = Vec::with_capacity(rows * cols);
        for j in 0..cols {
            for i in 0..rows {
                flags.push(f(i, j));
            }
        }
        Self { rows, cols, flags }
    }

    /// Every tile admissible.
    pub fn all(n: usize) -> Self {
        Self::from_fn(n, n, |_, _| true)
    }

    /// No tile admissible; the factorization stays dense.
    pub fn none(n: usize) -> Self {
        Self::from_fn(n, n, |_, _| false)
    }

    /// Every off-diagonal tile admissible.
    pub fn off_diagonal(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| i != j)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, i: usize, j: usize) -> bool {
        self.flags[i + j * self.rows]
    }

    /// Checks that the grid has one entry per tile of a `rows x cols` tile grid.
    pub fn check_shape(&self, rows: usize, cols: usize) -> Result<(), BlrError> {
        if self.rows != rows || self.cols != cols {
            return Err(BlrErrorKind::InconsistentPartition(format!(
                "admissibility is {}x{}, but the tile grid is {rows}x{cols}",
                self.rows, self.cols
            ))
            .into());
        }
        Ok(())
    }
}

/// A grid of tiles over a rectangular region.
#[derive(Debug, Clone, PartialEq)]
pub struct BlrMatrix {
    row_part: Partition,
    col_part: Partition,
    tiles: Vec<Tile>,
}

impl BlrMatrix {
    /// Assembles a matrix from tiles given in column-major order.
    ///
    /// Fails with [`BlrErrorKind::InconsistentPartition`] when the grid is incomplete or a
    /// tile's shape differs from its partition entries.
    pub fn from_tiles(
        row_part: Partition,
        col_part: Partition,
        tiles: Vec<Tile>,
    ) -> Result<Self, BlrError> {
        let (rb, cb) = (row_part.len(), col_part.len());
        if tiles.len() != rb * cb {
            return Err(BlrErrorKind::InconsistentPartition(format!(
                "expected {} tiles for a {rb}x{cb} grid, got {}",
                rb * cb,
                tiles.len()
            ))
            .into());
        }
        for j in 0..cb {
            for i in 0..rb {
                let t = &tiles[i + j * rb];
                if t.rows() != row_part.size(i) || t.cols() != col_part.size(j) {
                    return Err(BlrErrorKind::InconsistentPartition(format!(
                        "tile ({i},{j}) is {}x{}, expected {}x{}",
                        t.rows(),
                        t.cols(),
                        row_part.size(i),
                        col_part.size(j)
                    ))
                    .into());
                }
            }
        }
        Ok(Self {
            row_part,
            col_part,
            tiles,
        })
    }

    /// Tiles a dense matrix without compressing anything.
    pub fn from_dense(
        a: MatRef<'_, f64>,
        row_part: Partition,
        col_part: Partition,
    ) -> Result<Self, BlrError> {
        row_part.check_total(a.nrows(), "rows")?;
        col_part.check_total(a.ncols(), "columns")?;
        let mut tiles = Vec::with_capacity(row_part.len() * col_part.len());
        for j in 0..col_part.len() {
            for i in 0..row_part.len() {
                let block = a.submatrix(
                    row_part.offset(i),
                    col_part.offset(j),
                    row_part.size(i),
                    col_part.size(j),
                );
                tiles.push(Tile::Dense(block.to_owned()));
            }
        }
        Self::from_tiles(row_part, col_part, tiles)
    }

    pub fn rows(&self) -> usize {
        self.row_part.total()
    }

    pub fn cols(&self) -> usize {
        self.col_part.total()
    }

    pub fn rowblocks(&self) -> usize {
        self.row_part.len()
    }

    pub fn colblocks(&self) -> usize {
        self.col_part.len()
    }

    pub fn tilerows(&self, i: usize) -> usize {
        self.row_part.size(i)
    }

    pub fn tilecols(&self, j: usize) -> usize {
        self.col_part.size(j)
    }

    pub fn tileroff(&self, i: usize) -> usize {
        self.row_part.offset(i)
    }

    pub fn tilecoff(&self, j: usize) -> usize {
        self.col_part.offset(j)
    }

    pub fn row_partition(&self) -> &Partition {
        &self.row_part
    }

    pub fn col_partition(&self) -> &Partition {
        &self.col_part
    }

    pub fn tile(&self, i: usize, j: usize) -> &Tile {
        &self.tiles[i + j * self.row_part.len()]
    }

    pub fn tile_mut(&mut self, i: usize, j: usize) -> &mut Tile {
        let rb = self.row_part.len();
        &mut self.tiles[i + j * rb]
    }

    /// All tiles in column-major order.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Bytes stored over all tiles.
    pub fn memory(&self) -> usize {
        self.tiles.iter().map(Tile::memory).sum()
    }

    /// Scalars stored over all tiles.
    pub fn nonzeros(&self) -> usize {
        self.tiles.iter().map(Tile::nonzeros).sum()
    }

    /// Largest rank of any low-rank tile, `0` when none is compressed.
    pub fn maximum_rank(&self) -> usize {
        self.tiles.iter().map(Tile::maximum_rank).max().unwrap_or(0)
    }

    /// Number of low-rank tiles.
    pub fn low_rank_tiles(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_low_rank()).count()
    }

    /// Reconstructs the full dense matrix.
    pub fn dense(&self) -> Mat<f64> {
        let mut out = Mat::zeros(self.rows(), self.cols());
        for j in 0..self.colblocks() {
            for i in 0..self.rowblocks() {
                let dst = out.as_mut().submatrix_mut(
                    self.tileroff(i),
                    self.tilecoff(j),
                    self.tilerows(i),
                    self.tilecols(j),
                );
                self.tile(i, j).materialize_into(dst);
            }
        }
        out
    }

    /// Computes `c += alpha * self * x`.
    pub fn apply_into(&self, alpha: f64, x: MatRef<'_, f64>, mut c: MatMut<'_, f64>) -> Result<(), BlrError> {
        if x.nrows() != self.cols() || c.nrows() != self.rows() || c.ncols() != x.ncols() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "BLR matrix product",
                expected: self.cols(),
                actual: x.nrows(),
            }
            .into());
        }
        let nrhs = x.ncols();
        for j in 0..self.colblocks() {
            let xj = x.submatrix(self.tilecoff(j), 0, self.tilecols(j), nrhs);
            for i in 0..self.rowblocks() {
                let ci = c
                    .rb_mut()
                    .submatrix_mut(self.tileroff(i), 0, self.tilerows(i), nrhs);
                self.tile(i, j).multiply_into(alpha, xj, ci);
            }
        }
        Ok(())
    }

    /// Solves `L * x = b` in place, where `L` is the unit lower triangle of a factored
    /// square BLR matrix.
    pub fn unit_lower_solve_in_place(&self, b: MatMut<'_, f64>) -> Result<(), BlrError> {
        self.block_triangular_solve(b, Triangle::Lower)
    }

    /// Solves `U * x = b` in place, where `U` is the upper triangle of a factored square
    /// BLR matrix.
    pub fn upper_solve_in_place(&self, b: MatMut<'_, f64>) -> Result<(), BlrError> {
        self.block_triangular_solve(b, Triangle::Upper)
    }

    fn block_triangular_solve(&self, mut b: MatMut<'_, f64>, triangle: Triangle) -> Result<(), BlrError> {
        let nb = self.rowblocks();
        if self.colblocks() != nb || b.nrows() != self.rows() {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "block triangular solve",
                expected: self.rows(),
                actual: b.nrows(),
            }
            .into());
        }
        let nrhs = b.ncols();
        let order: Vec<usize> = match triangle {
            Triangle::Lower => (0..nb).collect(),
            Triangle::Upper => (0..nb).rev().collect(),
        };
        for &i in &order {
            let (ri, mi) = (self.tileroff(i), self.tilerows(i));
            let mut bi = b.rb().submatrix(ri, 0, mi, nrhs).to_owned();
            let others: Vec<usize> = match triangle {
                Triangle::Lower => (0..i).collect(),
                Triangle::Upper => (i + 1..nb).collect(),
            };
            for j in others {
                let xj = b.rb().submatrix(self.tileroff(j), 0, self.tilerows(j), nrhs);
                self.tile(i, j).multiply_into(-1.0, xj, bi.as_mut());
            }
            let mut rhs = Tile::Dense(bi);
            let diag = match triangle {
                Triangle::Lower => Diag::Unit,
                Triangle::Upper => Diag::NonUnit,
            };
            rhs.solve_triangular(Side::Left, triangle, Trans::No, diag, 1.0, self.tile(i, i))?;
            b.rb_mut()
                .submatrix_mut(ri, 0, mi, nrhs)
                .copy_from(rhs.dense()?);
        }
        Ok(())
    }

    /// Writes gnuplot commands drawing the tile map of the matrix.
    ///
    /// Dense tiles are drawn red and low-rank tiles green, darker for higher rank.
    /// `roff`/`coff` place the matrix inside a larger frontal matrix.
    pub fn draw(&self, out: &mut impl Write, roff: usize, coff: usize) -> io::Result<()> {
        for j in 0..self.colblocks() {
            for i in 0..self.rowblocks() {
                let t = self.tile(i, j);
                let (x0, y0) = (coff + self.tilecoff(j), roff + self.tileroff(i));
                let (x1, y1) = (x0 + self.tilecols(j), y0 + self.tilerows(i));
                let color = match t.low_rank_rank() {
                    None => "#FF0000".to_string(),
                    Some(r) => {
                        let full = t.rows().min(t.cols()).max(1);
                        let shade = 255 - (200 * r.min(full) / full) as u8;
                        format!("#00{shade:02X}00")
                    }
                };
                writeln!(
                    out,
                    "set obj rect from {x0}, {y1} to {x1}, {y0} fc rgb '{color}'"
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn test_uniform_partition() {
        let p = Partition::uniform(10, 4);
        assert_eq!(p.sizes(), &[4, 4, 2]);
        assert_eq!(p.offset(2), 8);
        assert_eq!(p.total(), 10);
        assert!(Partition::uniform(0, 4).is_empty());
    }

    #[test]
    fn test_from_dense_rejects_bad_partition() {
        let a = Mat::<f64>::zeros(10, 6);
        let err = BlrMatrix::from_dense(a.as_ref(), Partition::new(vec![4, 5]), Partition::uniform(6, 3))
            .unwrap_err();
        assert!(matches!(err.kind(), BlrErrorKind::InconsistentPartition(_)));
    }

    #[test]
    fn test_from_tiles_rejects_missing_and_misshaped_tiles() {
        let rp = Partition::new(vec![2, 3]);
        let cp = Partition::new(vec![4]);
        let missing = BlrMatrix::from_tiles(rp.clone(), cp.clone(), vec![Tile::Dense(Mat::zeros(2, 4))]);
        assert!(missing.is_err());
        let misshaped = BlrMatrix::from_tiles(
            rp,
            cp,
            vec![Tile::Dense(Mat::zeros(2, 4)), Tile::Dense(Mat::zeros(2, 4))],
        );
        assert!(misshaped.is_err());
    }

    #[test]
    fn test_admissibility_shape_check() {
        let adm = Admissibility::off_diagonal(3);
        assert!(!adm.get(1, 1));
        assert!(adm.get(0, 2));
        assert!(adm.check_shape(3, 3).is_ok());
        assert!(adm.check_shape(3, 4).is_err());
    }

    #[test]
    fn test_dense_round_trip_and_statistics() -> Result<(), BlrError> {
        let mut rng = StdRng::seed_from_u64(1);
        let a = Mat::from_fn(9, 7, |_, _| rng.random::<f64>());
        let mut m = BlrMatrix::from_dense(a.as_ref(), Partition::uniform(9, 4), Partition::uniform(7, 3))?;
        assert_eq!(m.dense(), a);
        assert_eq!((m.rowblocks(), m.colblocks()), (3, 3));
        assert_eq!(m.tileroff(2), 8);
        assert_eq!(m.nonzeros(), 63);
        assert_eq!(m.maximum_rank(), 0);

        *m.tile_mut(0, 1) = Tile::LowRank {
            u: Mat::zeros(4, 1),
            v: Mat::zeros(1, 3),
        };
        assert_eq!(m.maximum_rank(), 1);
        assert_eq!(m.nonzeros(), 63 - 12 + 7);
        assert_eq!(m.memory(), m.nonzeros() * 8);
        Ok(())
    }

    #[test]
    fn test_block_solves_match_dense_lu() -> Result<(), BlrError> {
        let mut rng = StdRng::seed_from_u64(2);
        let n = 12;
        let mut a = Mat::from_fn(n, n, |_, _| rng.random::<f64>() - 0.5);
        for i in 0..n {
            a[(i, i)] += n as f64;
        }
        // Diagonally dominant: no pivoting happens, so a tiled LU without row exchanges
        // equals the dense one.
        let mut lu = a.clone();
        let (perm, singular) = kernels::getrf(lu.as_mut());
        assert!(singular.is_none());
        assert!(perm.iter().enumerate().all(|(i, &p)| i == p));

        let part = Partition::uniform(n, 5);
        let m = BlrMatrix::from_dense(lu.as_ref(), part.clone(), part)?;
        let x = Mat::from_fn(n, 2, |_, _| rng.random::<f64>());
        let mut b = Mat::zeros(n, 2);
        kernels::gemm(1.0, a.as_ref(), x.as_ref(), 0.0, b.as_mut());
        m.unit_lower_solve_in_place(b.as_mut())?;
        m.upper_solve_in_place(b.as_mut())?;
        assert!((&b - &x).norm_l2() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_draw_emits_one_rectangle_per_tile() -> Result<(), Box<dyn std::error::Error>> {
        let a = Mat::<f64>::zeros(6, 6);
        let mut m = BlrMatrix::from_dense(a.as_ref(), Partition::uniform(6, 3), Partition::uniform(6, 3))?;
        *m.tile_mut(1, 0) = Tile::LowRank {
            u: Mat::zeros(3, 1),
            v: Mat::zeros(1, 3),
        };
        let mut out = Vec::new();
        m.draw(&mut out, 0, 0)?;
        let text = String::from_utf8(out)?;
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("#FF0000"));
        assert!(text.contains("set obj rect from 0, 6 to 3, 3"));
        Ok(())
    }
}
