//! Task-graph driver for general-purpose processors.
//!
//! Every per-tile operation of the block-column elimination becomes a task of a
//! [`TaskGraph`], keyed by the tiles it reads and writes:
//!
//! - factor the diagonal tile `B11(i,i)`;
//! - for tiles right of the diagonal and for `B12(i,.)`: compress when allowed, apply
//!   the block-`i` pivot, solve with the unit lower factor;
//! - for tiles below the diagonal and for `B21(.,i)`: compress when allowed, solve with
//!   the upper factor from the right;
//! - Schur updates `X(k,j) -= X(k,i) * X(i,j)` into the dense tiles of later block
//!   columns;
//! - apply the block-`i` pivot to the tiles of `L` left of the diagonal, so the pivot
//!   vector describes the final `L`.
//!
//! Tiles live behind [`RwLock`]s during the parallel phase. The graph already orders
//! conflicting accesses, so the locks never wait; they only make the shared access safe.
//! Once the graph has drained, the trailing update `A22 -= B21 * B12` runs in parallel
//! over the column blocks of `A22`.

use super::{
    EliminationDriver, Front, PartialFactorization, TileLayout, global_pivot, globalize_singular,
    schedule::TaskGraph,
};
use crate::{
    error::{BlrError, BlrErrorKind},
    kernels::{Diag, Side, Trans, Triangle},
    matrix::{BlrMatrix, Partition},
    options::BlrOptions,
    stats::FactorStats,
    tile::Tile,
};
use faer::prelude::*;
use parking_lot::RwLock;
use rayon::prelude::*;

/// One of the three BLR matrices built by the elimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Block {
    B11,
    B12,
    B21,
}

/// Data a task depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    Tile(Block, usize, usize),
    Pivot(usize),
}

/// A per-tile operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Factor { i: usize },
    /// `B11(i,j)`, `j > i`, or `B12(i,j)`: compress, permute, solve with `L(i,i)`.
    RowPanel { block: Block, i: usize, j: usize },
    /// `B11(k,i)`, `k > i`, or `B21(k,i)`: compress, solve with `U(i,i)`.
    ColPanel { block: Block, k: usize, i: usize },
    /// `target(k,j) -= left(k,i) * right(i,j)`.
    Update {
        target: Block,
        left: Block,
        right: Block,
        k: usize,
        j: usize,
        i: usize,
    },
    /// `B11(i,j)`, `j < i`: apply the block-`i` pivot.
    PermuteLower { i: usize, j: usize },
}

/// Tiles of one BLR matrix, individually locked.
struct TileGrid {
    rows: Partition,
    cols: Partition,
    tiles: Vec<RwLock<Tile>>,
}

impl TileGrid {
    fn from_dense(a: MatRef<'_, f64>, rows: &Partition, cols: &Partition) -> Self {
        let mut tiles = Vec::with_capacity(rows.len() * cols.len());
        for j in 0..cols.len() {
            for i in 0..rows.len() {
                let block = a.submatrix(rows.offset(i), cols.offset(j), rows.size(i), cols.size(j));
                tiles.push(RwLock::new(Tile::Dense(block.to_owned())));
            }
        }
        Self {
            rows: rows.clone(),
            cols: cols.clone(),
            tiles,
        }
    }

    fn get(&self, i: usize, j: usize) -> &RwLock<Tile> {
        &self.tiles[i + j * self.rows.len()]
    }

    fn into_matrix(self) -> Result<BlrMatrix, BlrError> {
        let tiles = self.tiles.into_iter().map(RwLock::into_inner).collect();
        BlrMatrix::from_tiles(self.rows, self.cols, tiles)
    }
}

/// Working state shared by the tasks of one elimination.
struct Workspace<'a> {
    layout: &'a TileLayout,
    opts: &'a BlrOptions,
    stats: &'a FactorStats,
    b11: TileGrid,
    b12: TileGrid,
    b21: TileGrid,
    pivots: Vec<RwLock<Vec<usize>>>,
}

impl Workspace<'_> {
    fn grid(&self, block: Block) -> &TileGrid {
        match block {
            Block::B11 => &self.b11,
            Block::B12 => &self.b12,
            Block::B21 => &self.b21,
        }
    }

    /// Compresses a tile in place when `allowed`.
    fn compress(&self, tile: &mut Tile, allowed: bool) -> Result<(), BlrError> {
        if allowed {
            *tile = tile.compress(self.opts, self.stats)?;
        }
        Ok(())
    }

    fn execute(&self, task: &Task) -> Result<(), BlrError> {
        match *task {
            Task::Factor { i } => {
                let mut diag = self.b11.get(i, i).write();
                let perm = diag
                    .factor_pivoted()
                    .map_err(|e| globalize_singular(e, self.layout.tiles.offset(i)))?;
                let n = perm.len() as u64;
                self.stats.add_flops(2 * n * n * n / 3);
                *self.pivots[i].write() = perm;
                log::debug!("factored diagonal tile {i}");
            }
            Task::RowPanel { block, i, j } => {
                let allowed = block != Block::B11 || self.layout.admissibility.get(i, j);
                let mut tile = self.grid(block).get(i, j).write();
                self.compress(&mut tile, allowed)?;
                tile.permute_rows(&self.pivots[i].read(), true)?;
                let diag = self.b11.get(i, i).read();
                tile.solve_triangular(Side::Left, Triangle::Lower, Trans::No, Diag::Unit, 1.0, &diag)?;
                self.stats.add_flops(tile.solve_flops(Side::Left));
            }
            Task::ColPanel { block, k, i } => {
                let allowed = block != Block::B11 || self.layout.admissibility.get(k, i);
                let mut tile = self.grid(block).get(k, i).write();
                self.compress(&mut tile, allowed)?;
                let diag = self.b11.get(i, i).read();
                tile.solve_triangular(Side::Right, Triangle::Upper, Trans::No, Diag::NonUnit, 1.0, &diag)?;
                self.stats.add_flops(tile.solve_flops(Side::Right));
            }
            Task::Update {
                target,
                left,
                right,
                k,
                j,
                i,
            } => {
                let a = self.grid(left).get(k, i).read();
                let b = self.grid(right).get(i, j).read();
                let mut c = self.grid(target).get(k, j).write();
                let flops = a.accumulate_into(&b, -1.0, c.dense_mut()?)?;
                self.stats.add_flops(flops);
            }
            Task::PermuteLower { i, j } => {
                let mut tile = self.b11.get(i, j).write();
                tile.permute_rows(&self.pivots[i].read(), true)?;
            }
        }
        Ok(())
    }
}

/// Builds the task graph of the block-column elimination.
fn build_graph(nb: usize, nb2: usize) -> TaskGraph<Key, Task> {
    use Block::*;
    let t = Key::Tile;
    let mut g = TaskGraph::new();
    for i in 0..nb {
        g.add(Task::Factor { i }, &[], &[t(B11, i, i), Key::Pivot(i)]);
        for j in i + 1..nb {
            g.add(
                Task::RowPanel { block: B11, i, j },
                &[t(B11, i, i), Key::Pivot(i)],
                &[t(B11, i, j)],
            );
        }
        for j in 0..nb2 {
            g.add(
                Task::RowPanel { block: B12, i, j },
                &[t(B11, i, i), Key::Pivot(i)],
                &[t(B12, i, j)],
            );
        }
        for k in i + 1..nb {
            g.add(Task::ColPanel { block: B11, k, i }, &[t(B11, i, i)], &[t(B11, k, i)]);
        }
        for k in 0..nb2 {
            g.add(Task::ColPanel { block: B21, k, i }, &[t(B11, i, i)], &[t(B21, k, i)]);
        }
        for j in 0..i {
            g.add(Task::PermuteLower { i, j }, &[Key::Pivot(i)], &[t(B11, i, j)]);
        }
        for k in i + 1..nb {
            for j in i + 1..nb {
                let task = Task::Update { target: B11, left: B11, right: B11, k, j, i };
                g.add(task, &[t(B11, k, i), t(B11, i, j)], &[t(B11, k, j)]);
            }
            for j in 0..nb2 {
                let task = Task::Update { target: B12, left: B11, right: B12, k, j, i };
                g.add(task, &[t(B11, k, i), t(B12, i, j)], &[t(B12, k, j)]);
            }
        }
        for k in 0..nb2 {
            for j in i + 1..nb {
                let task = Task::Update { target: B21, left: B21, right: B11, k, j, i };
                g.add(task, &[t(B21, k, i), t(B11, i, j)], &[t(B21, k, j)]);
            }
        }
    }
    g
}

/// Partial factorization driven by a task-dependency graph on a rayon thread pool.
#[derive(Debug, Default)]
pub struct TaskDriver {
    pool: Option<rayon::ThreadPool>,
}

impl TaskDriver {
    /// A driver running on the global rayon pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver with a dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, BlrError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("blr-worker-{i}"))
            .build()
            .map_err(|e| BlrErrorKind::ThreadPool(e.to_string()))?;
        Ok(Self { pool: Some(pool) })
    }

    /// Number of worker threads the driver uses.
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    fn factor(
        &self,
        front: &Front,
        layout: &TileLayout,
        opts: &BlrOptions,
        stats: &FactorStats,
    ) -> Result<(PartialFactorization, Mat<f64>), BlrError> {
        let (nb, nb2) = (layout.tiles.len(), layout.tiles2.len());
        let ws = Workspace {
            layout,
            opts,
            stats,
            b11: TileGrid::from_dense(front.a11.as_ref(), &layout.tiles, &layout.tiles),
            b12: TileGrid::from_dense(front.a12.as_ref(), &layout.tiles, &layout.tiles2),
            b21: TileGrid::from_dense(front.a21.as_ref(), &layout.tiles2, &layout.tiles),
            pivots: (0..nb).map(|_| RwLock::new(Vec::new())).collect(),
        };

        let graph = build_graph(nb, nb2);
        log::debug!(
            "task graph with {} tasks and {} edges on {} threads",
            graph.len(),
            graph.edges(),
            self.threads()
        );
        graph.run(|task| ws.execute(task))?;

        let local: Vec<Vec<usize>> = ws.pivots.into_iter().map(RwLock::into_inner).collect();
        let factors = PartialFactorization {
            b11: ws.b11.into_matrix()?,
            b12: ws.b12.into_matrix()?,
            b21: ws.b21.into_matrix()?,
            piv: global_pivot(&layout.tiles, &local),
        };

        let mut a22 = front.a22.clone();
        if nb2 > 0 && nb > 0 {
            schur_update(&factors, &layout.tiles2, a22.as_mut(), stats)?;
        }
        Ok((factors, a22))
    }
}

/// `A22 -= B21 * B12`, one parallel task per column block of `A22`.
fn schur_update(
    factors: &PartialFactorization,
    tiles2: &Partition,
    a22: MatMut<'_, f64>,
    stats: &FactorStats,
) -> Result<(), BlrError> {
    let mut columns = Vec::with_capacity(tiles2.len());
    let mut rest = a22;
    for j in 0..tiles2.len() {
        let (head, tail) = rest.split_at_col_mut(tiles2.size(j));
        columns.push(head);
        rest = tail;
    }
    let nb = factors.b11.rowblocks();
    columns
        .into_par_iter()
        .enumerate()
        .try_for_each(|(j, mut col)| {
            for k in 0..tiles2.len() {
                for i in 0..nb {
                    let target = col
                        .rb_mut()
                        .submatrix_mut(tiles2.offset(k), 0, tiles2.size(k), tiles2.size(j));
                    let flops = factors
                        .b21
                        .tile(k, i)
                        .accumulate_into(factors.b12.tile(i, j), -1.0, target)?;
                    stats.add_flops(flops);
                }
            }
            Ok(())
        })
}

impl EliminationDriver for TaskDriver {
    fn name(&self) -> &str {
        "task"
    }

    fn partial_factor(
        &self,
        front: &mut Front,
        layout: &TileLayout,
        opts: &BlrOptions,
        stats: &FactorStats,
    ) -> Result<PartialFactorization, BlrError> {
        opts.validate()?;
        layout.validate(front)?;
        let (factors, a22) = match &self.pool {
            Some(pool) => pool.install(|| self.factor(front, layout, opts, stats))?,
            None => self.factor(front, layout, opts, stats)?,
        };
        front.a22 = a22;
        front.release();
        log::info!(
            "task driver: n = {}, n2 = {}, memory = {} bytes, max rank = {}",
            factors.b11.rows(),
            factors.b12.cols(),
            factors.memory(),
            factors.maximum_rank()
        );
        Ok(factors)
    }
}
