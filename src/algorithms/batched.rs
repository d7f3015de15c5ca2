//! Batched Schur-complement updates for the device driver.
//!
//! At every block column the device driver has many small, independent products
//! `C -= A * B` whose operands are dense tiles or low-rank factor pairs of different
//! sizes. Issuing them one by one would be dominated by launch overhead, so they are
//! collected into descriptor lists and issued as a few batched multiplies.
//!
//! [`BatchedGemm`] is one such list with a common `alpha`/`beta`. [`SchurBatch`] splits
//! each tile product into at most three chained stages, following [`ProductPlan`]:
//!
//! 1. rank-sized or half-expanded intermediates (`Va * Ub`, `A * U`, `V * B`),
//!    `alpha = 1`, `beta = 0`;
//! 2. for low-rank times low-rank, the expansion on the side with the smaller
//!    intermediate, `alpha = 1`, `beta = 0`;
//! 3. the accumulation into the dense target, `alpha = -1`, `beta = 1`.
//!
//! Intermediates are carved out of one preallocated device workspace by a bump allocator
//! that is reset after every batch. Its size is fixed for the whole elimination from the
//! bound computed by [`update_workspace_bound`].

use crate::{
    device::{BufferId, ComputeDevice, DeviceMat, GemmDescriptor, Stream},
    error::{BlrError, BlrErrorKind},
    stats::FactorStats,
    tile::ProductPlan,
};

/// A tile resident on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTile {
    Dense(DeviceMat),
    LowRank { u: DeviceMat, v: DeviceMat },
}

impl DeviceTile {
    pub fn rows(&self) -> usize {
        match self {
            DeviceTile::Dense(d) => d.rows,
            DeviceTile::LowRank { u, .. } => u.rows,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            DeviceTile::Dense(d) => d.cols,
            DeviceTile::LowRank { v, .. } => v.cols,
        }
    }

    /// Rank of a low-rank tile, `None` for a dense one.
    pub fn low_rank_rank(&self) -> Option<usize> {
        match self {
            DeviceTile::Dense(_) => None,
            DeviceTile::LowRank { u, .. } => Some(u.cols),
        }
    }

    /// The view row operations act on: the tile, or `u`.
    pub fn row_factor(&self) -> DeviceMat {
        match self {
            DeviceTile::Dense(d) => *d,
            DeviceTile::LowRank { u, .. } => *u,
        }
    }

    /// The view column operations act on: the tile, or `v`.
    pub fn col_factor(&self) -> DeviceMat {
        match self {
            DeviceTile::Dense(d) => *d,
            DeviceTile::LowRank { v, .. } => *v,
        }
    }
}

/// A list of products `c = beta * c + alpha * a * b` issued as one batched call.
#[derive(Debug, Clone)]
pub struct BatchedGemm {
    alpha: f64,
    beta: f64,
    descriptors: Vec<GemmDescriptor>,
}

impl BatchedGemm {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            descriptors: Vec::new(),
        }
    }

    /// Appends a product after checking that the shapes agree.
    pub fn add(&mut self, a: DeviceMat, b: DeviceMat, c: DeviceMat) -> Result<(), BlrError> {
        if a.cols != b.rows {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "batched product inner dimension",
                expected: a.cols,
                actual: b.rows,
            }
            .into());
        }
        if c.rows != a.rows || c.cols != b.cols {
            return Err(BlrErrorKind::DimensionMismatch {
                what: "batched product target",
                expected: a.rows * b.cols,
                actual: c.rows * c.cols,
            }
            .into());
        }
        self.descriptors.push(GemmDescriptor { a, b, c });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Floating-point operations of the whole batch.
    pub fn flops(&self) -> u64 {
        self.descriptors
            .iter()
            .map(|g| 2 * (g.a.rows * g.b.cols * g.a.cols) as u64)
            .sum()
    }

    /// Issues the batch as a single device call and empties it.
    pub fn run<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &D,
        stream: Stream,
        stats: &FactorStats,
    ) -> Result<(), BlrError> {
        if self.descriptors.is_empty() {
            return Ok(());
        }
        device.gemm_batched(stream, self.alpha, self.beta, &self.descriptors)?;
        stats.add_flops(self.flops());
        stats.batched_call(self.descriptors.len());
        self.descriptors.clear();
        Ok(())
    }
}

/// Bump allocator over a device buffer region.
#[derive(Debug, Clone)]
pub struct Workspace {
    buffer: BufferId,
    offset: usize,
    capacity: usize,
    used: usize,
}

impl Workspace {
    /// Uses `capacity` scalars of `buffer` starting at `offset`.
    pub fn new(buffer: BufferId, offset: usize, capacity: usize) -> Self {
        Self {
            buffer,
            offset,
            capacity,
            used: 0,
        }
    }

    /// Takes a contiguous `rows x cols` view.
    pub fn take(&mut self, rows: usize, cols: usize) -> Result<DeviceMat, BlrError> {
        let len = rows * cols;
        if self.used + len > self.capacity {
            return Err(BlrErrorKind::DeviceResourceExhausted {
                requested: len,
                available: self.capacity - self.used,
            }
            .into());
        }
        let m = DeviceMat::new(self.buffer, self.offset + self.used, rows, cols);
        self.used += len;
        Ok(m)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

/// Builder of the three-stage batched update `C -= left * right` over many tile pairs.
#[derive(Debug, Clone)]
pub struct SchurBatch {
    stage1: BatchedGemm,
    stage2: BatchedGemm,
    stage3: BatchedGemm,
    workspace: Workspace,
    updates: usize,
}

impl SchurBatch {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            stage1: BatchedGemm::new(1.0, 0.0),
            stage2: BatchedGemm::new(1.0, 0.0),
            stage3: BatchedGemm::new(-1.0, 1.0),
            workspace,
            updates: 0,
        }
    }

    /// Number of tile updates collected since the last run.
    pub fn len(&self) -> usize {
        self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates == 0
    }

    /// Descriptors per stage, for inspection.
    pub fn stage_sizes(&self) -> [usize; 3] {
        [self.stage1.len(), self.stage2.len(), self.stage3.len()]
    }

    /// Adds `target -= left * right`.
    pub fn add_update(
        &mut self,
        left: DeviceTile,
        right: DeviceTile,
        target: DeviceMat,
    ) -> Result<(), BlrError> {
        let (m, n) = (target.rows, target.cols);
        let plan = ProductPlan::choose(m, n, left.low_rank_rank(), right.low_rank_rank());
        match (left, right) {
            (DeviceTile::Dense(a), DeviceTile::Dense(b)) => {
                self.stage3.add(a, b, target)?;
            }
            (DeviceTile::Dense(a), DeviceTile::LowRank { u, v }) => {
                let t = self.workspace.take(m, u.cols)?;
                self.stage1.add(a, u, t)?;
                self.stage3.add(t, v, target)?;
            }
            (DeviceTile::LowRank { u, v }, DeviceTile::Dense(b)) => {
                let t = self.workspace.take(v.rows, n)?;
                self.stage1.add(v, b, t)?;
                self.stage3.add(u, t, target)?;
            }
            (DeviceTile::LowRank { u: ua, v: va }, DeviceTile::LowRank { u: ub, v: vb }) => {
                let w = self.workspace.take(va.rows, ub.cols)?;
                self.stage1.add(va, ub, w)?;
                if plan == ProductPlan::LowRankLowRankLeft {
                    let t = self.workspace.take(m, ub.cols)?;
                    self.stage2.add(ua, w, t)?;
                    self.stage3.add(t, vb, target)?;
                } else {
                    let t = self.workspace.take(va.rows, n)?;
                    self.stage2.add(w, vb, t)?;
                    self.stage3.add(ua, t, target)?;
                }
            }
        }
        self.updates += 1;
        Ok(())
    }

    /// Issues the three stages in order and resets the workspace.
    pub fn run<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &D,
        stream: Stream,
        stats: &FactorStats,
    ) -> Result<(), BlrError> {
        self.stage1.run(device, stream, stats)?;
        self.stage2.run(device, stream, stats)?;
        self.stage3.run(device, stream, stats)?;
        self.workspace.reset();
        self.updates = 0;
        Ok(())
    }
}

/// Upper bound on the workspace of one update `m x n -= (m x k) * (k x n)`.
///
/// `left_rank`/`right_rank` are the largest rank the operand can have if it may end up
/// compressed, `None` if it always stays dense.
pub fn update_workspace_bound(
    m: usize,
    n: usize,
    left_rank: Option<usize>,
    right_rank: Option<usize>,
) -> usize {
    let lefts = [None, left_rank];
    let rights = [None, right_rank];
    let mut bound = 0;
    for (i, ra) in lefts.iter().enumerate() {
        for (j, rb) in rights.iter().enumerate() {
            if (i == 1 && ra.is_none()) || (j == 1 && rb.is_none()) {
                continue;
            }
            let plan = ProductPlan::choose(m, n, *ra, *rb);
            bound = bound.max(plan.workspace(m, n, ra.unwrap_or(0), rb.unwrap_or(0)));
        }
    }
    bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceBuffer, HostDevice},
        tile::Tile,
    };
    use faer::Mat;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn random(m: usize, n: usize, rng: &mut StdRng) -> Mat<f64> {
        Mat::from_fn(m, n, |_, _| rng.random::<f64>() - 0.5)
    }

    #[test]
    fn test_batched_gemm_checks_shapes() {
        let b = BufferId(0);
        let mut g = BatchedGemm::new(1.0, 0.0);
        assert!(g.add(DeviceMat::new(b, 0, 2, 3), DeviceMat::new(b, 0, 4, 2), DeviceMat::new(b, 0, 2, 2)).is_err());
        assert!(g.add(DeviceMat::new(b, 0, 2, 3), DeviceMat::new(b, 0, 3, 2), DeviceMat::new(b, 0, 3, 2)).is_err());
        assert!(g.add(DeviceMat::new(b, 0, 2, 3), DeviceMat::new(b, 0, 3, 2), DeviceMat::new(b, 0, 2, 2)).is_ok());
        assert_eq!(g.flops(), 24);
    }

    #[test]
    fn test_workspace_exhaustion() {
        let mut ws = Workspace::new(BufferId(0), 10, 12);
        let a = ws.take(3, 2).unwrap();
        assert_eq!(a.offset, 10);
        let b = ws.take(2, 3).unwrap();
        assert_eq!(b.offset, 16);
        let err = ws.take(1, 1).unwrap_err();
        assert_eq!(
            err.kind(),
            &BlrErrorKind::DeviceResourceExhausted { requested: 1, available: 0 }
        );
        ws.reset();
        assert_eq!(ws.used(), 0);
    }

    #[test]
    fn test_workspace_bound_covers_every_plan() {
        assert_eq!(update_workspace_bound(10, 10, None, None), 0);
        assert_eq!(update_workspace_bound(10, 12, None, Some(3)), 30);
        // LR x LR with ranks 4 and 3: 12 + min(10 * 3, 4 * 12)
        // dense x LR(3): 30, LR(4) x dense: 48, LR(4) x LR(3): 12 + 30
        assert_eq!(update_workspace_bound(10, 12, Some(4), Some(3)), 48);
    }

    /// Uploads a host tile into `buffer` at `*offset`.
    fn upload_tile(
        device: &HostDevice,
        stream: Stream,
        buffer: BufferId,
        offset: &mut usize,
        tile: &Tile,
    ) -> Result<DeviceTile, BlrError> {
        let mut put = |x: &Mat<f64>| -> Result<DeviceMat, BlrError> {
            let view = DeviceMat::new(buffer, *offset, x.nrows(), x.ncols());
            *offset += x.nrows() * x.ncols();
            device.upload(stream, x.as_ref(), view)?;
            Ok(view)
        };
        Ok(match tile {
            Tile::Dense(d) => DeviceTile::Dense(put(d)?),
            Tile::LowRank { u, v } => DeviceTile::LowRank {
                u: put(u)?,
                v: put(v)?,
            },
        })
    }

    #[test]
    fn test_schur_batch_matches_tile_products() -> Result<(), BlrError> {
        let mut rng = StdRng::seed_from_u64(7);
        let device = HostDevice::new();
        let stream = device.create_stream()?;
        let stats = FactorStats::new();
        let (m, k, n) = (20, 16, 24);
        let mut lr = |rows: usize, cols: usize, r: usize| Tile::LowRank {
            u: random(rows, r, &mut rng),
            v: random(r, cols, &mut rng),
        };
        let pairs = [
            (lr(m, k, 0), lr(k, n, 0)),
            (lr(m, k, 3), lr(k, n, 2)),
            (lr(m, k, 1), lr(k, n, 4)),
            (lr(m, k, 2), lr(k, n, 2)),
            (lr(m, k, 3), lr(k, n, 1)),
        ];
        // Expand some operands to cover the dense combinations.
        let mut pairs: Vec<(Tile, Tile)> = pairs.into_iter().collect();
        pairs[0].0 = Tile::Dense(random(m, k, &mut rng));
        pairs[0].1 = Tile::Dense(random(k, n, &mut rng));
        pairs[3].0.decompress();
        pairs[4].1.decompress();

        let storage = DeviceBuffer::scalars(&device, 4096)?;
        let targets = DeviceBuffer::scalars(&device, pairs.len() * m * n)?;
        let ws = DeviceBuffer::scalars(&device, 1024)?;
        let mut batch = SchurBatch::new(Workspace::new(ws.id(), 0, ws.len()));

        let mut offset = 0;
        let mut expected = Vec::new();
        for (idx, (a, b)) in pairs.iter().enumerate() {
            let da = upload_tile(&device, stream, storage.id(), &mut offset, a)?;
            let db = upload_tile(&device, stream, storage.id(), &mut offset, b)?;
            let c0 = random(m, n, &mut rng);
            let c = targets.mat(idx * m * n, m, n);
            device.upload(stream, c0.as_ref(), c)?;
            batch.add_update(da, db, c)?;

            let mut e = c0.clone();
            a.accumulate_into(b, -1.0, e.as_mut())?;
            expected.push(e);
        }
        assert_eq!(batch.len(), 5);
        // DD: 3 | LRxLR: 1, 2, 3 | LRxLR: 1, 2, 3 | DxLR: 1, 3 | LRxD: 1, 3
        assert_eq!(batch.stage_sizes(), [4, 2, 5]);
        batch.run(&device, stream, &stats)?;
        device.synchronize(stream)?;
        assert!(batch.is_empty());

        for (idx, e) in expected.iter().enumerate() {
            let mut out = Mat::zeros(m, n);
            device.download(stream, targets.mat(idx * m * n, m, n), out.as_mut())?;
            let err = (&out - e).norm_l2() / e.norm_l2();
            assert!(err < 1e-13, "update {idx}: relative error {err}");
        }
        let snap = stats.snapshot();
        assert_eq!(snap.batched_calls, 3);
        assert_eq!(snap.batched_products, 11);
        Ok(())
    }
}
