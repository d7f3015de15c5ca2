//! Accelerator driver: the block-column elimination on a [`ComputeDevice`].
//!
//! The driver runs the same elimination as [`super::host::TaskDriver`], organized for a
//! device:
//!
//! 1. All working memory is allocated up front: one buffer holding the tiles of `A11`,
//!    `A12`, `A21` and `A22` (each tile contiguous with leading dimension equal to its
//!    row count), an SVD scratch area sized for the largest compressible tile, the
//!    workspace of the batched updates sized for the largest batch, and an index buffer
//!    for pivots and the factorization status. If any of it does not fit, the
//!    elimination fails with [`BlrErrorKind::DeviceResourceExhausted`] before any work
//!    is done.
//! 2. Per block column: pivoted LU of the diagonal tile, device-side compression of the
//!    panel tiles (the factors are written back into the tile's own slot), row swaps,
//!    triangular solves, then the Schur updates of the remaining tiles as two
//!    [`SchurBatch`]es (one for `B11`, one for the coupling blocks).
//! 3. Then `A22 -= B21 * B12` is applied with one batch per block index.
//! 4. Finally every tile of `B11`, `B12`, `B21` and `A22` is copied back to the host in
//!    one pass. All tiles stay resident until then, so the peak device footprint is the
//!    one computed in step 1.
//!
//! Everything runs on one stream. The host waits on the stream before it reads any
//! device result (the factorization status, pivots, singular values).

use super::{
    EliminationDriver, Front, PartialFactorization, TileLayout,
    batched::{DeviceTile, SchurBatch, Workspace, update_workspace_bound},
    global_pivot,
};
use crate::{
    compression::{max_beneficial_rank, rank_pays_off, select_rank},
    device::{BufferId, ComputeDevice, DeviceBuffer, DeviceIndices, DeviceMat, Stream},
    error::{BlrError, BlrErrorKind},
    kernels::{Diag, Side, Trans, Triangle},
    matrix::{BlrMatrix, Partition},
    options::BlrOptions,
    stats::FactorStats,
    tile::Tile,
};
use faer::prelude::*;

const SCALAR_BYTES: u64 = std::mem::size_of::<f64>() as u64;

/// Device placement of the tiles of one matrix.
struct DeviceGrid {
    rows: Partition,
    cols: Partition,
    tiles: Vec<DeviceTile>,
}

impl DeviceGrid {
    /// Lays out the tiles contiguously in `buffer` from `base`, column block by column
    /// block.
    fn new(buffer: BufferId, base: usize, rows: &Partition, cols: &Partition) -> Self {
        let mut tiles = Vec::with_capacity(rows.len() * cols.len());
        let mut offset = base;
        for j in 0..cols.len() {
            for i in 0..rows.len() {
                tiles.push(DeviceTile::Dense(DeviceMat::new(
                    buffer,
                    offset,
                    rows.size(i),
                    cols.size(j),
                )));
                offset += rows.size(i) * cols.size(j);
            }
        }
        Self {
            rows: rows.clone(),
            cols: cols.clone(),
            tiles,
        }
    }

    fn tile(&self, i: usize, j: usize) -> DeviceTile {
        self.tiles[i + j * self.rows.len()]
    }

    fn set(&mut self, i: usize, j: usize, tile: DeviceTile) {
        let rb = self.rows.len();
        self.tiles[i + j * rb] = tile;
    }

    /// The dense view of a tile that must not have been compressed.
    fn dense(&self, i: usize, j: usize) -> Result<DeviceMat, BlrError> {
        match self.tile(i, j) {
            DeviceTile::Dense(d) => Ok(d),
            DeviceTile::LowRank { .. } => Err(BlrErrorKind::UnsupportedRepresentation(
                "Schur update into a compressed tile",
            )
            .into()),
        }
    }

    fn upload<D: ComputeDevice + ?Sized>(
        &self,
        device: &D,
        stream: Stream,
        a: MatRef<'_, f64>,
        stats: &FactorStats,
    ) -> Result<(), BlrError> {
        for j in 0..self.cols.len() {
            for i in 0..self.rows.len() {
                let (r, c) = (self.rows.offset(i), self.cols.offset(j));
                let block = a.submatrix(r, c, self.rows.size(i), self.cols.size(j));
                device.upload(stream, block, self.dense(i, j)?)?;
            }
        }
        stats.add_bytes((a.nrows() * a.ncols()) as u64 * SCALAR_BYTES);
        Ok(())
    }

    /// Copies one tile back to the host in its current representation.
    fn download<D: ComputeDevice + ?Sized>(
        &self,
        device: &D,
        stream: Stream,
        i: usize,
        j: usize,
        stats: &FactorStats,
    ) -> Result<Tile, BlrError> {
        let fetch = |m: DeviceMat| -> Result<Mat<f64>, BlrError> {
            let mut host = Mat::zeros(m.rows, m.cols);
            device.download(stream, m, host.as_mut())?;
            Ok(host)
        };
        let tile = match self.tile(i, j) {
            DeviceTile::Dense(d) => Tile::Dense(fetch(d)?),
            DeviceTile::LowRank { u, v } => Tile::LowRank {
                u: fetch(u)?,
                v: fetch(v)?,
            },
        };
        stats.add_bytes(tile.nonzeros() as u64 * SCALAR_BYTES);
        Ok(tile)
    }

    /// Copies every tile back to the host, column block by column block.
    fn download_all<D: ComputeDevice + ?Sized>(
        &self,
        device: &D,
        stream: Stream,
        stats: &FactorStats,
    ) -> Result<BlrMatrix, BlrError> {
        let mut tiles = Vec::with_capacity(self.tiles.len());
        for j in 0..self.cols.len() {
            for i in 0..self.rows.len() {
                tiles.push(self.download(device, stream, i, j, stats)?);
            }
        }
        BlrMatrix::from_tiles(self.rows.clone(), self.cols.clone(), tiles)
    }
}

/// Sizes of the device allocations of one elimination, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Footprint {
    tiles: usize,
    scratch: usize,
    workspace: usize,
    indices: usize,
}

/// Largest rank a tile can have if it may end up compressed.
fn rank_bound(opts: &BlrOptions, m: usize, n: usize, allowed: bool) -> Option<usize> {
    (allowed && opts.allows_compression(m, n)).then(|| max_beneficial_rank(m, n))
}

impl Footprint {
    fn of(layout: &TileLayout, opts: &BlrOptions) -> Self {
        let (t, t2) = (&layout.tiles, &layout.tiles2);
        let (n, n2) = (t.total(), t2.total());
        let (nb, nb2) = (t.len(), t2.len());
        let r11 = |a: usize, b: usize| {
            rank_bound(opts, t.size(a), t.size(b), a != b && layout.admissibility.get(a, b))
        };
        let r12 = |a: usize, b: usize| rank_bound(opts, t.size(a), t2.size(b), true);
        let r21 = |a: usize, b: usize| rank_bound(opts, t2.size(a), t.size(b), true);

        let mut workspace = 0;
        for i in 0..nb {
            let mut b11 = 0;
            for k in i + 1..nb {
                for j in i + 1..nb {
                    b11 += update_workspace_bound(t.size(k), t.size(j), r11(k, i), r11(i, j));
                }
            }
            let mut coupling = 0;
            for k in i + 1..nb {
                for j in 0..nb2 {
                    coupling += update_workspace_bound(t.size(k), t2.size(j), r11(k, i), r12(i, j));
                }
            }
            for k in 0..nb2 {
                for j in i + 1..nb {
                    coupling += update_workspace_bound(t2.size(k), t.size(j), r21(k, i), r11(i, j));
                }
            }
            let mut trailing = 0;
            for k in 0..nb2 {
                for j in 0..nb2 {
                    trailing += update_workspace_bound(t2.size(k), t2.size(j), r21(k, i), r12(i, j));
                }
            }
            workspace = workspace.max(b11).max(coupling).max(trailing);
        }

        let svd = |m: usize, n: usize| {
            let k = m.min(n);
            k + m * k + k * n
        };
        let mut scratch = 0;
        for a in 0..nb {
            for b in 0..nb {
                if r11(a, b).is_some() {
                    scratch = scratch.max(svd(t.size(a), t.size(b)));
                }
            }
            for b in 0..nb2 {
                if r12(a, b).is_some() {
                    scratch = scratch.max(svd(t.size(a), t2.size(b)));
                }
                if r21(b, a).is_some() {
                    scratch = scratch.max(svd(t2.size(b), t.size(a)));
                }
            }
        }

        Self {
            tiles: n * n + 2 * n * n2 + n2 * n2,
            scratch,
            workspace,
            indices: n + 1,
        }
    }
}

/// Everything one elimination needs on the device.
struct Session<'a, D: ComputeDevice + ?Sized> {
    device: &'a D,
    stream: Stream,
    opts: &'a BlrOptions,
    stats: &'a FactorStats,
    scratch: BufferId,
    piv: DeviceIndices,
    info: DeviceIndices,
}

impl<D: ComputeDevice + ?Sized> Session<'_, D> {
    /// Compresses a dense tile on the device when allowed.
    ///
    /// The singular values are read back to pick the rank; the factors are then written
    /// into the first `r * (m + n)` entries of the tile's own slot, `u` with leading
    /// dimension `m` followed by `v` with leading dimension `r`.
    fn compress(&self, tile: DeviceTile, allowed: bool) -> Result<DeviceTile, BlrError> {
        let DeviceTile::Dense(a) = tile else {
            return Ok(tile);
        };
        if !allowed {
            return Ok(tile);
        }
        let (m, n) = (a.rows, a.cols);
        if !self.opts.allows_compression(m, n) {
            self.stats.tile_skipped();
            return Ok(tile);
        }
        let k = m.min(n);
        let s = DeviceMat::new(self.scratch, 0, k, 1);
        let u = DeviceMat::new(self.scratch, k, m, k);
        let vt = DeviceMat::new(self.scratch, k + m * k, k, n);
        self.device.gesvd(self.stream, a, s, u, vt)?;
        self.device.synchronize(self.stream)?;
        let mut sigma = Mat::zeros(k, 1);
        self.device.download(self.stream, s, sigma.as_mut())?;
        self.device.synchronize(self.stream)?;
        let sigma: Vec<f64> = (0..k).map(|i| sigma[(i, 0)]).collect();

        let rank = select_rank(&sigma, self.opts.threshold());
        if !rank_pays_off(rank, m, n) {
            self.stats.tile_rejected();
            return Ok(tile);
        }
        let du = DeviceMat::new(a.buffer, a.offset, m, rank);
        let dv = DeviceMat::with_ld(a.buffer, a.offset + m * rank, rank, n, rank.max(1));
        self.device.copy(self.stream, u.submatrix(0, 0, m, rank), du)?;
        self.device.copy(self.stream, vt.submatrix(0, 0, rank, n), dv)?;
        self.device.scale_rows(self.stream, dv, s.submatrix(0, 0, rank, 1))?;
        self.stats.tile_compressed();
        Ok(DeviceTile::LowRank { u: du, v: dv })
    }

    /// Factors the diagonal tile of block `i` and returns its local pivot.
    fn factor_diagonal(&self, diag: DeviceMat, offset: usize) -> Result<Vec<usize>, BlrError> {
        let m = diag.rows;
        let piv = DeviceIndices {
            buffer: self.piv.buffer,
            offset: self.piv.offset + offset,
            len: m,
        };
        self.device.getrf(self.stream, diag, piv, self.info)?;
        self.device.synchronize(self.stream)?;
        let mut status = [0];
        self.device.download_indices(self.stream, self.info, &mut status)?;
        let mut local = vec![0; m];
        self.device.download_indices(self.stream, piv, &mut local)?;
        self.device.synchronize(self.stream)?;
        if status[0] != 0 {
            return Err(BlrErrorKind::SingularPivot {
                row: offset + status[0] - 1,
            }
            .into());
        }
        let n = m as u64;
        self.stats.add_flops(2 * n * n * n / 3);
        Ok(local)
    }

    fn pivot_slice(&self, offset: usize, len: usize) -> DeviceIndices {
        DeviceIndices {
            buffer: self.piv.buffer,
            offset: self.piv.offset + offset,
            len,
        }
    }

    /// Row panel tile: compress when allowed, swap rows, solve with `L(i,i)`.
    fn row_panel(&self, tile: DeviceTile, allowed: bool, diag: DeviceMat, piv: DeviceIndices) -> Result<DeviceTile, BlrError> {
        let tile = self.compress(tile, allowed)?;
        let target = tile.row_factor();
        self.device.laswp(self.stream, target, piv)?;
        self.device.trsm(self.stream, Side::Left, Triangle::Lower, Trans::No, Diag::Unit, 1.0, diag, target)?;
        self.stats.add_flops((diag.rows * diag.rows * target.cols) as u64);
        Ok(tile)
    }

    /// Column panel tile: compress when allowed, solve with `U(i,i)` from the right.
    fn col_panel(&self, tile: DeviceTile, allowed: bool, diag: DeviceMat) -> Result<DeviceTile, BlrError> {
        let tile = self.compress(tile, allowed)?;
        let target = tile.col_factor();
        self.device.trsm(self.stream, Side::Right, Triangle::Upper, Trans::No, Diag::NonUnit, 1.0, diag, target)?;
        self.stats.add_flops((diag.rows * diag.rows * target.rows) as u64);
        Ok(tile)
    }
}

/// Partial factorization on a [`ComputeDevice`] with batched Schur updates.
#[derive(Debug)]
pub struct DeviceDriver<D: ComputeDevice> {
    device: D,
}

impl<D: ComputeDevice> DeviceDriver<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn factor(
        &self,
        front: &Front,
        layout: &TileLayout,
        opts: &BlrOptions,
        stats: &FactorStats,
    ) -> Result<(PartialFactorization, Mat<f64>), BlrError> {
        let device = &self.device;
        let (t, t2) = (&layout.tiles, &layout.tiles2);
        let (n, n2) = (t.total(), t2.total());
        let (nb, nb2) = (t.len(), t2.len());

        let fp = Footprint::of(layout, opts);
        log::debug!("device footprint on {}: {fp:?}", device.name());
        let tiles = DeviceBuffer::scalars(device, fp.tiles)?;
        let scratch = DeviceBuffer::scalars(device, fp.scratch)?;
        let workspace = DeviceBuffer::scalars(device, fp.workspace)?;
        let indices = DeviceBuffer::indices(device, fp.indices)?;
        let stream = device.create_stream()?;

        let mut g11 = DeviceGrid::new(tiles.id(), 0, t, t);
        let mut g12 = DeviceGrid::new(tiles.id(), n * n, t, t2);
        let mut g21 = DeviceGrid::new(tiles.id(), n * n + n * n2, t2, t);
        let g22 = DeviceGrid::new(tiles.id(), n * n + 2 * n * n2, t2, t2);
        g11.upload(device, stream, front.a11.as_ref(), stats)?;
        g12.upload(device, stream, front.a12.as_ref(), stats)?;
        g21.upload(device, stream, front.a21.as_ref(), stats)?;
        g22.upload(device, stream, front.a22.as_ref(), stats)?;

        let session = Session {
            device,
            stream,
            opts,
            stats,
            scratch: scratch.id(),
            piv: indices.slice(0, n),
            info: indices.slice(n, 1),
        };
        let mut batch = SchurBatch::new(Workspace::new(workspace.id(), 0, fp.workspace));
        let mut local = Vec::with_capacity(nb);

        for i in 0..nb {
            let diag = g11.dense(i, i)?;
            let piv = session.pivot_slice(t.offset(i), t.size(i));
            local.push(session.factor_diagonal(diag, t.offset(i))?);

            for j in i + 1..nb {
                let tile = session.row_panel(g11.tile(i, j), layout.admissibility.get(i, j), diag, piv)?;
                g11.set(i, j, tile);
            }
            for j in 0..nb2 {
                let tile = session.row_panel(g12.tile(i, j), true, diag, piv)?;
                g12.set(i, j, tile);
            }
            for k in i + 1..nb {
                let tile = session.col_panel(g11.tile(k, i), layout.admissibility.get(k, i), diag)?;
                g11.set(k, i, tile);
            }
            for k in 0..nb2 {
                let tile = session.col_panel(g21.tile(k, i), true, diag)?;
                g21.set(k, i, tile);
            }
            for j in 0..i {
                device.laswp(stream, g11.tile(i, j).row_factor(), piv)?;
            }

            for k in i + 1..nb {
                for j in i + 1..nb {
                    batch.add_update(g11.tile(k, i), g11.tile(i, j), g11.dense(k, j)?)?;
                }
            }
            batch.run(device, stream, stats)?;
            for k in i + 1..nb {
                for j in 0..nb2 {
                    batch.add_update(g11.tile(k, i), g12.tile(i, j), g12.dense(k, j)?)?;
                }
            }
            for k in 0..nb2 {
                for j in i + 1..nb {
                    batch.add_update(g21.tile(k, i), g11.tile(i, j), g21.dense(k, j)?)?;
                }
            }
            batch.run(device, stream, stats)?;
            log::debug!("block column {i} issued on {}", device.name());
        }

        if nb2 > 0 {
            for i in 0..nb {
                for k in 0..nb2 {
                    for j in 0..nb2 {
                        batch.add_update(g21.tile(k, i), g12.tile(i, j), g22.dense(k, j)?)?;
                    }
                }
                batch.run(device, stream, stats)?;
            }
        }
        device.synchronize(stream)?;

        let b11 = g11.download_all(device, stream, stats)?;
        let b12 = g12.download_all(device, stream, stats)?;
        let b21 = g21.download_all(device, stream, stats)?;
        let mut a22 = front.a22.clone();
        if nb > 0 {
            for j in 0..nb2 {
                for k in 0..nb2 {
                    let dst = a22
                        .as_mut()
                        .submatrix_mut(t2.offset(k), t2.offset(j), t2.size(k), t2.size(j));
                    device.download(stream, g22.dense(k, j)?, dst)?;
                }
            }
            stats.add_bytes((n2 * n2) as u64 * SCALAR_BYTES);
        }
        device.synchronize(stream)?;

        let factors = PartialFactorization {
            b11,
            b12,
            b21,
            piv: global_pivot(t, &local),
        };
        Ok((factors, a22))
    }
}

impl<D: ComputeDevice> EliminationDriver for DeviceDriver<D> {
    fn name(&self) -> &str {
        "device"
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
        let (factors, a22) = self.factor(front, layout, opts, stats)?;
        front.a22 = a22;
        front.release();
        log::info!(
            "device driver ({}): n = {}, n2 = {}, memory = {} bytes, max rank = {}",
            self.device.name(),
            factors.b11.rows(),
            factors.b12.cols(),
            factors.memory(),
            factors.maximum_rank()
        );
        Ok(factors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, GemmDescriptor, HostDevice};

    #[test]
    fn test_footprint_of_dense_layout() {
        let layout = TileLayout::uniform(8, 4, 4, 4)
            .with_admissibility(crate::matrix::Admissibility::none(2));
        // Tiles of 4 are below the default minimum size: nothing can be compressed.
        let fp = Footprint::of(&layout, &BlrOptions::default());
        assert_eq!(fp.tiles, 64 + 2 * 32 + 16);
        assert_eq!(fp.scratch, 0);
        assert_eq!(fp.workspace, 0);
        assert_eq!(fp.indices, 9);
    }

    #[test]
    fn test_footprint_grows_with_compressible_tiles() {
        let layout = TileLayout::uniform(64, 32, 32, 32);
        let fp = Footprint::of(&layout, &BlrOptions::default());
        // 32 x 32 tiles: k = 32, scratch = 32 + 2 * 32 * 32
        assert_eq!(fp.scratch, 32 + 2048);
        assert!(fp.workspace > 0);
    }

    #[test]
    fn test_buffers_are_released_after_factorization() -> Result<(), BlrError> {
        let f = Mat::from_fn(6, 6, |i, j| if i == j { 10.0 } else { 1.0 / (1 + i + j) as f64 });
        let mut front = Front::split(f.as_ref(), 4)?;
        let driver = DeviceDriver::new(HostDevice::new());
        driver.partial_factor(&mut front, &TileLayout::uniform(4, 2, 2, 1), &BlrOptions::default(), &FactorStats::new())?;
        assert_eq!(driver.device().live_buffers(), 0);
        assert_eq!(driver.device().used(), 0);
        Ok(())
    }

    #[test]
    fn test_exhausted_device_fails_before_touching_the_front() {
        let f = Mat::from_fn(40, 40, |i, j| if i == j { 10.0 } else { 0.1 });
        let mut front = Front::split(f.as_ref(), 32).unwrap();
        let before = front.clone();
        let driver = DeviceDriver::new(HostDevice::with_capacity(100));
        let err = driver
            .partial_factor(&mut front, &TileLayout::uniform(32, 16, 8, 8), &BlrOptions::default(), &FactorStats::new())
            .unwrap_err();
        assert!(matches!(err.kind(), BlrErrorKind::DeviceResourceExhausted { .. }));
        assert_eq!(front.a11, before.a11);
        assert!(!front.is_released());
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Event {
        Allocate(BufferId),
        Download(BufferId),
        Batched,
    }

    /// A [`HostDevice`] that records allocations, downloads and batched calls.
    struct TracingDevice {
        inner: HostDevice,
        events: parking_lot::Mutex<Vec<Event>>,
    }

    impl TracingDevice {
        fn new() -> Self {
            Self {
                inner: HostDevice::new(),
                events: parking_lot::Mutex::new(Vec::new()),
            }
        }

        fn record(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    impl ComputeDevice for TracingDevice {
        fn name(&self) -> &str {
            "tracing"
        }
        fn create_stream(&self) -> Result<Stream, DeviceError> {
            self.inner.create_stream()
        }
        fn allocate(&self, len: usize) -> Result<BufferId, DeviceError> {
            let id = self.inner.allocate(len)?;
            self.record(Event::Allocate(id));
            Ok(id)
        }
        fn allocate_indices(&self, len: usize) -> Result<BufferId, DeviceError> {
            self.inner.allocate_indices(len)
        }
        fn free(&self, buffer: BufferId) -> Result<(), DeviceError> {
            self.inner.free(buffer)
        }
        fn upload(&self, stream: Stream, src: MatRef<'_, f64>, dst: DeviceMat) -> Result<(), DeviceError> {
            self.inner.upload(stream, src, dst)
        }
        fn download(&self, stream: Stream, src: DeviceMat, dst: MatMut<'_, f64>) -> Result<(), DeviceError> {
            self.record(Event::Download(src.buffer));
            self.inner.download(stream, src, dst)
        }
        fn download_indices(&self, stream: Stream, src: DeviceIndices, dst: &mut [usize]) -> Result<(), DeviceError> {
            self.inner.download_indices(stream, src, dst)
        }
        fn copy(&self, stream: Stream, src: DeviceMat, dst: DeviceMat) -> Result<(), DeviceError> {
            self.inner.copy(stream, src, dst)
        }
        fn synchronize(&self, stream: Stream) -> Result<(), DeviceError> {
            self.inner.synchronize(stream)
        }
        fn getrf(&self, stream: Stream, a: DeviceMat, piv: DeviceIndices, info: DeviceIndices) -> Result<(), DeviceError> {
            self.inner.getrf(stream, a, piv, info)
        }
        fn laswp(&self, stream: Stream, a: DeviceMat, piv: DeviceIndices) -> Result<(), DeviceError> {
            self.inner.laswp(stream, a, piv)
        }
        fn trsm(
            &self,
            stream: Stream,
            side: Side,
            triangle: Triangle,
            trans: Trans,
            diag: Diag,
            alpha: f64,
            t: DeviceMat,
            b: DeviceMat,
        ) -> Result<(), DeviceError> {
            self.inner.trsm(stream, side, triangle, trans, diag, alpha, t, b)
        }
        fn gesvd(&self, stream: Stream, a: DeviceMat, s: DeviceMat, u: DeviceMat, vt: DeviceMat) -> Result<(), DeviceError> {
            self.inner.gesvd(stream, a, s, u, vt)
        }
        fn scale_rows(&self, stream: Stream, a: DeviceMat, d: DeviceMat) -> Result<(), DeviceError> {
            self.inner.scale_rows(stream, a, d)
        }
        fn gemm(&self, stream: Stream, alpha: f64, a: DeviceMat, b: DeviceMat, beta: f64, c: DeviceMat) -> Result<(), DeviceError> {
            self.inner.gemm(stream, alpha, a, b, beta, c)
        }
        fn gemm_batched(&self, stream: Stream, alpha: f64, beta: f64, batch: &[GemmDescriptor]) -> Result<(), DeviceError> {
            self.record(Event::Batched);
            self.inner.gemm_batched(stream, alpha, beta, batch)
        }
    }

    #[test]
    fn test_tiles_are_copied_back_once_after_all_updates() -> Result<(), BlrError> {
        let f = Mat::from_fn(40, 40, |i, j| if i == j { 10.0 } else { 1.0 / (1 + i + j) as f64 });
        let layout = TileLayout::uniform(32, 8, 8, 4);
        let opts = BlrOptions::default().with_min_tile_size(usize::MAX);

        let mut front = Front::split(f.as_ref(), 32)?;
        let driver = DeviceDriver::new(TracingDevice::new());
        let factors = driver.partial_factor(&mut front, &layout, &opts, &FactorStats::new())?;

        let events = driver.device().events.lock().clone();
        // The tile slab is the first allocation.
        let Some(Event::Allocate(slab)) = events.first().copied() else {
            panic!("first event is not an allocation: {events:?}");
        };
        let last_batch = events
            .iter()
            .rposition(|e| *e == Event::Batched)
            .expect("no batched call was issued");
        let downloads: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == Event::Download(slab))
            .map(|(idx, _)| idx)
            .collect();
        // 4 x 4 tiles of B11, 4 x 2 of B12 and B21, 2 x 2 of A22, all dense.
        assert_eq!(downloads.len(), 16 + 8 + 8 + 4);
        assert!(downloads.iter().all(|&idx| idx > last_batch), "a tile was read back mid-elimination");

        let mut reference = Front::split(f.as_ref(), 32)?;
        let expected = DeviceDriver::new(HostDevice::new()).partial_factor(&mut reference, &layout, &opts, &FactorStats::new())?;
        assert_eq!(factors.piv, expected.piv);
        assert_eq!(front.a22, reference.a22);
        Ok(())
    }
}
