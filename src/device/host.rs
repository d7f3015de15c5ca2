//! Host-memory implementation of [`ComputeDevice`].
//!
//! [`HostDevice`] keeps its buffers in process memory and runs every kernel eagerly on
//! the calling thread through [`crate::kernels`], so `synchronize` only validates the
//! stream. An optional capacity (in elements, scalars and indices alike) makes it behave
//! like a device with a fixed amount of memory.
//!
//! Kernels gather their operands into owned matrices before computing and scatter the
//! results afterwards, so overlapping source and destination views are handled like on a
//! device that reads all inputs before writing. The batched multiply gathers every
//! operand of the batch, computes the products in parallel with [`rayon`] and then
//! accumulates them into their targets.

use super::{
    BufferId, ComputeDevice, DeviceError, DeviceIndices, DeviceMat, GemmDescriptor, Stream,
};
use crate::kernels::{self, Diag, Side, Trans, Triangle};
use faer::{Mat, MatMut, MatRef};
use parking_lot::Mutex;
use rayon::prelude::*;

#[derive(Debug)]
enum Slot {
    Scalars(Vec<f64>),
    Indices(Vec<usize>),
}

impl Slot {
    fn len(&self) -> usize {
        match self {
            Slot::Scalars(v) => v.len(),
            Slot::Indices(v) => v.len(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    slots: Vec<Option<Slot>>,
    used: usize,
    streams: usize,
}

impl State {
    fn scalars(&self, id: BufferId) -> Result<&Vec<f64>, DeviceError> {
        match self.slots.get(id.0) {
            Some(Some(Slot::Scalars(v))) => Ok(v),
            _ => Err(DeviceError::InvalidBuffer(id.0)),
        }
    }

    fn scalars_mut(&mut self, id: BufferId) -> Result<&mut Vec<f64>, DeviceError> {
        match self.slots.get_mut(id.0) {
            Some(Some(Slot::Scalars(v))) => Ok(v),
            _ => Err(DeviceError::InvalidBuffer(id.0)),
        }
    }

    fn indices(&self, id: BufferId) -> Result<&Vec<usize>, DeviceError> {
        match self.slots.get(id.0) {
            Some(Some(Slot::Indices(v))) => Ok(v),
            _ => Err(DeviceError::InvalidBuffer(id.0)),
        }
    }

    fn indices_mut(&mut self, id: BufferId) -> Result<&mut Vec<usize>, DeviceError> {
        match self.slots.get_mut(id.0) {
            Some(Some(Slot::Indices(v))) => Ok(v),
            _ => Err(DeviceError::InvalidBuffer(id.0)),
        }
    }

    fn check(&self, m: &DeviceMat) -> Result<(), DeviceError> {
        let len = self.scalars(m.buffer)?.len();
        if m.rows > m.ld && m.cols > 1 || m.end() > len {
            return Err(DeviceError::OutOfBounds {
                needed: m.end(),
                len,
            });
        }
        Ok(())
    }

    /// Copies a view into an owned matrix.
    fn gather(&self, m: &DeviceMat) -> Result<Mat<f64>, DeviceError> {
        self.check(m)?;
        let data = self.scalars(m.buffer)?;
        Ok(Mat::from_fn(m.rows, m.cols, |i, j| data[m.offset + i + j * m.ld]))
    }

    /// Writes an owned matrix into a view of the same shape.
    fn scatter(&mut self, src: MatRef<'_, f64>, m: &DeviceMat) -> Result<(), DeviceError> {
        self.check(m)?;
        if src.nrows() != m.rows || src.ncols() != m.cols {
            return Err(DeviceError::Kernel(format!(
                "shape mismatch: {}x{} into {}x{}",
                src.nrows(),
                src.ncols(),
                m.rows,
                m.cols
            )));
        }
        let data = self.scalars_mut(m.buffer)?;
        for j in 0..m.cols {
            for i in 0..m.rows {
                data[m.offset + i + j * m.ld] = src[(i, j)];
            }
        }
        Ok(())
    }

    fn index_slice(&self, s: &DeviceIndices) -> Result<&[usize], DeviceError> {
        let data = self.indices(s.buffer)?;
        data.get(s.offset..s.offset + s.len)
            .ok_or(DeviceError::OutOfBounds {
                needed: s.offset + s.len,
                len: data.len(),
            })
    }

    fn index_slice_mut(&mut self, s: &DeviceIndices) -> Result<&mut [usize], DeviceError> {
        let data = self.indices_mut(s.buffer)?;
        let len = data.len();
        data.get_mut(s.offset..s.offset + s.len)
            .ok_or(DeviceError::OutOfBounds {
                needed: s.offset + s.len,
                len,
            })
    }
}

/// A [`ComputeDevice`] backed by host memory.
#[derive(Debug, Default)]
pub struct HostDevice {
    capacity: Option<usize>,
    state: Mutex<State>,
}

impl HostDevice {
    /// A device with unlimited memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A device holding at most `capacity` elements at a time.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            state: Mutex::new(State::default()),
        }
    }

    /// Elements currently allocated.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Number of live buffers.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    fn insert(&self, slot: Slot) -> Result<BufferId, DeviceError> {
        let mut state = self.state.lock();
        let len = slot.len();
        if let Some(cap) = self.capacity {
            let available = cap.saturating_sub(state.used);
            if len > available {
                return Err(DeviceError::OutOfMemory {
                    requested: len,
                    available,
                });
            }
        }
        state.used += len;
        let id = match state.slots.iter().position(Option::is_none) {
            Some(free) => {
                state.slots[free] = Some(slot);
                free
            }
            None => {
                state.slots.push(Some(slot));
                state.slots.len() - 1
            }
        };
        Ok(BufferId(id))
    }

    fn check_stream(&self, stream: Stream) -> Result<(), DeviceError> {
        if stream.0 >= self.state.lock().streams {
            return Err(DeviceError::Kernel(format!("unknown stream {}", stream.0)));
        }
        Ok(())
    }
}

impl ComputeDevice for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn create_stream(&self) -> Result<Stream, DeviceError> {
        let mut state = self.state.lock();
        state.streams += 1;
        Ok(Stream(state.streams - 1))
    }

    fn allocate(&self, len: usize) -> Result<BufferId, DeviceError> {
        self.insert(Slot::Scalars(vec![0.0; len]))
    }

    fn allocate_indices(&self, len: usize) -> Result<BufferId, DeviceError> {
        self.insert(Slot::Indices(vec![0; len]))
    }

    fn free(&self, buffer: BufferId) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(buffer.0)
            .and_then(Option::take)
            .ok_or(DeviceError::InvalidBuffer(buffer.0))?;
        state.used -= slot.len();
        Ok(())
    }

    fn upload(&self, stream: Stream, src: MatRef<'_, f64>, dst: DeviceMat) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        self.state.lock().scatter(src, &dst)
    }

    fn download(&self, stream: Stream, src: DeviceMat, mut dst: MatMut<'_, f64>) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        let m = self.state.lock().gather(&src)?;
        if dst.nrows() != m.nrows() || dst.ncols() != m.ncols() {
            return Err(DeviceError::Kernel("download shape mismatch".to_string()));
        }
        dst.copy_from(m.as_ref());
        Ok(())
    }

    fn download_indices(&self, stream: Stream, src: DeviceIndices, dst: &mut [usize]) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        let state = self.state.lock();
        let s = state.index_slice(&src)?;
        if s.len() != dst.len() {
            return Err(DeviceError::Kernel("index download length mismatch".to_string()));
        }
        dst.copy_from_slice(s);
        Ok(())
    }

    fn copy(&self, stream: Stream, src: DeviceMat, dst: DeviceMat) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        let mut state = self.state.lock();
        let m = state.gather(&src)?;
        state.scatter(m.as_ref(), &dst)
    }

    fn synchronize(&self, stream: Stream) -> Result<(), DeviceError> {
        self.check_stream(stream)
    }

    fn getrf(&self, stream: Stream, a: DeviceMat, piv: DeviceIndices, info: DeviceIndices) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        if a.rows != a.cols || piv.len != a.rows || info.len != 1 {
            return Err(DeviceError::Kernel("getrf expects a square view".to_string()));
        }
        let mut state = self.state.lock();
        let mut m = state.gather(&a)?;
        let (perm, singular) = kernels::getrf(m.as_mut());
        state.scatter(m.as_ref(), &a)?;
        state.index_slice_mut(&piv)?.copy_from_slice(&perm);
        state.index_slice_mut(&info)?[0] = singular.map_or(0, |k| k + 1);
        Ok(())
    }

    fn laswp(&self, stream: Stream, a: DeviceMat, piv: DeviceIndices) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        let mut state = self.state.lock();
        let perm = state.index_slice(&piv)?.to_vec();
        if perm.len() != a.rows {
            return Err(DeviceError::Kernel("laswp pivot length mismatch".to_string()));
        }
        let mut m = state.gather(&a)?;
        kernels::permute_rows(m.as_mut(), &perm, true);
        state.scatter(m.as_ref(), &a)
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
        self.check_stream(stream)?;
        let n = match side {
            Side::Left => b.rows,
            Side::Right => b.cols,
        };
        if t.rows != n || t.cols != n {
            return Err(DeviceError::Kernel("trsm shape mismatch".to_string()));
        }
        let mut state = self.state.lock();
        let tm = state.gather(&t)?;
        let mut bm = state.gather(&b)?;
        kernels::trsm(side, triangle, trans, diag, alpha, tm.as_ref(), bm.as_mut());
        state.scatter(bm.as_ref(), &b)
    }

    fn gesvd(&self, stream: Stream, a: DeviceMat, s: DeviceMat, u: DeviceMat, vt: DeviceMat) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        let k = a.rows.min(a.cols);
        if s.rows != k || s.cols != 1 || u.rows != a.rows || u.cols != k || vt.rows != k || vt.cols != a.cols {
            return Err(DeviceError::Kernel("gesvd output shape mismatch".to_string()));
        }
        let mut state = self.state.lock();
        let am = state.gather(&a)?;
        let (um, sv, vtm) = kernels::svd(am.as_ref()).map_err(|e| DeviceError::Kernel(e.to_string()))?;
        let sm = Mat::from_fn(k, 1, |i, _| sv[i]);
        state.scatter(sm.as_ref(), &s)?;
        state.scatter(um.as_ref(), &u)?;
        state.scatter(vtm.as_ref(), &vt)
    }

    fn scale_rows(&self, stream: Stream, a: DeviceMat, d: DeviceMat) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        if d.rows != a.rows || d.cols != 1 {
            return Err(DeviceError::Kernel("scale_rows shape mismatch".to_string()));
        }
        let mut state = self.state.lock();
        let dm = state.gather(&d)?;
        let weights: Vec<f64> = (0..d.rows).map(|i| dm[(i, 0)]).collect();
        let mut am = state.gather(&a)?;
        kernels::scale_rows(am.as_mut(), &weights);
        state.scatter(am.as_ref(), &a)
    }

    fn gemm(&self, stream: Stream, alpha: f64, a: DeviceMat, b: DeviceMat, beta: f64, c: DeviceMat) -> Result<(), DeviceError> {
        self.gemm_batched(stream, alpha, beta, &[GemmDescriptor { a, b, c }])
    }

    fn gemm_batched(&self, stream: Stream, alpha: f64, beta: f64, batch: &[GemmDescriptor]) -> Result<(), DeviceError> {
        self.check_stream(stream)?;
        if beta != 0.0 && beta != 1.0 {
            return Err(DeviceError::Kernel(format!("unsupported beta {beta}")));
        }
        for g in batch {
            if g.a.cols != g.b.rows || g.c.rows != g.a.rows || g.c.cols != g.b.cols {
                return Err(DeviceError::Kernel(format!(
                    "batched gemm shape mismatch: {}x{} * {}x{} into {}x{}",
                    g.a.rows, g.a.cols, g.b.rows, g.b.cols, g.c.rows, g.c.cols
                )));
            }
        }
        let mut state = self.state.lock();
        let operands = batch
            .iter()
            .map(|g| {
                let c = if beta == 0.0 {
                    state.check(&g.c)?;
                    Mat::zeros(g.c.rows, g.c.cols)
                } else {
                    state.gather(&g.c)?
                };
                Ok((state.gather(&g.a)?, state.gather(&g.b)?, c))
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        let results: Vec<Mat<f64>> = operands
            .into_par_iter()
            .map(|(a, b, mut c)| {
                kernels::gemm(alpha, a.as_ref(), b.as_ref(), 1.0, c.as_mut());
                c
            })
            .collect();

        for (g, c) in batch.iter().zip(&results) {
            state.scatter(c.as_ref(), &g.c)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn random(m: usize, n: usize, rng: &mut StdRng) -> Mat<f64> {
        Mat::from_fn(m, n, |_, _| rng.random::<f64>() - 0.5)
    }

    #[test]
    fn test_upload_download_with_leading_dimension() -> Result<(), DeviceError> {
        let dev = HostDevice::new();
        let s = dev.create_stream()?;
        let buf = dev.allocate(40)?;
        let a = Mat::from_fn(3, 4, |i, j| (i + 10 * j) as f64);
        let view = DeviceMat::with_ld(buf, 2, 3, 4, 8);
        dev.upload(s, a.as_ref(), view)?;
        let mut back = Mat::zeros(3, 4);
        dev.download(s, view, back.as_mut())?;
        dev.synchronize(s)?;
        assert_eq!(back, a);

        let mut col = Mat::zeros(2, 1);
        dev.download(s, view.submatrix(1, 2, 2, 1), col.as_mut())?;
        assert_eq!(col[(0, 0)], 21.0);
        assert_eq!(col[(1, 0)], 22.0);
        Ok(())
    }

    #[test]
    fn test_out_of_bounds_and_freed_buffers() -> Result<(), DeviceError> {
        let dev = HostDevice::new();
        let s = dev.create_stream()?;
        let buf = dev.allocate(10)?;
        let a = Mat::<f64>::zeros(4, 3);
        assert!(matches!(
            dev.upload(s, a.as_ref(), DeviceMat::new(buf, 0, 4, 3)),
            Err(DeviceError::OutOfBounds { needed: 12, len: 10 })
        ));
        dev.free(buf)?;
        assert_eq!(dev.used(), 0);
        assert_eq!(dev.free(buf), Err(DeviceError::InvalidBuffer(buf.0)));
        assert!(dev.synchronize(Stream(7)).is_err());
        Ok(())
    }

    #[test]
    fn test_getrf_reports_info() -> Result<(), DeviceError> {
        let dev = HostDevice::new();
        let s = dev.create_stream()?;
        let a = dev.allocate(9)?;
        let idx = dev.allocate_indices(4)?;
        let piv = DeviceIndices { buffer: idx, offset: 0, len: 3 };
        let info = DeviceIndices { buffer: idx, offset: 3, len: 1 };
        dev.getrf(s, DeviceMat::new(a, 0, 3, 3), piv, info)?;
        let mut status = [9];
        dev.download_indices(s, info, &mut status)?;
        assert_eq!(status, [1]);

        let m = Mat::from_fn(3, 3, |i, j| if i == j { 2.0 } else { 0.5 });
        dev.upload(s, m.as_ref(), DeviceMat::new(a, 0, 3, 3))?;
        dev.getrf(s, DeviceMat::new(a, 0, 3, 3), piv, info)?;
        dev.download_indices(s, info, &mut status)?;
        assert_eq!(status, [0]);
        Ok(())
    }

    #[test]
    fn test_batched_gemm_matches_individual_products() -> Result<(), DeviceError> {
        let mut rng = StdRng::seed_from_u64(3);
        let dev = HostDevice::new();
        let s = dev.create_stream()?;
        let shapes = [(3, 4, 5), (6, 2, 1), (1, 7, 3)];
        let mut batch = Vec::new();
        let mut expected = Vec::new();
        for &(m, k, n) in &shapes {
            let (a, b, c) = (random(m, k, &mut rng), random(k, n, &mut rng), random(m, n, &mut rng));
            let ids = (dev.allocate(m * k)?, dev.allocate(k * n)?, dev.allocate(m * n)?);
            let g = GemmDescriptor {
                a: DeviceMat::new(ids.0, 0, m, k),
                b: DeviceMat::new(ids.1, 0, k, n),
                c: DeviceMat::new(ids.2, 0, m, n),
            };
            dev.upload(s, a.as_ref(), g.a)?;
            dev.upload(s, b.as_ref(), g.b)?;
            dev.upload(s, c.as_ref(), g.c)?;
            let mut e = c.clone();
            kernels::gemm(-1.0, a.as_ref(), b.as_ref(), 1.0, e.as_mut());
            expected.push(e);
            batch.push(g);
        }
        dev.gemm_batched(s, -1.0, 1.0, &batch)?;
        dev.synchronize(s)?;
        for (g, e) in batch.iter().zip(&expected) {
            let mut out = Mat::zeros(g.c.rows, g.c.cols);
            dev.download(s, g.c, out.as_mut())?;
            assert!((&out - e).norm_l2() < 1e-14);
        }
        Ok(())
    }

    #[test]
    fn test_gesvd_and_scale_rows() -> Result<(), DeviceError> {
        let mut rng = StdRng::seed_from_u64(4);
        let dev = HostDevice::new();
        let s = dev.create_stream()?;
        let a = random(6, 4, &mut rng);
        let buf = dev.allocate(24 + 4 + 24 + 16 + 24)?;
        let (av, sv, uv, vtv, out) = (
            DeviceMat::new(buf, 0, 6, 4),
            DeviceMat::new(buf, 24, 4, 1),
            DeviceMat::new(buf, 28, 6, 4),
            DeviceMat::new(buf, 52, 4, 4),
            DeviceMat::new(buf, 68, 6, 4),
        );
        dev.upload(s, a.as_ref(), av)?;
        dev.gesvd(s, av, sv, uv, vtv)?;
        dev.scale_rows(s, vtv, sv)?;
        dev.gemm(s, 1.0, uv, vtv, 0.0, out)?;
        let mut back = Mat::zeros(6, 4);
        dev.download(s, out, back.as_mut())?;
        assert!((&back - &a).norm_l2() < 1e-12);
        Ok(())
    }
}
