//! The device compute backend seam.
//!
//! The accelerator driver never touches device memory directly. It talks to a
//! [`ComputeDevice`], which owns device buffers, runs kernels on them and moves data
//! between host and device. Everything is explicit: buffers are allocated and freed by
//! the driver, copies are requested one by one, and host code only reasons about device
//! data (a pivot, a rank, a singular value) after a [`ComputeDevice::synchronize`].
//!
//! Device memory is addressed through plain handles:
//!
//! - [`BufferId`]: one allocation of `f64` or index storage.
//! - [`DeviceMat`]: a column-major view into a scalar buffer (`offset`, shape, leading
//!   dimension), the analogue of a pointer plus `ld` in BLAS.
//! - [`DeviceIndices`]: a slice of an index buffer, used for pivots and status codes.
//!
//! Kernels follow the BLAS/LAPACK conventions of [`crate::kernels`], including the forward
//! pivot convention. [`HostDevice`] is an in-process implementation of the trait that
//! runs on the host and serves as the reference backend.

mod host;

pub use host::HostDevice;

use crate::kernels::{Diag, Side, Trans, Triangle};
use thiserror::Error;

/// Errors reported by device backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// An allocation does not fit in the remaining device memory.
    #[error("out of device memory: requested {requested} elements, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// A handle does not refer to a live buffer of the expected kind.
    #[error("invalid or freed device buffer {0}")]
    InvalidBuffer(usize),

    /// A view reaches past the end of its buffer.
    #[error("device view out of bounds: needs {needed} elements, buffer has {len}")]
    OutOfBounds { needed: usize, len: usize },

    /// A kernel rejected its arguments or failed.
    #[error("device kernel failure: {0}")]
    Kernel(String),
}

/// Handle to one device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

/// Handle to an execution queue. Work on one stream executes in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream(pub usize);

/// Column-major matrix view into a scalar device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMat {
    pub buffer: BufferId,
    pub offset: usize,
    pub rows: usize,
    pub cols: usize,
    pub ld: usize,
}

impl DeviceMat {
    /// A contiguous view with leading dimension equal to `rows`.
    pub fn new(buffer: BufferId, offset: usize, rows: usize, cols: usize) -> Self {
        Self {
            buffer,
            offset,
            rows,
            cols,
            ld: rows.max(1),
        }
    }

    /// A view with an explicit leading dimension.
    pub fn with_ld(buffer: BufferId, offset: usize, rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            buffer,
            offset,
            rows,
            cols,
            ld,
        }
    }

    /// Sub-view starting at (`row`, `col`).
    pub fn submatrix(&self, row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self {
            buffer: self.buffer,
            offset: self.offset + row + col * self.ld,
            rows,
            cols,
            ld: self.ld,
        }
    }

    /// Number of scalars stored.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// One past the last buffer element the view touches.
    pub fn end(&self) -> usize {
        if self.is_empty() {
            self.offset
        } else {
            self.offset + (self.cols - 1) * self.ld + self.rows
        }
    }
}

/// Slice of an index device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIndices {
    pub buffer: BufferId,
    pub offset: usize,
    pub len: usize,
}

/// One product of a batched multiply: `c = beta * c + alpha * a * b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDescriptor {
    pub a: DeviceMat,
    pub b: DeviceMat,
    pub c: DeviceMat,
}

/// Operations the accelerator driver needs from a device.
///
/// All operations taking a [`Stream`] may complete asynchronously; results are only
/// guaranteed to be visible on the host after [`ComputeDevice::synchronize`] on that
/// stream.
pub trait ComputeDevice: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Creates a new stream.
    fn create_stream(&self) -> Result<Stream, DeviceError>;

    /// Allocates a zero-initialized buffer of `len` scalars.
    fn allocate(&self, len: usize) -> Result<BufferId, DeviceError>;

    /// Allocates a zero-initialized buffer of `len` indices.
    fn allocate_indices(&self, len: usize) -> Result<BufferId, DeviceError>;

    /// Releases a buffer.
    fn free(&self, buffer: BufferId) -> Result<(), DeviceError>;

    /// Copies a host matrix into a device view of the same shape.
    fn upload(&self, stream: Stream, src: faer::MatRef<'_, f64>, dst: DeviceMat) -> Result<(), DeviceError>;

    /// Copies a device view into a host matrix of the same shape.
    fn download(&self, stream: Stream, src: DeviceMat, dst: faer::MatMut<'_, f64>) -> Result<(), DeviceError>;

    /// Copies device indices into a host slice of the same length.
    fn download_indices(&self, stream: Stream, src: DeviceIndices, dst: &mut [usize]) -> Result<(), DeviceError>;

    /// Device-to-device copy between views of the same shape.
    fn copy(&self, stream: Stream, src: DeviceMat, dst: DeviceMat) -> Result<(), DeviceError>;

    /// Waits until all work submitted to `stream` has completed.
    fn synchronize(&self, stream: Stream) -> Result<(), DeviceError>;

    /// Pivoted LU of a square view, in place. Writes the forward pivot into `piv` and a
    /// status into `info[0]`: `0` on success, `k + 1` if the `k`-th pivot is unusable.
    fn getrf(&self, stream: Stream, a: DeviceMat, piv: DeviceIndices, info: DeviceIndices) -> Result<(), DeviceError>;

    /// Applies a forward row permutation to a view.
    fn laswp(&self, stream: Stream, a: DeviceMat, piv: DeviceIndices) -> Result<(), DeviceError>;

    /// In-place triangular solve, see [`crate::kernels::trsm`].
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), DeviceError>;

    /// Thin SVD: `a = u * diag(s) * vt` with `s` a `k x 1` view, `k = min(m, n)`.
    fn gesvd(&self, stream: Stream, a: DeviceMat, s: DeviceMat, u: DeviceMat, vt: DeviceMat) -> Result<(), DeviceError>;

    /// Multiplies row `i` of `a` by `d[i]`, where `d` is a column view.
    fn scale_rows(&self, stream: Stream, a: DeviceMat, d: DeviceMat) -> Result<(), DeviceError>;

    /// `c = beta * c + alpha * a * b`, with `beta` either `0` or `1`.
    fn gemm(&self, stream: Stream, alpha: f64, a: DeviceMat, b: DeviceMat, beta: f64, c: DeviceMat) -> Result<(), DeviceError>;

    /// Runs every product of `batch` with common `alpha` and `beta` as one call. Targets
    /// must not overlap.
    fn gemm_batched(&self, stream: Stream, alpha: f64, beta: f64, batch: &[GemmDescriptor]) -> Result<(), DeviceError>;
}

/// A buffer freed when dropped.
pub struct DeviceBuffer<'d, D: ComputeDevice + ?Sized> {
    device: &'d D,
    id: BufferId,
    len: usize,
}

impl<'d, D: ComputeDevice + ?Sized> DeviceBuffer<'d, D> {
    /// Allocates `len` scalars.
    pub fn scalars(device: &'d D, len: usize) -> Result<Self, DeviceError> {
        let id = device.allocate(len)?;
        Ok(Self { device, id, len })
    }

    /// Allocates `len` indices.
    pub fn indices(device: &'d D, len: usize) -> Result<Self, DeviceError> {
        let id = device.allocate_indices(len)?;
        Ok(Self { device, id, len })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A contiguous view at `offset`.
    pub fn mat(&self, offset: usize, rows: usize, cols: usize) -> DeviceMat {
        DeviceMat::new(self.id, offset, rows, cols)
    }

    /// An index slice at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> DeviceIndices {
        DeviceIndices {
            buffer: self.id,
            offset,
            len,
        }
    }
}

impl<D: ComputeDevice + ?Sized> Drop for DeviceBuffer<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.free(self.id) {
            log::warn!("Failed to free device buffer {:?}: {e}", self.id);
        }
    }
}
