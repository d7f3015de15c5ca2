//! This module defines the error types for the library.
//!
//! Every failure that can abort a partial factorization is reported through a single
//! public error, [`BlrError`], which wraps the enum of distinct failure kinds,
//! [`BlrErrorKind`]. Callers that need to react to a particular condition (for example a
//! singular pivot, which an enclosing sparse solver may want to handle with delayed
//! pivoting) can inspect it through [`BlrError::kind`].
//!
//! Compression that does not pay off is *not* an error: it is an ordinary outcome of the
//! compression policy, see [`crate::compression::Compression`].
//!
//! Device backends report their own [`DeviceError`], which is converted into a
//! [`BlrError`] at the driver boundary.
use crate::device::DeviceError;
use thiserror::Error;

/// Represents all possible errors that can occur during a BLR partial factorization.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct BlrError(#[from] BlrErrorKind);

impl BlrError {
    /// Returns the kind of failure, for callers that need to match on it.
    pub fn kind(&self) -> &BlrErrorKind {
        &self.0
    }
}

/// The distinct kinds of errors.
#[derive(Error, Debug, PartialEq)]
pub enum BlrErrorKind {
    /// A diagonal tile has an exactly zero or non-finite pivot. `row` is the global row of
    /// the pivot block. Tiny nonzero pivots are not reported.
    #[error("Singular pivot: no usable pivot for row {row} of the pivot block.")]
    SingularPivot { row: usize },

    /// Tile sizes do not add up to the matrix dimensions, or the admissibility grid does
    /// not match the number of tile blocks.
    #[error("Inconsistent partition: {0}")]
    InconsistentPartition(String),

    /// Two operands of an operation have incompatible shapes.
    #[error("Dimension mismatch in {what}: expected {expected}, got {actual}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The device could not allocate the working buffers of an elimination.
    #[error(
        "Device resources exhausted: requested {requested} elements, only {available} available."
    )]
    DeviceResourceExhausted { requested: usize, available: usize },

    /// Any other failure reported by a device backend.
    #[error("Device failure: {0}")]
    Device(String),

    /// The singular value decomposition of a tile failed.
    #[error("A numerical error occurred during the decomposition of a tile: {0}")]
    Decomposition(String),

    /// An operation that needs a dense tile was given a compressed one.
    #[error("Unsupported tile representation: {0}")]
    UnsupportedRepresentation(&'static str),

    /// A compression option is out of range.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// The worker pool for the task driver could not be built.
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// The user-provided solver for the Schur complement system failed.
    #[error("Schur complement solver failed: {0}")]
    SchurSolver(String),
}

impl PartialEq for BlrError {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl From<DeviceError> for BlrError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory {
                requested,
                available,
            } => BlrErrorKind::DeviceResourceExhausted {
                requested,
                available,
            }
            .into(),
            other => BlrErrorKind::Device(other.to_string()).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singular_pivot_message() {
        let error = BlrError(BlrErrorKind::SingularPivot { row: 17 });
        assert_eq!(
            error.to_string(),
            "Singular pivot: no usable pivot for row 17 of the pivot block."
        );
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let error = BlrError::from(BlrErrorKind::DimensionMismatch {
            what: "A12 rows",
            expected: 64,
            actual: 63,
        });
        assert_eq!(
            error.to_string(),
            "Dimension mismatch in A12 rows: expected 64, got 63."
        );
    }

    #[test]
    fn test_out_of_memory_maps_to_resource_exhausted() {
        let error = BlrError::from(DeviceError::OutOfMemory {
            requested: 1000,
            available: 10,
        });
        assert_eq!(
            error.kind(),
            &BlrErrorKind::DeviceResourceExhausted {
                requested: 1000,
                available: 10
            }
        );
        assert_eq!(
            error.to_string(),
            "Device resources exhausted: requested 1000 elements, only 10 available."
        );
    }

    #[test]
    fn test_other_device_errors_are_wrapped() {
        let error = BlrError::from(DeviceError::InvalidBuffer(3));
        assert!(matches!(error.kind(), BlrErrorKind::Device(_)));
        assert!(error.to_string().contains("buffer 3"));
    }
}
