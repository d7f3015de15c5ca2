//! Compression options for the BLR factorization.
//!
//! [`BlrOptions`] carries the two knobs the compression policy reads: a truncation
//! tolerance and a minimum tile size below which compression is not attempted. The options are plain data (serializable so experiment runners can
//! record them next to their results) and are validated once at the entry of a
//! factorization.

use crate::error::{BlrError, BlrErrorKind};
use serde::{Deserialize, Serialize};

/// Options controlling low-rank compression of admissible tiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlrOptions {
    /// Truncation tolerance, compared with the raw singular values of a tile.
    pub rel_tol: f64,
    /// Tiles with fewer rows or columns than this are never compressed.
    pub min_tile_size: usize,
}

impl Default for BlrOptions {
    fn default() -> Self {
        Self {
            rel_tol: 1e-4,
            min_tile_size: 16,
        }
    }
}

impl BlrOptions {
    /// Sets the relative tolerance.
    pub fn with_rel_tol(mut self, rel_tol: f64) -> Self {
        self.rel_tol = rel_tol;
        self
    }

    /// Sets the minimum tile size considered for compression.
    pub fn with_min_tile_size(mut self, min_tile_size: usize) -> Self {
        self.min_tile_size = min_tile_size;
        self
    }

    /// The threshold applied to the singular values of a tile.
    ///
    /// Singular values are compared against `rel_tol` directly, without scaling by the
    /// largest singular value.
    pub fn threshold(&self) -> f64 {
        self.rel_tol
    }

    /// Whether a tile of the given shape is large enough to be compressed.
    pub fn allows_compression(&self, rows: usize, cols: usize) -> bool {
        rows >= self.min_tile_size && cols >= self.min_tile_size
    }

    /// Checks that the tolerance is finite and non-negative.
    pub fn validate(&self) -> Result<(), BlrError> {
        if !self.rel_tol.is_finite() || self.rel_tol < 0.0 {
            return Err(BlrErrorKind::InvalidOption(format!(
                "`rel_tol` must be finite and non-negative, got {}",
                self.rel_tol
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_raw_rel_tol() {
        assert_eq!(BlrOptions::default().threshold(), 1e-4);
        // Tolerances far below machine precision are not floored.
        let opts = BlrOptions::default().with_rel_tol(1e-30);
        assert_eq!(opts.threshold(), 1e-30);
        assert_eq!(BlrOptions::default().with_rel_tol(0.0).threshold(), 0.0);
    }

    #[test]
    fn test_size_guard() {
        let opts = BlrOptions::default().with_min_tile_size(8);
        assert!(opts.allows_compression(8, 8));
        assert!(!opts.allows_compression(7, 64));
        assert!(!opts.allows_compression(64, 1));
    }

    #[test]
    fn test_validate_rejects_bad_tolerances() {
        assert!(BlrOptions::default().validate().is_ok());
        let err = BlrOptions::default()
            .with_rel_tol(f64::NAN)
            .validate()
            .unwrap_err();
        assert!(matches!(err.kind(), BlrErrorKind::InvalidOption(_)));
        assert!(BlrOptions::default().with_rel_tol(-1.0).validate().is_err());
    }
}
