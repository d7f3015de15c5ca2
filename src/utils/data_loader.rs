//! This module provides utilities for reading and writing dense matrices in the
//! MatrixMarket exchange format.
//!
//! Only the dense `array real general` flavor is supported, which is what the `datagen`
//! binary writes and the experiment binaries read. Entries are stored column by column.

use faer::Mat;
use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
};
use thiserror::Error;

const BANNER: &str = "%%MatrixMarket matrix array real general";

/// Represents all possible errors that can occur during data loading and parsing.
#[derive(Error, Debug)]
pub enum DataLoaderError {
    /// Wraps a standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Occurs when a string cannot be parsed into an integer.
    #[error("Parse error: Failed to parse integer from '{0}'")]
    ParseInt(String),
    /// Occurs when a string cannot be parsed into a float.
    #[error("Parse error: Failed to parse float from '{0}'")]
    ParseFloat(String),
    /// Occurs if the banner is missing or names an unsupported format.
    #[error("Format error: expected a '%%MatrixMarket matrix array real general' banner, found '{0}'.")]
    UnsupportedFormat(String),
    /// Occurs if the size line is missing or malformed.
    #[error("Format error: The size line was not found or was malformed.")]
    SizeLineMissing,
    /// Occurs when the end of a file is reached unexpectedly during parsing.
    #[error("Format error: Unexpected end of file after {read} of {expected} entries.")]
    UnexpectedEof { read: usize, expected: usize },
}

/// Reads a dense matrix from a MatrixMarket `array real general` file.
///
/// # Arguments
/// * `path`: The path to the `.mtx` file.
pub fn read_matrix_market(path: impl AsRef<Path>) -> Result<Mat<f64>, DataLoaderError> {
    let file = File::open(path)?;
    parse_matrix_market(BufReader::new(file))
}

/// Parses a dense MatrixMarket matrix from any buffered reader.
pub fn parse_matrix_market(reader: impl BufRead) -> Result<Mat<f64>, DataLoaderError> {
    let mut lines = reader.lines();

    let banner = lines
        .next()
        .ok_or(DataLoaderError::UnsupportedFormat(String::new()))??;
    let normalized = banner.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.eq_ignore_ascii_case(BANNER) {
        return Err(DataLoaderError::UnsupportedFormat(banner));
    }

    // Skip comments up to the size line.
    let mut size_line = None;
    for line in lines.by_ref() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        size_line = Some(line);
        break;
    }
    let size_line = size_line.ok_or(DataLoaderError::SizeLineMissing)?;
    let parts: Vec<&str> = size_line.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(DataLoaderError::SizeLineMissing);
    }
    let rows = parts[0]
        .parse::<usize>()
        .map_err(|_| DataLoaderError::ParseInt(parts[0].to_string()))?;
    let cols = parts[1]
        .parse::<usize>()
        .map_err(|_| DataLoaderError::ParseInt(parts[1].to_string()))?;

    let expected = rows * cols;
    let mut values = Vec::with_capacity(expected);
    for line in lines {
        let line = line?;
        for token in line.split_whitespace() {
            if token.starts_with('%') {
                break;
            }
            let v = token
                .parse::<f64>()
                .map_err(|_| DataLoaderError::ParseFloat(token.to_string()))?;
            values.push(v);
        }
        if values.len() >= expected {
            break;
        }
    }
    if values.len() < expected {
        return Err(DataLoaderError::UnexpectedEof {
            read: values.len(),
            expected,
        });
    }

    Ok(Mat::from_fn(rows, cols, |i, j| values[i + j * rows]))
}

/// Writes a dense matrix as a MatrixMarket `array real general` file.
pub fn write_matrix_market(path: impl AsRef<Path>, a: faer::MatRef<'_, f64>) -> Result<(), DataLoaderError> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    format_matrix_market(&mut out, a)?;
    out.flush()?;
    Ok(())
}

/// Formats a dense matrix in MatrixMarket `array` form into any writer.
pub fn format_matrix_market(out: &mut impl Write, a: faer::MatRef<'_, f64>) -> io::Result<()> {
    writeln!(out, "{BANNER}")?;
    writeln!(out, "{} {}", a.nrows(), a.ncols())?;
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            // Shortest representation that parses back to the same value.
            writeln!(out, "{:?}", a[(i, j)])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_parse_preserves_values() {
        let a = Mat::from_fn(3, 2, |i, j| (i as f64 + 1.0) / (j as f64 + 3.0));
        let mut buf = Vec::new();
        format_matrix_market(&mut buf, a.as_ref()).unwrap();
        let b = parse_matrix_market(buf.as_slice()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_skips_comments() {
        let text = "%%MatrixMarket matrix array real general\n% a comment\n\n2 2\n1.0\n2.0\n3.0 4.0\n";
        let a = parse_matrix_market(text.as_bytes()).unwrap();
        assert_eq!(a[(1, 0)], 2.0);
        assert_eq!(a[(0, 1)], 3.0);
        assert_eq!(a[(1, 1)], 4.0);
    }

    #[test]
    fn test_parse_rejects_coordinate_format() {
        let text = "%%MatrixMarket matrix coordinate real general\n2 2 1\n1 1 1.0\n";
        let err = parse_matrix_market(text.as_bytes()).unwrap_err();
        assert!(matches!(err, DataLoaderError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_parse_reports_truncated_data() {
        let text = "%%MatrixMarket matrix array real general\n2 2\n1.0\n2.0\n";
        let err = parse_matrix_market(text.as_bytes()).unwrap_err();
        assert!(matches!(err, DataLoaderError::UnexpectedEof { read: 2, expected: 4 }));
    }
}
