//! Common utilities for test problems, data files and performance measurement.
//!
//! This module provides helper functions used across the experimental binaries.
//! It is organized into three submodules:
//!
//! - **`data_loader`**: Reads and writes dense matrices in the MatrixMarket `array`
//!   format.
//!
//! - **`perf`**: Contains platform-specific utilities for performance analysis.
//!   It reads the peak resident set size (RSS) of the current process
//!   on Linux, for the memory columns of the scalability runner.
//!
//! - **`problems`**: Generates synthetic frontal matrices from kernel functions.
//!

pub mod data_loader;
pub mod perf;
pub mod problems;
