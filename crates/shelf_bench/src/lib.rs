//! Benchmark utilities for Shelf.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
