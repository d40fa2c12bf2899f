//! # Shelf Testkit
//!
//! Test utilities for Shelf.
//!
//! This crate provides:
//! - Test fixtures and shelf helpers on the in-memory engine
//! - Property-based test generators using proptest
//! - A model-checking integration harness
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shelf_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_people() {
//!     let test_shelf = TestShelf::people().await;
//!     let db = test_shelf.db(None);
//!     db.add("people", &Person::new("Ada", "ada@example.com")).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
