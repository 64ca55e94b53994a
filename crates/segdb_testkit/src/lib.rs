//! # segdb Testkit
//!
//! Test utilities for segdb.
//!
//! This crate provides:
//! - Test fixtures for in-memory and on-disk indexes
//! - Property-based test generators using proptest
//! - A model-checking harness comparing an index with a `BTreeMap`
//! - Stress testing utilities
//! - Test log initialisation
//!
//! ## Usage
//!
//! ```rust
//! use segdb_testkit::prelude::*;
//!
//! with_temp_index(small_config(), |index| {
//!     index.put(b"key", b"value").unwrap();
//!     assert_eq!(index.get(b"key").unwrap(), Some(b"value".to_vec()));
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod logging;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::logging::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use logging::*;
pub use stress::*;
