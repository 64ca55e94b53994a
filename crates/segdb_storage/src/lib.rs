//! # segdb Storage
//!
//! Directory abstraction for segdb.
//!
//! The index never touches the file system directly. Everything it persists
//! (the key-to-segment map, segment chunk files, the directory lock) goes
//! through a [`Directory`]: a flat namespace of named, opaque byte files.
//!
//! ## Design Principles
//!
//! - Files are written whole and replaced atomically
//! - No knowledge of map, chunk or segment formats
//! - Must be `Send + Sync` for concurrent access
//! - One advisory [`FileLock`] per name guards exclusive ownership
//!
//! ## Available Directories
//!
//! - [`MemDirectory`] - For testing; clones share the same contents
//! - [`FsDirectory`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use segdb_storage::{Directory, MemDirectory};
//!
//! let dir = MemDirectory::new();
//! dir.write_file("index.map", b"hello world").unwrap();
//! assert!(dir.file_exists("index.map"));
//! assert_eq!(dir.read_file("index.map").unwrap(), b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod directory;
mod error;
mod fs;
mod memory;

pub use directory::{Directory, FileLock};
pub use error::{StorageError, StorageResult};
pub use fs::FsDirectory;
pub use memory::MemDirectory;
