// rust/reshard-core/src/storage/mod.rs

//! Storage abstraction for checkpoint files.
//!
//! # Example
//!
//! ```no_run
//! use reshard_core::config::StorageConfig;
//! use reshard_core::storage::{LocalStorage, StorageBackend};
//! use std::path::Path;
//!
//! let config = StorageConfig::default();
//! let storage = LocalStorage::new(&config).unwrap();
//!
//! storage.write_all(Path::new("ckpt/0.metadata"), b"...", true).unwrap();
//! let bytes = storage.read_all(Path::new("ckpt/0.metadata")).unwrap();
//! assert_eq!(bytes, b"...");
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{StorageBackend, StorageReader, StorageWriter};
