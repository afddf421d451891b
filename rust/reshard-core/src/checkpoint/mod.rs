// rust/reshard-core/src/checkpoint/mod.rs

//! Checkpoint files: container format, reading, writing and discovery.
//!
//! # Format
//!
//! ```text
//! +------------------------+
//! | Header Length (4 bytes)|  <- u32 little-endian
//! +------------------------+
//! | Header (bincode)       |  <- ContainerHeader (entries, checksum)
//! +------------------------+
//! | Compressed Payload     |  <- none, lz4 or zstd
//! +------------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use reshard_core::checkpoint::{CheckpointReader, CheckpointWriter};
//! use reshard_core::config::{CheckpointConfig, StorageConfig};
//! use reshard_core::shard::Metadata;
//! use reshard_core::storage::LocalStorage;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LocalStorage::new(&StorageConfig::default()).unwrap());
//! let writer = CheckpointWriter::new(storage.clone(), CheckpointConfig::default());
//! writer.write_metadata(Path::new("ckpt/0.metadata"), &Metadata::new()).unwrap();
//!
//! let reader = CheckpointReader::new(storage);
//! let metadata = reader.read_metadata(Path::new("ckpt/0.metadata")).unwrap();
//! assert!(metadata.state_dict_metadata.is_empty());
//! ```

mod files;
mod format;
mod reader;
mod writer;

pub use files::{
    data_file_name, max_unique_id, metadata_file_name, parse_data_file_name, select_files,
    synthesize_metadata, CheckpointFileCache, CheckpointFiles, AUTO_METADATA_FILE, DATA_SUFFIX,
    METADATA_SUFFIX, UNINDEXED_SUFFIX,
};
pub use format::{ContainerHeader, PayloadKind, TensorEntry};
pub use reader::CheckpointReader;
pub use writer::CheckpointWriter;
