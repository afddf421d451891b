// rust/reshard-core/src/checkpoint/format.rs

//! Checkpoint container format.
//!
//! Both tensor data files and metadata files use the same container:
//! ```text
//! +------------------------+
//! | Header Length (4 bytes)|  <- u32 little-endian
//! +------------------------+
//! | Header (bincode)       |  <- ContainerHeader
//! +------------------------+
//! | Payload                |  <- compressed per header
//! +------------------------+
//! ```
//!
//! For data files the uncompressed payload is the concatenation of every
//! stored tensor's bytes; `entries` says where each one starts. Metadata
//! files carry a bincode-encoded [`Metadata`](crate::shard::Metadata) and no
//! entries.

use serde::{Deserialize, Serialize};
use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::error::{ReshardError, Result};
use crate::shard::LocalTensorIndex;
use crate::tensor::DType;

/// What a container's payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Tensors,
    Metadata,
}

/// Location of one tensor inside a data file's uncompressed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub index: LocalTensorIndex,
    pub dtype: DType,
    pub shape: Vec<u64>,
    /// Byte offset into the uncompressed payload.
    pub offset: u64,
    pub nbytes: u64,
    /// xxHash64 of this entry's bytes.
    pub checksum: u64,
}

/// Header for a checkpoint container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHeader {
    /// Magic bytes identifying a checkpoint container ("DRSC")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    pub kind: PayloadKind,
    /// Compression algorithm used ("none", "lz4", or "zstd")
    pub compression: String,
    /// Size of the payload before compression
    pub uncompressed_size: u64,
    /// XXHash64 checksum of the uncompressed payload
    pub checksum: u64,
    pub entries: Vec<TensorEntry>,
}

impl ContainerHeader {
    pub const MAGIC: [u8; 4] = *b"DRSC";

    pub const VERSION: u32 = 1;

    pub fn new(
        kind: PayloadKind,
        compression: impl Into<String>,
        uncompressed_size: u64,
        checksum: u64,
        entries: Vec<TensorEntry>,
    ) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            kind,
            compression: compression.into(),
            uncompressed_size,
            checksum,
            entries,
        }
    }

    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }

    /// Checks magic, version and payload kind.
    pub fn validate(&self, expected: PayloadKind) -> Result<()> {
        if !self.validate_magic() {
            return Err(ReshardError::checkpoint(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                Self::MAGIC,
                self.magic
            )));
        }
        if !self.validate_version() {
            return Err(ReshardError::checkpoint(format!(
                "unsupported version: expected {}, got {}",
                Self::VERSION,
                self.version
            )));
        }
        if self.kind != expected {
            return Err(ReshardError::checkpoint(format!(
                "expected a {expected:?} container, found {:?}",
                self.kind
            )));
        }
        Ok(())
    }
}

/// XXHash64 (seed 0) of `data`.
pub fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Compresses `data` with the named algorithm.
pub fn compress(data: &[u8], compression: &str, level: i32) -> Result<Vec<u8>> {
    match compression {
        "none" => Ok(data.to_vec()),
        "lz4" => Ok(lz4_flex::compress_prepend_size(data)),
        "zstd" => zstd::encode_all(data, level)
            .map_err(|e| ReshardError::checkpoint_with_source("zstd compression failed", e)),
        _ => Err(ReshardError::checkpoint(format!(
            "unknown compression algorithm: {compression}"
        ))),
    }
}

pub fn decompress(data: &[u8], compression: &str) -> Result<Vec<u8>> {
    match compression {
        "none" => Ok(data.to_vec()),
        "lz4" => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReshardError::checkpoint_with_source("lz4 decompression failed", e)),
        "zstd" => zstd::decode_all(data)
            .map_err(|e| ReshardError::checkpoint_with_source("zstd decompression failed", e)),
        _ => Err(ReshardError::checkpoint(format!(
            "unknown compression algorithm: {compression}"
        ))),
    }
}
