// rust/reshard-core/src/config.rs

//! Configuration management for the resharding engine.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ReshardError, Result};
use crate::tensor::DType;

// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshardConfig {
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
    pub load: LoadConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path that relative checkpoint paths resolve against.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to memory-map large checkpoint files.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

// Checkpoint file options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (algorithm-specific).
    pub compression_level: i32,
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
    // Reuse directory listings across loads until invalidated.
    pub cache_listings: bool,
}

// How files are split among the ranks that can read them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAssignment {
    // Exclusive files first, then least-loaded greedy, then cross-node remainder.
    #[default]
    Balanced,
    // Every visible file, rarest first, to the least-loaded rank that sees it.
    Visibility,
}

// Load-time planning and transfer options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    // Rank that writes shared files such as checkpoint metadata.
    pub coordinator_rank: u32,
    // Minimum transfer buffer capacity, in elements.
    pub transfer_buffer_floor: u64,
    // Element type packed through the transfer buffer.
    pub packed_dtype: DType,
    // Pack consecutive same-source transfers into one broadcast.
    pub pack_transfers: bool,
    // Keep source tensors on the host while loading.
    pub offload: bool,
    // Resolve `master_weights` / `_fp32_master_0` name variants.
    pub master_weight_compat: bool,
    pub file_assignment: FileAssignment,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            compression: "lz4".to_string(),
            compression_level: 1,
            atomic_writes: true,
            cache_listings: true,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            coordinator_rank: 0,
            transfer_buffer_floor: 256 * 1024 * 1024,
            packed_dtype: DType::BF16,
            pack_transfers: true,
            offload: false,
            master_weight_compat: true,
            file_assignment: FileAssignment::Balanced,
        }
    }
}

impl FromStr for ReshardConfig {
    type Err = ReshardError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ReshardError::config_with_source("failed to parse TOML config", e))
    }
}

impl ReshardConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReshardError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `RESHARD_` followed by section and field:
    // - `RESHARD_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `RESHARD_CHECKPOINT_COMPRESSION` overrides `checkpoint.compression`
    // - `RESHARD_LOAD_PACKED_DTYPE` overrides `load.packed_dtype`
    // - `RESHARD_LOAD_FILE_ASSIGNMENT` overrides `load.file_assignment`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("RESHARD_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RESHARD_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("RESHARD_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        if let Ok(val) = std::env::var("RESHARD_CHECKPOINT_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.checkpoint.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_CHECKPOINT_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.checkpoint.atomic_writes = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_CHECKPOINT_CACHE_LISTINGS") {
            if let Ok(v) = val.parse() {
                self.checkpoint.cache_listings = v;
            }
        }

        // Load overrides
        if let Ok(val) = std::env::var("RESHARD_LOAD_COORDINATOR_RANK") {
            if let Ok(v) = val.parse() {
                self.load.coordinator_rank = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_LOAD_TRANSFER_BUFFER_FLOOR") {
            if let Ok(v) = val.parse() {
                self.load.transfer_buffer_floor = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_LOAD_PACKED_DTYPE") {
            if let Ok(v) = val.parse() {
                self.load.packed_dtype = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_LOAD_PACK_TRANSFERS") {
            if let Ok(v) = val.parse() {
                self.load.pack_transfers = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_LOAD_OFFLOAD") {
            if let Ok(v) = val.parse() {
                self.load.offload = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_LOAD_MASTER_WEIGHT_COMPAT") {
            if let Ok(v) = val.parse() {
                self.load.master_weight_compat = v;
            }
        }
        if let Ok(val) = std::env::var("RESHARD_LOAD_FILE_ASSIGNMENT") {
            match val.to_lowercase().as_str() {
                "balanced" => self.load.file_assignment = FileAssignment::Balanced,
                "visibility" => self.load.file_assignment = FileAssignment::Visibility,
                _ => {} // ignore invalid values
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(ReshardError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(ReshardError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }

        if self.load.transfer_buffer_floor == 0 {
            return Err(ReshardError::config(
                "load.transfer_buffer_floor must be greater than 0",
            ));
        }

        Ok(())
    }
}
