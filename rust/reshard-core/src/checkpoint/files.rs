// rust/reshard-core/src/checkpoint/files.rs

//! Naming and discovery of checkpoint files.
//!
//! A checkpoint directory holds, per save id, one data file per writing rank
//! (`{rank}_{id}.distcp`) and one metadata file (`{id}.metadata`). A directory
//! of `*.tensors` files holding whole tensors is also accepted; its metadata
//! is synthesized from the file headers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{ReshardError, Result};
use crate::shard::{LocalTensorMetadata, Metadata};
use crate::storage::StorageBackend;

use super::reader::CheckpointReader;

pub const DATA_SUFFIX: &str = ".distcp";
pub const METADATA_SUFFIX: &str = ".metadata";
pub const UNINDEXED_SUFFIX: &str = ".tensors";
/// Metadata written for a directory of `*.tensors` files.
pub const AUTO_METADATA_FILE: &str = "reshard.auto_generated.metadata";

pub fn data_file_name(rank: u32, unique_id: u64) -> String {
    format!("{rank}_{unique_id}{DATA_SUFFIX}")
}

pub fn metadata_file_name(unique_id: u64) -> String {
    format!("{unique_id}{METADATA_SUFFIX}")
}

/// Parses `{rank}_{id}.distcp` into `(rank, id)`.
pub fn parse_data_file_name(name: &str) -> Option<(u32, u64)> {
    let stem = name.strip_suffix(DATA_SUFFIX)?;
    let (rank, id) = stem.split_once('_')?;
    if rank.is_empty() || id.is_empty() {
        return None;
    }
    if !rank.bytes().all(|b| b.is_ascii_digit()) || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((rank.parse().ok()?, id.parse().ok()?))
}

/// Largest save id among the data files in `entries`.
pub fn max_unique_id(entries: &[String]) -> Option<u64> {
    entries
        .iter()
        .filter_map(|name| parse_data_file_name(name))
        .map(|(_, id)| id)
        .max()
}

/// Files of one checkpoint visible to this rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub metadata_files: Vec<String>,
    pub data_files: Vec<String>,
    /// The checkpoint is a set of `*.tensors` files without saved metadata.
    pub unindexed: bool,
}

/// Picks the metadata and data files of save `unique_id` out of a listing.
pub fn select_files(entries: &[String], unique_id: u64) -> CheckpointFiles {
    let unindexed: Vec<String> = entries
        .iter()
        .filter(|name| name.ends_with(UNINDEXED_SUFFIX))
        .cloned()
        .collect();

    if !unindexed.is_empty() {
        return CheckpointFiles {
            metadata_files: entries
                .iter()
                .filter(|name| name.as_str() == AUTO_METADATA_FILE)
                .cloned()
                .collect(),
            data_files: unindexed,
            unindexed: true,
        };
    }

    let metadata_name = metadata_file_name(unique_id);
    CheckpointFiles {
        metadata_files: entries
            .iter()
            .filter(|name| **name == metadata_name)
            .cloned()
            .collect(),
        data_files: entries
            .iter()
            .filter(|name| parse_data_file_name(name).is_some_and(|(_, id)| id == unique_id))
            .cloned()
            .collect(),
        unindexed: false,
    }
}

/// Directory listings keyed by checkpoint path.
///
/// Owned by a loader; a listing is reused until [`invalidate`](Self::invalidate)
/// is called for its path.
#[derive(Debug, Default)]
pub struct CheckpointFileCache {
    enabled: bool,
    listings: Mutex<HashMap<PathBuf, Vec<String>>>,
}

impl CheckpointFileCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            listings: Mutex::new(HashMap::new()),
        }
    }

    /// Lists `dir`, from the cache when possible.
    pub fn list(&self, storage: &dyn StorageBackend, dir: &Path) -> Result<Vec<String>> {
        if !self.enabled {
            return storage.list(dir);
        }

        let mut listings = self
            .listings
            .lock()
            .map_err(|_| ReshardError::storage(dir, "listing cache lock poisoned"))?;
        if let Some(entries) = listings.get(dir) {
            return Ok(entries.clone());
        }

        let entries = storage.list(dir)?;
        debug!(path = %dir.display(), entries = entries.len(), "cached checkpoint listing");
        listings.insert(dir.to_path_buf(), entries.clone());
        Ok(entries)
    }

    pub fn invalidate(&self, dir: &Path) {
        if let Ok(mut listings) = self.listings.lock() {
            listings.remove(dir);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut listings) = self.listings.lock() {
            listings.clear();
        }
    }
}

/// Builds metadata for `*.tensors` files from their headers.
///
/// Each entry is treated as a whole tensor at offset zero.
pub fn synthesize_metadata(
    reader: &CheckpointReader,
    dir: &Path,
    files: &[String],
) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for file in files {
        let header = reader.read_header(&dir.join(file))?;
        for entry in header.entries {
            let meta = LocalTensorMetadata {
                global_offset: vec![0; entry.shape.len()],
                local_shape: entry.shape.clone(),
                dtype: entry.dtype,
                global_shape: entry.shape,
                flattened_range: None,
            };
            metadata.add_shard(&entry.index.tensor_key, meta, file.clone());
        }
    }
    Ok(metadata)
}
