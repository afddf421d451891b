// rust/reshard-core/src/shard/metadata.rs

//! Checkpoint metadata: where every stored shard lives and what it covers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::descriptor::{FlatRange, ShardDescriptor, ShardExtent, ShardedTensor};
use crate::tensor::DType;

/// Geometry of one stored shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalTensorMetadata {
    pub global_offset: Vec<u64>,
    pub local_shape: Vec<u64>,
    pub dtype: DType,
    pub global_shape: Vec<u64>,
    pub flattened_range: Option<FlatRange>,
}

impl LocalTensorMetadata {
    pub fn from_shard(shard: &ShardedTensor) -> Self {
        Self {
            global_offset: shard.desc.global_offset.clone(),
            local_shape: shard.desc.local_shape.clone(),
            dtype: shard.desc.dtype,
            global_shape: shard.desc.global_shape.clone(),
            flattened_range: shard.flattened_range,
        }
    }

    pub fn is_flattened(&self) -> bool {
        self.flattened_range.is_some()
    }

    pub fn to_descriptor(&self, key: impl Into<String>) -> ShardDescriptor {
        ShardDescriptor::new(
            key,
            self.local_shape.clone(),
            self.global_shape.clone(),
            self.global_offset.clone(),
            self.dtype,
        )
    }
}

impl ShardExtent for LocalTensorMetadata {
    fn global_offset(&self) -> &[u64] {
        &self.global_offset
    }

    fn local_shape(&self) -> &[u64] {
        &self.local_shape
    }
}

/// Identifies one stored piece; the flat range separates pieces of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalTensorIndex {
    pub tensor_key: String,
    pub global_offset: Vec<u64>,
    pub flattened_range: Option<FlatRange>,
}

impl LocalTensorIndex {
    pub fn new(tensor_key: impl Into<String>, global_offset: Vec<u64>) -> Self {
        Self {
            tensor_key: tensor_key.into(),
            global_offset,
            flattened_range: None,
        }
    }

    pub fn for_meta(tensor_key: impl Into<String>, meta: &LocalTensorMetadata) -> Self {
        Self {
            tensor_key: tensor_key.into(),
            global_offset: meta.global_offset.clone(),
            flattened_range: meta.flattened_range,
        }
    }
}

/// Per-checkpoint index of stored shards and the files holding them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub state_dict_metadata: BTreeMap<String, Vec<LocalTensorMetadata>>,
    pub storage_metadata: BTreeMap<LocalTensorIndex, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stored shard and the file it lives in.
    pub fn add_shard(&mut self, key: &str, meta: LocalTensorMetadata, file_name: impl Into<String>) {
        let index = LocalTensorIndex::for_meta(key, &meta);
        let entries = self.state_dict_metadata.entry(key.to_string()).or_default();
        if !entries.contains(&meta) {
            entries.push(meta);
        }
        self.storage_metadata.insert(index, file_name.into());
    }

    /// Folds `other` into `self`, dropping shards already present.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, metas) in &other.state_dict_metadata {
            let entries = self.state_dict_metadata.entry(key.clone()).or_default();
            for meta in metas {
                if !entries.contains(meta) {
                    entries.push(meta.clone());
                }
            }
        }
        for (index, file) in &other.storage_metadata {
            self.storage_metadata.insert(index.clone(), file.clone());
        }
    }

    pub fn has_flattened(&self) -> bool {
        self.state_dict_metadata
            .values()
            .flatten()
            .any(LocalTensorMetadata::is_flattened)
    }
}

/// Merged, query-friendly view over the metadata files of one checkpoint.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    merged: Metadata,
}

impl MetadataIndex {
    pub fn new(metadata_list: &[Metadata]) -> Self {
        let mut merged = Metadata::new();
        for metadata in metadata_list {
            merged.merge(metadata);
        }
        Self { merged }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.merged
    }

    pub fn contains(&self, key: &str) -> bool {
        self.merged.state_dict_metadata.contains_key(key)
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.merged.state_dict_metadata.keys().map(String::as_str)
    }

    /// All stored shards of a tensor, in first-seen order.
    pub fn shards(&self, key: &str) -> &[LocalTensorMetadata] {
        self.merged
            .state_dict_metadata
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn file_of(&self, index: &LocalTensorIndex) -> Option<&str> {
        self.merged.storage_metadata.get(index).map(String::as_str)
    }

    /// Files that hold at least one piece of `key`.
    pub fn files_of(&self, key: &str) -> BTreeSet<&str> {
        self.shards(key)
            .iter()
            .filter_map(|meta| self.file_of(&LocalTensorIndex::for_meta(key, meta)))
            .collect()
    }

    pub fn all_files(&self) -> BTreeSet<&str> {
        self.merged
            .storage_metadata
            .values()
            .map(String::as_str)
            .collect()
    }

    /// Storage entries held by `file`, as `(tensor_key, meta)` pairs.
    pub fn entries_in_file<'a>(
        &'a self,
        file: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a LocalTensorMetadata)> + 'a {
        self.merged
            .state_dict_metadata
            .iter()
            .flat_map(move |(key, metas)| metas.iter().map(move |meta| (key.as_str(), meta)))
            .filter(move |(key, meta)| {
                self.file_of(&LocalTensorIndex::for_meta(*key, meta)) == Some(file)
            })
    }

    pub fn has_flattened(&self) -> bool {
        self.merged.has_flattened()
    }

    /// Global shape of `key` as the bounding box of its stored shards.
    pub fn global_shape(&self, key: &str) -> Option<Vec<u64>> {
        let shards = self.shards(key);
        let first = shards.first()?;
        let mut shape = vec![0u64; first.global_offset.len()];
        for meta in shards {
            for (d, extent) in shape.iter_mut().enumerate() {
                *extent = (*extent).max(meta.global_offset[d] + meta.local_shape[d]);
            }
        }
        Some(shape)
    }

    pub fn dtype(&self, key: &str) -> Option<DType> {
        self.shards(key).first().map(|meta| meta.dtype)
    }
}
