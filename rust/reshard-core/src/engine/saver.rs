// rust/reshard-core/src/engine/saver.rs

//! Writing a sharded state dict as a checkpoint.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::checkpoint::{data_file_name, metadata_file_name, CheckpointWriter};
use crate::comm::{all_gather_object, Collective};
use crate::config::ReshardConfig;
use crate::error::Result;
use crate::shard::{
    check_key_variants, LocalTensorIndex, LocalTensorMetadata, Metadata, ShardedStateDict,
};
use crate::storage::{LocalStorage, StorageBackend};
use crate::tensor::Tensor;

/// What a save wrote on this rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub unique_id: u64,
    /// Data file written by this rank, if it owned any shard.
    pub data_file: Option<String>,
    pub tensors_written: usize,
    /// Written by the coordinator rank only.
    pub metadata_file: Option<String>,
}

/// Saves sharded state dicts so that any layout can load them back.
pub struct CheckpointSaver {
    config: ReshardConfig,
    storage: Arc<dyn StorageBackend>,
    comm: Arc<dyn Collective>,
    writer: CheckpointWriter,
}

impl CheckpointSaver {
    /// Creates a saver over local storage.
    pub fn from_config(config: ReshardConfig, comm: Arc<dyn Collective>) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        Self::with_storage(config, storage, comm)
    }

    pub fn with_storage(
        config: ReshardConfig,
        storage: Arc<dyn StorageBackend>,
        comm: Arc<dyn Collective>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            writer: CheckpointWriter::new(storage.clone(), config.checkpoint.clone()),
            config,
            storage,
            comm,
        })
    }

    pub fn config(&self) -> &ReshardConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Writes this rank's shards and, on the coordinator, the metadata.
    ///
    /// A shard replicated on several ranks is written once, by the lowest
    /// rank holding it. All ranks wait for the metadata before returning.
    ///
    /// # Arguments
    ///
    /// * `state_dict` - This rank's shards
    /// * `path` - Checkpoint directory, relative to the storage base path
    /// * `unique_id` - Save id embedded in every file name
    pub fn save_state_dict(
        &self,
        state_dict: &ShardedStateDict,
        path: &Path,
        unique_id: u64,
    ) -> Result<SaveReport> {
        check_key_variants(state_dict)?;
        let rank = self.comm.rank();

        let local: Vec<(String, LocalTensorMetadata)> = state_dict
            .values()
            .map(|shard| (shard.desc.key.clone(), LocalTensorMetadata::from_shard(shard)))
            .collect();

        let mut writers: BTreeMap<LocalTensorIndex, u32> = BTreeMap::new();
        let mut metadata = Metadata::new();
        for (holder, shards) in (0u32..).zip(all_gather_object(self.comm.as_ref(), &local, None)?) {
            for (key, meta) in shards {
                let idx = LocalTensorIndex::for_meta(key.clone(), &meta);
                if writers.contains_key(&idx) {
                    continue;
                }
                writers.insert(idx, holder);
                metadata.add_shard(&key, meta, data_file_name(holder, unique_id));
            }
        }

        let owned: BTreeMap<LocalTensorIndex, Tensor> = state_dict
            .values()
            .filter_map(|shard| {
                let idx = LocalTensorIndex::for_meta(
                    shard.desc.key.clone(),
                    &LocalTensorMetadata::from_shard(shard),
                );
                (writers.get(&idx) == Some(&rank)).then(|| (idx, shard.tensor.clone()))
            })
            .collect();

        let data_file = data_file_name(rank, unique_id);
        let data_written = if owned.is_empty() {
            debug!(rank, "no owned shards to write");
            Ok(None)
        } else {
            self.writer
                .write_tensors(&path.join(&data_file), &owned)
                .map(|_| Some(data_file))
        };

        let metadata_written = if rank == self.config.load.coordinator_rank {
            let name = metadata_file_name(unique_id);
            self.writer
                .write_metadata_locked(&path.join(&name), &metadata)
                .map(|_| Some(name))
        } else {
            Ok(None)
        };

        self.comm.barrier(None)?;
        let data_file = data_written?;
        let metadata_file = metadata_written?;

        info!(
            rank,
            unique_id,
            tensors = owned.len(),
            path = %path.display(),
            "saved checkpoint shards"
        );
        Ok(SaveReport {
            unique_id,
            data_file,
            tensors_written: owned.len(),
            metadata_file,
        })
    }
}
