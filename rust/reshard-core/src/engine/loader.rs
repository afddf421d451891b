// rust/reshard-core/src/engine/loader.rs

//! Loading a checkpoint into an arbitrary sharded layout.
//!
//! # Example
//!
//! ```no_run
//! use reshard_core::comm::SoloCollective;
//! use reshard_core::engine::CheckpointLoader;
//! use reshard_core::shard::{ShardDescriptor, ShardedStateDict, ShardedTensor, TensorKey};
//! use reshard_core::tensor::{DType, Tensor};
//! use reshard_core::ReshardConfig;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let loader = CheckpointLoader::from_config(ReshardConfig::default(), Arc::new(SoloCollective)).unwrap();
//!
//! let desc = ShardDescriptor::unsharded("layer.weight", vec![4, 8], DType::F32);
//! let shard = ShardedTensor::new(desc, Tensor::zeros(DType::F32, vec![4, 8])).unwrap();
//! let mut state_dict = ShardedStateDict::new();
//! state_dict.insert(TensorKey::from("layer.weight"), shard);
//!
//! let report = loader.load_state_dict(&mut state_dict, Path::new("step_100"), None).unwrap();
//! println!("loaded checkpoint {} from {:?}", report.unique_id, report.files_read);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::checkpoint::{
    max_unique_id, select_files, synthesize_metadata, CheckpointFileCache, CheckpointReader,
    CheckpointWriter, AUTO_METADATA_FILE,
};
use crate::comm::{all_gather_object, CommGroup, Collective};
use crate::config::ReshardConfig;
use crate::engine::executor::{
    destination_map, target_descriptors, EpochReport, Executor, SourceTensors,
};
use crate::engine::unflatten::{expand_flattened_targets, restore_flattened_sources};
use crate::error::{PlanningError, ReshardError, Result};
use crate::plan::{create_assigner, get_load_infos, plan_files};
use crate::shard::integrity::{
    check_compatibility, layout_from_gathered, layout_from_metadata, validate_source_layout,
    validate_target_layout,
};
use crate::shard::{
    check_key_variants, Metadata, MetadataIndex, ShardDescriptor, ShardInfo, ShardLayout,
    ShardedStateDict, ShardedTensor, TensorKey,
};
use crate::storage::{LocalStorage, StorageBackend};
use crate::tensor::Tensor;

/// What a load did on this rank.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub unique_id: u64,
    /// Files this rank read.
    pub files_read: Vec<String>,
    /// Requested tensors the checkpoint does not hold.
    pub missing_keys: BTreeSet<String>,
    /// Requested name to the checkpoint name it was loaded from.
    pub renamed: BTreeMap<String, String>,
    pub epoch: EpochReport,
}

struct Discovered {
    unique_id: u64,
    data_files: Vec<String>,
    index: MetadataIndex,
}

/// Loads checkpoints written with any layout into the caller's layout.
///
/// Every rank constructs its own loader and calls the same methods in the
/// same order; the loader issues collectives on the world group.
pub struct CheckpointLoader {
    config: ReshardConfig,
    storage: Arc<dyn StorageBackend>,
    comm: Arc<dyn Collective>,
    reader: CheckpointReader,
    writer: CheckpointWriter,
    cache: CheckpointFileCache,
    groups: Vec<CommGroup>,
}

impl CheckpointLoader {
    /// Creates a loader over local storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the storage
    /// backend cannot be initialized.
    pub fn from_config(config: ReshardConfig, comm: Arc<dyn Collective>) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        Self::with_storage(config, storage, comm)
    }

    /// Creates a loader from a TOML file with environment overrides applied.
    pub fn from_config_file(path: impl AsRef<Path>, comm: Arc<dyn Collective>) -> Result<Self> {
        let config = ReshardConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config, comm)
    }

    pub fn with_storage(
        config: ReshardConfig,
        storage: Arc<dyn StorageBackend>,
        comm: Arc<dyn Collective>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            reader: CheckpointReader::new(storage.clone()),
            writer: CheckpointWriter::new(storage.clone(), config.checkpoint.clone()),
            cache: CheckpointFileCache::new(config.checkpoint.cache_listings),
            config,
            storage,
            comm,
            groups: Vec::new(),
        })
    }

    /// Runs broadcasts on these groups instead of the world.
    #[must_use]
    pub fn with_groups(mut self, groups: Vec<CommGroup>) -> Self {
        self.groups = groups;
        self
    }

    pub fn config(&self) -> &ReshardConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Listing cache; invalidate a path after writing to it out of band.
    pub fn file_cache(&self) -> &CheckpointFileCache {
        &self.cache
    }

    /// Fills `state_dict` from the checkpoint under `path`.
    ///
    /// # Arguments
    ///
    /// * `state_dict` - Destination shards of this rank; buffers are overwritten
    /// * `path` - Checkpoint directory, relative to the storage base path
    /// * `unique_id` - Save id to load; the newest one visible when `None`
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Ranks disagree on the checkpoint id
    /// - No metadata is found or a needed file is visible to no rank
    /// - The stored shards of a requested tensor do not tile it, or its
    ///   global shape differs from the requested one
    /// - A file fails its integrity check
    /// - A collective fails
    pub fn load_state_dict(
        &self,
        state_dict: &mut ShardedStateDict,
        path: &Path,
        unique_id: Option<u64>,
    ) -> Result<LoadReport> {
        check_key_variants(state_dict)?;
        let discovered = self.discover(path, unique_id)?;
        self.load_discovered(state_dict, path, discovered)
    }

    /// Loads every tensor of a checkpoint, unsharded, onto the coordinator rank.
    ///
    /// Other ranks take part in the transfer and get an empty map. With a
    /// `prefix`, only tensors under it are loaded and the prefix is stripped
    /// from the returned names.
    pub fn load_merged_state_dict(
        &self,
        path: &Path,
        prefix: Option<&str>,
        unique_id: Option<u64>,
    ) -> Result<BTreeMap<String, Tensor>> {
        let discovered = self.discover(path, unique_id)?;

        let mut state_dict = ShardedStateDict::new();
        if self.comm.rank() == self.config.load.coordinator_rank {
            for name in discovered.index.tensor_names() {
                if prefix.is_some_and(|p| !name.starts_with(p)) {
                    continue;
                }
                let (Some(shape), Some(dtype)) = (
                    discovered.index.global_shape(name),
                    discovered.index.dtype(name),
                ) else {
                    continue;
                };
                let desc = ShardDescriptor::unsharded(name, shape.clone(), dtype);
                let shard = ShardedTensor::new(desc, Tensor::zeros(dtype, shape))?;
                state_dict.insert(TensorKey::from(name), shard);
            }
        }

        self.load_discovered(&mut state_dict, path, discovered)?;

        Ok(state_dict
            .into_iter()
            .map(|(key, shard)| {
                let name = match prefix {
                    Some(p) => key.name().strip_prefix(p).unwrap_or(key.name()),
                    None => key.name(),
                };
                (name.trim_start_matches('.').to_string(), shard.tensor)
            })
            .collect())
    }

    fn discover(&self, path: &Path, unique_id: Option<u64>) -> Result<Discovered> {
        let listing = self.cache.list(self.storage.as_ref(), path)?;
        let unique_id = self.resolve_unique_id(&listing, unique_id)?;
        let files = select_files(&listing, unique_id);

        let synthesize = files.unindexed && files.metadata_files.is_empty();
        let local: Vec<Metadata> = if synthesize {
            vec![synthesize_metadata(&self.reader, path, &files.data_files)?]
        } else {
            files
                .metadata_files
                .iter()
                .map(|f| self.reader.read_metadata(&path.join(f)))
                .collect::<Result<_>>()?
        };

        let gathered = all_gather_object(self.comm.as_ref(), &(synthesize, local), None)?;
        let any_synthesized = gathered.iter().any(|(s, _)| *s);
        let metadata: Vec<Metadata> = gathered.into_iter().flat_map(|(_, m)| m).collect();
        if metadata.is_empty() {
            return Err(ReshardError::checkpoint(format!(
                "no metadata for checkpoint {unique_id} under {}",
                path.display()
            )));
        }
        let index = MetadataIndex::new(&metadata);

        if any_synthesized {
            let written = if self.comm.rank() == self.config.load.coordinator_rank {
                self.writer
                    .write_metadata_locked(&path.join(AUTO_METADATA_FILE), index.metadata())
            } else {
                Ok(())
            };
            self.comm.barrier(None)?;
            written?;
            self.cache.invalidate(path);
            info!(path = %path.display(), "generated metadata for unindexed checkpoint");
        }

        info!(
            unique_id,
            tensors = index.metadata().state_dict_metadata.len(),
            files = files.data_files.len(),
            "discovered checkpoint"
        );
        Ok(Discovered {
            unique_id,
            data_files: files.data_files,
            index,
        })
    }

    /// Agrees on one checkpoint id across ranks.
    ///
    /// Ranks that see no data file do not vote.
    fn resolve_unique_id(&self, listing: &[String], requested: Option<u64>) -> Result<u64> {
        let local = requested.or_else(|| max_unique_id(listing));
        let ids: BTreeSet<u64> = all_gather_object(self.comm.as_ref(), &local, None)?
            .into_iter()
            .flatten()
            .collect();
        if ids.len() > 1 {
            return Err(PlanningError::UniqueIdMismatch {
                ids: ids.into_iter().collect(),
            }
            .into());
        }
        Ok(ids.into_iter().next().unwrap_or(0))
    }

    /// Checks the stored layout of every requested tensor and the requested
    /// layout against it. Requested tensors the checkpoint lacks are skipped.
    fn validate_layouts(
        &self,
        state_dict: &ShardedStateDict,
        index: &MetadataIndex,
        renames: &BTreeMap<String, String>,
    ) -> Result<()> {
        let local: Vec<ShardInfo> = state_dict
            .values()
            .map(|shard| {
                let mut info = shard.info();
                if let Some(stored) = renames.get(&info.desc.key) {
                    info.desc.key = stored.clone();
                }
                info
            })
            .collect();
        let mut target = layout_from_gathered(all_gather_object(self.comm.as_ref(), &local, None)?);
        target.retain(|key, _| index.contains(key));
        let source: ShardLayout = layout_from_metadata(index.metadata())
            .into_iter()
            .filter(|(key, _)| target.contains_key(key))
            .collect();

        validate_source_layout(&source)?;
        validate_target_layout(&target)?;
        check_compatibility(&source, &target)?;
        Ok(())
    }

    fn load_discovered(
        &self,
        state_dict: &mut ShardedStateDict,
        path: &Path,
        discovered: Discovered,
    ) -> Result<LoadReport> {
        let comm = self.comm.as_ref();
        let rank = comm.rank();
        let load = &self.config.load;
        let widened = expand_flattened_targets(state_dict)?;

        let wanted: BTreeSet<String> = state_dict.values().map(|s| s.desc.key.clone()).collect();
        let plan = plan_files(
            comm,
            None,
            &discovered.index,
            &wanted,
            &discovered.data_files,
            load.master_weight_compat,
        )?;
        if let Err(err) = self.validate_layouts(state_dict, &discovered.index, &plan.renames) {
            widened.restore(state_dict)?;
            return Err(err);
        }

        let assignment =
            create_assigner(load.file_assignment).assign(&plan.needed, &plan.visible)?;
        let my_files = assignment.get(&rank).cloned().unwrap_or_default();
        if my_files.is_empty() {
            warn!(rank, "no checkpoint files assigned to this rank");
        }
        info!(rank, files = ?my_files, "assigned checkpoint files");

        let local_names: Vec<String> = wanted
            .iter()
            .map(|name| plan.renames.get(name).unwrap_or(name).clone())
            .collect();
        let all_names: BTreeSet<String> = all_gather_object(comm, &local_names, None)?
            .into_iter()
            .flatten()
            .collect();

        let device = state_dict
            .values()
            .next()
            .map(|s| s.tensor.device())
            .unwrap_or_default();
        let mut sources = SourceTensors::new();
        for file in &my_files {
            let tensors = self
                .reader
                .read_tensors_where(&path.join(file), |idx| all_names.contains(&idx.tensor_key))?;
            for (idx, tensor) in tensors {
                let tensor = if load.offload {
                    tensor
                } else {
                    tensor.with_device(device)
                };
                sources.insert(idx, tensor);
            }
        }

        let loaded: BTreeSet<String> = my_files.iter().cloned().collect();
        let load_infos = get_load_infos(comm, None, &discovered.index, &loaded)?;
        let executor = Executor::new(comm, load, &self.groups);

        let (index, load_infos) = if discovered.index.has_flattened() {
            let (index, infos, _) = restore_flattened_sources(
                &executor,
                rank,
                &discovered.index,
                &load_infos,
                &mut sources,
            )?;
            (index, infos)
        } else {
            (discovered.index, load_infos)
        };

        let targets = target_descriptors(state_dict, &plan.renames);
        let epoch = {
            let mut destinations = destination_map(state_dict, &plan.renames);
            executor.run_epoch(&index, &load_infos, &targets, &mut sources, &mut destinations)?
        };
        widened.restore(state_dict)?;

        Ok(LoadReport {
            unique_id: discovered.unique_id,
            files_read: my_files,
            missing_keys: plan.missing_keys,
            renamed: plan.renames,
            epoch,
        })
    }
}
