// rust/reshard-core/src/engine/unflatten.rs

//! Flattened shards on either side of a transfer.
//!
//! Destination runs are widened to their minimal N-D box before planning and
//! cut back afterwards. Stored runs are reassembled into whole N-D shards on
//! the rank that loaded their first piece, by resharding them as 1-D tensors.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::engine::executor::{Destinations, EpochReport, Executor, SourceTensors};
use crate::error::{ReshardError, Result};
use crate::plan::LoadInfos;
use crate::shard::unflatten::minimal_nd_slice;
use crate::shard::{
    FlatRange, LocalTensorIndex, LocalTensorMetadata, Metadata, MetadataIndex, ShardDescriptor,
    ShardedStateDict, TensorKey,
};
use crate::tensor::{numel, Tensor};

#[derive(Debug)]
struct PendingRestore {
    key: TensorKey,
    desc: ShardDescriptor,
    range: FlatRange,
    /// The run inside the widened box.
    window: FlatRange,
    /// Caller's buffer when a temporary box was loaded instead.
    original: Option<Tensor>,
}

/// Flattened destination shards that were widened for loading.
#[derive(Debug, Default)]
pub struct FlattenedTargets {
    pending: Vec<PendingRestore>,
}

impl FlattenedTargets {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Puts every widened shard back into its flattened form.
    ///
    /// # Errors
    /// Returns an error if a widened entry was removed from `state_dict`.
    pub fn restore(self, state_dict: &mut ShardedStateDict) -> Result<()> {
        for pending in self.pending {
            let shard = state_dict.get_mut(&pending.key).ok_or_else(|| {
                ReshardError::tensor(format!("flattened shard {} disappeared", pending.key))
            })?;

            let placeholder = Tensor::zeros(pending.desc.dtype, vec![0]);
            let mut loaded = std::mem::replace(&mut shard.tensor, placeholder);
            loaded.flatten();

            let tensor = match pending.original {
                None => loaded,
                Some(mut original) => {
                    let run = loaded.flat_slice(pending.window.start, pending.window.end)?;
                    original.flat_assign(0, &run)?;
                    original
                }
            };

            shard.desc = pending.desc;
            shard.tensor = tensor;
            shard.flattened_range = Some(pending.range);
        }
        Ok(())
    }
}

/// Replaces every flattened shard in `state_dict` with its minimal N-D box.
///
/// When the run fills the box the caller's buffer is reshaped in place;
/// otherwise a zeroed box is loaded and the run copied out in
/// [`FlattenedTargets::restore`].
pub fn expand_flattened_targets(state_dict: &mut ShardedStateDict) -> Result<FlattenedTargets> {
    let mut targets = FlattenedTargets::default();

    for (key, shard) in state_dict.iter_mut() {
        let Some(range) = shard.flattened_range else {
            continue;
        };
        let slice = minimal_nd_slice(&shard.desc.local_shape, range)?;
        let offset: Vec<u64> = shard
            .desc
            .global_offset
            .iter()
            .zip(&slice.start)
            .map(|(o, s)| o + s)
            .collect();
        let boxed = ShardDescriptor::new(
            shard.desc.key.clone(),
            slice.shape.clone(),
            shard.desc.global_shape.clone(),
            offset,
            shard.desc.dtype,
        );

        let placeholder = Tensor::zeros(shard.desc.dtype, vec![0]);
        let mut tensor = std::mem::replace(&mut shard.tensor, placeholder);
        let original = if slice.is_exact() {
            tensor.reshape(slice.shape.clone())?;
            None
        } else {
            let device = tensor.device();
            Some(std::mem::replace(
                &mut tensor,
                Tensor::zeros(shard.desc.dtype, slice.shape.clone()).with_device(device),
            ))
        };

        debug!(key = %key, exact = original.is_none(), shape = ?slice.shape, "widened flattened target");
        targets.pending.push(PendingRestore {
            key: key.clone(),
            desc: std::mem::replace(&mut shard.desc, boxed),
            range,
            window: slice.flat_range,
            original,
        });
        shard.tensor = tensor;
        shard.flattened_range = None;
    }
    Ok(targets)
}

/// Name of the 1-D tensor a flattened stored shard is reassembled through.
pub fn virtual_tensor_name(key: &str, global_offset: &[u64]) -> String {
    let offset: Vec<String> = global_offset.iter().map(u64::to_string).collect();
    format!("{key}.global_offset.{}", offset.join("_"))
}

struct SplitShard {
    key: String,
    meta: LocalTensorMetadata,
    virtual_name: String,
    owner: u32,
}

/// Rebuilds whole N-D stored shards out of flattened pieces.
///
/// A shard stored as one run covering it entirely is reshaped where it was
/// loaded. A shard split into several runs is gathered on the rank that
/// loaded its first run. Every rank must call this with the same `index` and
/// `load_infos`.
///
/// # Returns
/// The index and load infos of the restored, unflattened shards. `sources`
/// is updated in place.
pub fn restore_flattened_sources(
    executor: &Executor<'_>,
    rank: u32,
    index: &MetadataIndex,
    load_infos: &LoadInfos,
    sources: &mut SourceTensors,
) -> Result<(MetadataIndex, LoadInfos, EpochReport)> {
    let mut restored = Metadata::new();
    let mut restored_infos = LoadInfos::new();
    let mut virtual_meta = Metadata::new();
    let mut virtual_infos = LoadInfos::new();
    let mut split = Vec::new();

    for (key, metas) in &index.metadata().state_dict_metadata {
        let mut pieces: BTreeMap<&[u64], Vec<&LocalTensorMetadata>> = BTreeMap::new();
        for meta in metas {
            if meta.is_flattened() {
                pieces.entry(meta.global_offset.as_slice()).or_default().push(meta);
                continue;
            }
            let idx = LocalTensorIndex::for_meta(key, meta);
            if let Some(file) = index.file_of(&idx) {
                restored.add_shard(key, meta.clone(), file);
            }
            if let Some(info) = load_infos.get(&idx) {
                restored_infos.insert(idx, info.clone());
            }
        }

        for (offset, mut runs) in pieces {
            runs.sort_by_key(|m| m.flattened_range.map(|r| r.start));
            let loaded: Vec<(&LocalTensorMetadata, (u32, String))> = runs
                .into_iter()
                .filter_map(|m| {
                    let info = load_infos.get(&LocalTensorIndex::for_meta(key, m))?;
                    Some((m, info.clone()))
                })
                .collect();
            let Some((first, (owner, first_file))) = loaded.first().cloned() else {
                continue;
            };

            let whole = LocalTensorMetadata {
                flattened_range: None,
                ..first.clone()
            };
            let whole_idx = LocalTensorIndex::for_meta(key, &whole);
            let total = numel(&whole.local_shape);
            restored.add_shard(key, whole.clone(), first_file.clone());
            restored_infos.insert(whole_idx.clone(), (owner, first_file.clone()));

            let covers_all = loaded.len() == 1
                && first.flattened_range == Some(FlatRange::new(0, total));
            if covers_all {
                if owner == rank {
                    let piece_idx = LocalTensorIndex::for_meta(key, first);
                    if let Some(mut tensor) = sources.remove(&piece_idx) {
                        tensor.reshape(whole.local_shape.clone())?;
                        sources.insert(whole_idx, tensor);
                    }
                }
                continue;
            }

            let virtual_name = virtual_tensor_name(key, offset);
            for (meta, (loader, file)) in &loaded {
                let Some(run) = meta.flattened_range else {
                    continue;
                };
                let run_meta = LocalTensorMetadata {
                    global_offset: vec![run.start],
                    local_shape: vec![run.len()],
                    dtype: meta.dtype,
                    global_shape: vec![total],
                    flattened_range: None,
                };
                let run_idx = LocalTensorIndex::for_meta(&virtual_name, &run_meta);
                virtual_meta.add_shard(&virtual_name, run_meta, file.clone());
                virtual_infos.insert(run_idx.clone(), (*loader, file.clone()));

                if *loader == rank {
                    if let Some(tensor) = sources.remove(&LocalTensorIndex::for_meta(key, meta)) {
                        sources.insert(run_idx, tensor);
                    }
                }
            }
            split.push(SplitShard {
                key: key.clone(),
                meta: whole,
                virtual_name,
                owner,
            });
        }
    }

    if split.is_empty() {
        return Ok((
            MetadataIndex::new(&[restored]),
            restored_infos,
            EpochReport::default(),
        ));
    }

    let mine: Vec<&SplitShard> = split.iter().filter(|s| s.owner == rank).collect();
    let targets: Vec<ShardDescriptor> = mine
        .iter()
        .map(|s| {
            let total = numel(&s.meta.local_shape);
            ShardDescriptor::new(
                s.virtual_name.clone(),
                vec![total],
                vec![total],
                vec![0],
                s.meta.dtype,
            )
        })
        .collect();
    let mut buffers: Vec<Tensor> = targets
        .iter()
        .map(|t| Tensor::zeros(t.dtype, t.local_shape.clone()))
        .collect();

    let report = {
        let mut destinations: Destinations<'_> = targets
            .iter()
            .zip(buffers.iter_mut())
            .map(|(t, buf)| ((t.key.clone(), t.global_offset.clone()), buf))
            .collect();
        executor.run_epoch(
            &MetadataIndex::new(&[virtual_meta]),
            &virtual_infos,
            &targets,
            sources,
            &mut destinations,
        )?
    };

    for (shard, mut tensor) in mine.into_iter().zip(buffers) {
        tensor.reshape(shard.meta.local_shape.clone())?;
        sources.insert(LocalTensorIndex::for_meta(&shard.key, &shard.meta), tensor);
    }
    info!(shards = split.len(), "reassembled flattened source shards");

    Ok((MetadataIndex::new(&[restored]), restored_infos, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Collective, LocalMesh, SoloCollective};
    use crate::config::LoadConfig;
    use crate::shard::ShardedTensor;
    use crate::tensor::DType;

    fn arange(shape: Vec<u64>) -> Tensor {
        let n: u64 = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|v| v as f32).collect();
        Tensor::from_f32(shape, &values).unwrap()
    }

    fn flat_shard(range: FlatRange, fill: f32) -> ShardedTensor {
        let desc = ShardDescriptor::new("w", vec![4, 4], vec![4, 4], vec![0, 0], DType::F32);
        let values = vec![fill; range.len() as usize];
        let tensor = Tensor::from_f32(vec![range.len()], &values).unwrap();
        ShardedTensor::flattened(desc, tensor, range).unwrap()
    }

    #[test]
    fn test_exact_run_is_reshaped_in_place() {
        let mut sd = ShardedStateDict::new();
        sd.insert(TensorKey::from("w"), flat_shard(FlatRange::new(4, 12), 1.0));

        let widened = expand_flattened_targets(&mut sd).unwrap();
        assert_eq!(widened.len(), 1);
        let shard = &sd[&TensorKey::from("w")];
        assert!(!shard.is_flattened());
        assert_eq!(shard.desc.global_offset, vec![1, 0]);
        assert_eq!(shard.desc.local_shape, vec![2, 4]);
        assert_eq!(shard.tensor.shape(), &[2, 4]);

        widened.restore(&mut sd).unwrap();
        let shard = &sd[&TensorKey::from("w")];
        assert_eq!(shard.flattened_range, Some(FlatRange::new(4, 12)));
        assert_eq!(shard.tensor.shape(), &[8]);
        assert_eq!(shard.desc.local_shape, vec![4, 4]);
    }

    #[test]
    fn test_partial_run_copies_window_back() {
        let mut sd = ShardedStateDict::new();
        sd.insert(TensorKey::from("w"), flat_shard(FlatRange::new(5, 10), 0.0));

        let widened = expand_flattened_targets(&mut sd).unwrap();
        {
            let shard = sd.get_mut(&TensorKey::from("w")).unwrap();
            assert_eq!(shard.desc.global_offset, vec![1, 0]);
            assert_eq!(shard.desc.local_shape, vec![2, 4]);
            // Simulate a load of rows 1..3 of a 4x4 arange.
            shard.tensor = arange(vec![4, 4]).slice(&[1, 0], &[2, 4]).unwrap();
        }
        widened.restore(&mut sd).unwrap();

        let shard = &sd[&TensorKey::from("w")];
        assert_eq!(shard.tensor.to_f32_vec().unwrap(), vec![5.0, 6.0, 7.0, 8.0, 9.0]);
        assert!(shard.is_flattened());
    }

    fn piece(range: FlatRange) -> LocalTensorMetadata {
        LocalTensorMetadata {
            global_offset: vec![0, 0],
            local_shape: vec![2, 3],
            dtype: DType::F32,
            global_shape: vec![2, 3],
            flattened_range: Some(range),
        }
    }

    #[test]
    fn test_single_covering_run_is_reshaped() {
        let mut metadata = Metadata::new();
        metadata.add_shard("w", piece(FlatRange::new(0, 6)), "0_0.distcp");
        let index = MetadataIndex::new(&[metadata]);
        let infos: LoadInfos = index
            .metadata()
            .storage_metadata
            .iter()
            .map(|(idx, file)| (idx.clone(), (0, file.clone())))
            .collect();

        let mut sources = SourceTensors::new();
        sources.insert(
            LocalTensorIndex::for_meta("w", &piece(FlatRange::new(0, 6))),
            arange(vec![6]),
        );

        let config = LoadConfig::default();
        let executor = Executor::new(&SoloCollective, &config, &[]);
        let (restored, restored_infos, _) =
            restore_flattened_sources(&executor, 0, &index, &infos, &mut sources).unwrap();

        assert!(!restored.has_flattened());
        let whole = LocalTensorIndex::new("w", vec![0, 0]);
        assert_eq!(restored_infos[&whole].0, 0);
        assert_eq!(sources[&whole].shape(), &[2, 3]);
    }

    #[test]
    fn test_split_runs_gathered_on_first_loader() {
        let mut metadata = Metadata::new();
        metadata.add_shard("w", piece(FlatRange::new(0, 4)), "0_0.distcp");
        metadata.add_shard("w", piece(FlatRange::new(4, 6)), "1_0.distcp");
        let index = MetadataIndex::new(&[metadata]);
        let infos: LoadInfos = index
            .metadata()
            .storage_metadata
            .iter()
            .map(|(idx, file)| {
                let rank = if file.starts_with('0') { 0 } else { 1 };
                (idx.clone(), (rank, file.clone()))
            })
            .collect();
        let config = LoadConfig::default();

        let results: Vec<SourceTensors> = std::thread::scope(|s| {
            let handles: Vec<_> = LocalMesh::new(2)
                .into_iter()
                .map(|comm| {
                    let (index, infos, config) = (&index, &infos, &config);
                    s.spawn(move || {
                        let rank = comm.rank();
                        let full = arange(vec![6]);
                        let (range, values) = if rank == 0 {
                            (FlatRange::new(0, 4), full.flat_slice(0, 4).unwrap())
                        } else {
                            (FlatRange::new(4, 6), full.flat_slice(4, 6).unwrap())
                        };
                        let mut sources = SourceTensors::new();
                        sources.insert(LocalTensorIndex::for_meta("w", &piece(range)), values);

                        let executor = Executor::new(&comm, config, &[]);
                        let (restored, restored_infos, _) = restore_flattened_sources(
                            &executor, rank, index, infos, &mut sources,
                        )
                        .unwrap();
                        assert_eq!(restored.shards("w").len(), 1);
                        assert_eq!(restored_infos[&LocalTensorIndex::new("w", vec![0, 0])].0, 0);
                        sources
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let whole = LocalTensorIndex::new("w", vec![0, 0]);
        assert_eq!(results[0][&whole], arange(vec![2, 3]));
        assert!(results[1].is_empty());
    }

    #[test]
    fn test_virtual_tensor_name() {
        assert_eq!(virtual_tensor_name("w", &[4, 0]), "w.global_offset.4_0");
        assert_eq!(virtual_tensor_name("step", &[]), "step.global_offset.");
    }
}
