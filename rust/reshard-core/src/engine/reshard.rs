// rust/reshard-core/src/engine/reshard.rs

//! In-memory resharding between two sharded state dicts.
//!
//! The source layout is published as virtual checkpoint metadata in which
//! every rank "loaded" its own shards from a file named after it, so the
//! same planner and executor used for checkpoint loads move the data.

use std::collections::BTreeMap;

use tracing::info;

use crate::comm::{all_gather_object, CommGroup, Collective};
use crate::config::LoadConfig;
use crate::engine::executor::{
    destination_map, target_descriptors, EpochReport, Executor, SourceTensors,
};
use crate::engine::unflatten::{expand_flattened_targets, restore_flattened_sources};
use crate::error::Result;
use crate::plan::LoadInfos;
use crate::shard::integrity::{
    check_compatibility, layout_from_gathered, layout_from_metadata, validate_source_layout,
    validate_target_layout,
};
use crate::shard::{
    check_key_variants, LocalTensorIndex, LocalTensorMetadata, Metadata, MetadataIndex, ShardInfo,
    ShardedStateDict,
};

#[derive(Debug, Clone, Default)]
pub struct ReshardOptions {
    pub load: LoadConfig,
    /// Worker groups for broadcasts; the world when empty.
    pub groups: Vec<CommGroup>,
}

/// Name of the virtual file standing for `rank`'s in-memory shards.
pub fn virtual_file_name(rank: u32) -> String {
    format!("vfile_{rank}")
}

/// Moves the data of `src` into the layout of `dst`.
///
/// `src` holds this rank's shards of the source layout and is consumed;
/// buffers of `dst` are overwritten. Shards replicated on several ranks are
/// sent from the lowest rank holding them.
///
/// # Errors
///
/// Returns an error if:
/// - The source shards do not tile their tensors
/// - A destination shard is out of bounds or has no source tensor
/// - Global shapes disagree between source and destination
/// - A collective fails
pub fn reshard_sharded_state_dict(
    comm: &dyn Collective,
    src: ShardedStateDict,
    dst: &mut ShardedStateDict,
    options: &ReshardOptions,
) -> Result<EpochReport> {
    check_key_variants(&src)?;
    check_key_variants(dst)?;
    let rank = comm.rank();

    let local: Vec<(String, LocalTensorMetadata)> = src
        .values()
        .map(|shard| (shard.desc.key.clone(), LocalTensorMetadata::from_shard(shard)))
        .collect();
    let (metadata, load_infos) = virtual_metadata(all_gather_object(comm, &local, None)?);
    validate_source_layout(&layout_from_metadata(&metadata))?;

    let mut sources: SourceTensors = src
        .into_values()
        .map(|shard| {
            let idx = LocalTensorIndex::for_meta(
                shard.desc.key.clone(),
                &LocalTensorMetadata::from_shard(&shard),
            );
            (idx, shard.tensor)
        })
        .filter(|(idx, _)| load_infos.get(idx).is_some_and(|(holder, _)| *holder == rank))
        .collect();

    let executor = Executor::new(comm, &options.load, &options.groups);
    let index = MetadataIndex::new(&[metadata]);
    let (index, load_infos) = if index.has_flattened() {
        let (index, infos, _) =
            restore_flattened_sources(&executor, rank, &index, &load_infos, &mut sources)?;
        (index, infos)
    } else {
        (index, load_infos)
    };

    let widened = expand_flattened_targets(dst)?;
    let dst_infos: Vec<ShardInfo> = dst.values().map(|shard| shard.info()).collect();
    let dst_layout = layout_from_gathered(all_gather_object(comm, &dst_infos, None)?);
    let checked = validate_target_layout(&dst_layout)
        .and_then(|()| check_compatibility(&layout_from_metadata(index.metadata()), &dst_layout));
    if let Err(err) = checked {
        widened.restore(dst)?;
        return Err(err.into());
    }

    let no_renames = BTreeMap::new();
    let targets = target_descriptors(dst, &no_renames);
    let report = {
        let mut destinations = destination_map(dst, &no_renames);
        executor.run_epoch(&index, &load_infos, &targets, &mut sources, &mut destinations)?
    };
    widened.restore(dst)?;

    info!(rank, items = report.read_items, "resharded state dict");
    Ok(report)
}

/// Builds metadata and load infos from every rank's shard list, lowest rank
/// first so replicas resolve to the lowest holder.
fn virtual_metadata(per_rank: Vec<Vec<(String, LocalTensorMetadata)>>) -> (Metadata, LoadInfos) {
    let mut metadata = Metadata::new();
    let mut load_infos = LoadInfos::new();
    for (rank, shards) in (0u32..).zip(per_rank) {
        let file = virtual_file_name(rank);
        for (key, meta) in shards {
            let idx = LocalTensorIndex::for_meta(key.clone(), &meta);
            if load_infos.contains_key(&idx) {
                continue;
            }
            load_infos.insert(idx, (rank, file.clone()));
            metadata.add_shard(&key, meta, file.clone());
        }
    }
    (metadata, load_infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{CommGroup, LocalMesh, SoloCollective};
    use crate::error::ReshardError;
    use crate::shard::placement::shard_full_tensor;
    use crate::shard::{
        FlatRange, Placement, ProcessMesh, ShardDescriptor, ShardedTensor, TensorKey,
    };
    use crate::tensor::{DType, Tensor};

    fn arange(shape: Vec<u64>) -> Tensor {
        let n: u64 = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|v| v as f32).collect();
        Tensor::from_f32(shape, &values).unwrap()
    }

    fn layout(name: &str, full: &Tensor, mesh: &ProcessMesh, placements: &[Placement], rank: u32) -> ShardedStateDict {
        shard_full_tensor(name, full, mesh, placements, rank)
            .unwrap()
            .map(|shard| (TensorKey::from(name), shard))
            .into_iter()
            .collect()
    }

    fn zeroed(sd: &ShardedStateDict) -> ShardedStateDict {
        sd.iter()
            .map(|(k, s)| {
                let tensor = Tensor::zeros(s.desc.dtype, s.desc.local_shape.clone());
                (k.clone(), ShardedTensor::new(s.desc.clone(), tensor).unwrap())
            })
            .collect()
    }

    fn run_ranks<F>(world: u32, f: F) -> Vec<Result<(ShardedStateDict, EpochReport)>>
    where
        F: Fn(&dyn Collective) -> Result<(ShardedStateDict, EpochReport)> + Sync,
    {
        std::thread::scope(|s| {
            let handles: Vec<_> = LocalMesh::new(world)
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(&comm))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_rows_to_columns() {
        let full = arange(vec![4, 4]);
        let mesh = ProcessMesh::linear(2);
        let results = run_ranks(2, |comm| {
            let src = layout("w", &full, &mesh, &[Placement::Shard(0)], comm.rank());
            let mut dst = zeroed(&layout("w", &full, &mesh, &[Placement::Shard(1)], comm.rank()));
            let report = reshard_sharded_state_dict(comm, src, &mut dst, &ReshardOptions::default())?;
            Ok((dst, report))
        });

        for (rank, result) in (0u32..).zip(results) {
            let (dst, report) = result.unwrap();
            assert_eq!(dst, layout("w", &full, &mesh, &[Placement::Shard(1)], rank));
            assert_eq!(report.read_items, 4);
            assert_eq!(report.local_copies, 1);
        }
    }

    #[test]
    fn test_replicated_source_reads_from_lowest_rank() {
        let full = arange(vec![6]);
        let mesh = ProcessMesh::linear(3);
        let results = run_ranks(3, |comm| {
            let src = layout("b", &full, &mesh, &[Placement::Replicate], comm.rank());
            let mut dst = zeroed(&layout("b", &full, &mesh, &[Placement::Shard(0)], comm.rank()));
            let report = reshard_sharded_state_dict(comm, src, &mut dst, &ReshardOptions::default())?;
            Ok((dst, report))
        });

        for (rank, result) in (0u32..).zip(results) {
            let (dst, report) = result.unwrap();
            assert_eq!(dst, layout("b", &full, &mesh, &[Placement::Shard(0)], rank));
            assert_eq!(report.read_items, 3);
        }
    }

    fn piece(name: &str, full: &Tensor, offset: u64) -> (TensorKey, ShardedTensor) {
        let desc = ShardDescriptor::new(name, vec![2], full.shape().to_vec(), vec![offset], DType::F32);
        let tensor = full.slice(&[offset], &[2]).unwrap();
        (TensorKey::from(name), ShardedTensor::new(desc, tensor).unwrap())
    }

    /// `a` swaps halves between pipeline partners, `b` between data-parallel
    /// partners, so every transfer stays inside one two-rank group.
    fn swap_within_groups(pack_transfers: bool) {
        let a = arange(vec![8]);
        let b_values: Vec<f32> = (100..108).map(|v| v as f32).collect();
        let b = Tensor::from_f32(vec![8], &b_values).unwrap();
        let options = ReshardOptions {
            load: LoadConfig {
                packed_dtype: DType::F32,
                pack_transfers,
                ..LoadConfig::default()
            },
            groups: vec![
                CommGroup::new("pp0", [0, 1]),
                CommGroup::new("pp1", [2, 3]),
                CommGroup::new("dp0", [0, 2]),
                CommGroup::new("dp1", [1, 3]),
            ],
        };
        let pp_partner = |rank: u32| u64::from(rank ^ 1);
        let dp_partner = |rank: u32| u64::from(rank ^ 2);

        let results = run_ranks(4, |comm| {
            let rank = comm.rank();
            let own = 2 * u64::from(rank);
            let src: ShardedStateDict = [piece("a", &a, own), piece("b", &b, own)].into_iter().collect();
            let wanted: ShardedStateDict = [
                piece("a", &a, 2 * pp_partner(rank)),
                piece("b", &b, 2 * dp_partner(rank)),
            ]
            .into_iter()
            .collect();
            let mut dst = zeroed(&wanted);
            let report = reshard_sharded_state_dict(comm, src, &mut dst, &options)?;
            Ok((dst, report))
        });

        for (rank, result) in (0u32..).zip(results) {
            let (dst, report) = result.unwrap();
            let got_a = &dst[&TensorKey::from("a")].tensor;
            let got_b = &dst[&TensorKey::from("b")].tensor;
            assert_eq!(*got_a, a.slice(&[2 * pp_partner(rank)], &[2]).unwrap(), "rank {rank}");
            assert_eq!(*got_b, b.slice(&[2 * dp_partner(rank)], &[2]).unwrap(), "rank {rank}");

            assert_eq!(report.local_copies, 0);
            // Two pipeline and two data-parallel transfers touch each rank.
            assert_eq!(report.broadcasts + report.packed_broadcasts, 4);
            if pack_transfers {
                assert_eq!(report.broadcasts, 0);
            } else {
                assert_eq!(report.packed_broadcasts, 0);
            }
        }
    }

    #[test]
    fn test_swap_within_groups() {
        swap_within_groups(false);
    }

    #[test]
    fn test_swap_within_groups_packed() {
        swap_within_groups(true);
    }

    #[test]
    fn test_gap_in_source_is_rejected() {
        let mut src = ShardedStateDict::new();
        let desc = ShardDescriptor::new("w", vec![2], vec![4], vec![0], DType::F32);
        src.insert(
            TensorKey::from("w"),
            ShardedTensor::new(desc, arange(vec![2])).unwrap(),
        );
        let mut dst = zeroed(&layout("w", &arange(vec![4]), &ProcessMesh::linear(1), &[Placement::Replicate], 0));

        let err = reshard_sharded_state_dict(&SoloCollective, src, &mut dst, &ReshardOptions::default())
            .unwrap_err();
        assert!(matches!(err, ReshardError::Sharding(_)));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let src = layout("w", &arange(vec![4]), &ProcessMesh::linear(1), &[Placement::Replicate], 0);
        let mut dst = zeroed(&layout("w", &arange(vec![5]), &ProcessMesh::linear(1), &[Placement::Replicate], 0));

        let err = reshard_sharded_state_dict(&SoloCollective, src, &mut dst, &ReshardOptions::default())
            .unwrap_err();
        assert!(matches!(err, ReshardError::Sharding(_)));
    }

    #[test]
    fn test_flattened_source_and_destination() {
        let full = arange(vec![2, 3]);
        let results = run_ranks(2, |comm| {
            let rank = comm.rank();
            let range = if rank == 0 {
                FlatRange::new(0, 4)
            } else {
                FlatRange::new(4, 6)
            };
            let values: Vec<f32> = (range.start..range.end).map(|v| v as f32).collect();
            let desc = ShardDescriptor::unsharded("w", vec![2, 3], DType::F32);
            let flat = Tensor::from_f32(vec![range.len()], &values)?;

            let mut src = ShardedStateDict::new();
            src.insert(
                TensorKey::from("w"),
                ShardedTensor::flattened(desc.clone(), flat, range)?,
            );

            let dst_range = if rank == 0 {
                FlatRange::new(0, 3)
            } else {
                FlatRange::new(3, 6)
            };
            let mut dst = ShardedStateDict::new();
            dst.insert(
                TensorKey::from("w"),
                ShardedTensor::flattened(
                    desc,
                    Tensor::zeros(DType::F32, vec![dst_range.len()]),
                    dst_range,
                )?,
            );
            let report = reshard_sharded_state_dict(comm, src, &mut dst, &ReshardOptions::default())?;
            Ok((dst, report))
        });

        let expected = full.to_f32_vec().unwrap();
        for (rank, result) in results.into_iter().enumerate() {
            let (dst, _) = result.unwrap();
            let shard = &dst[&TensorKey::from("w")];
            assert!(shard.is_flattened());
            assert_eq!(shard.tensor.to_f32_vec().unwrap(), expected[rank * 3..rank * 3 + 3]);
        }
    }
}
