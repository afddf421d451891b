// rust/reshard-core/src/plan/planner.rs

//! Read-item planning.
//!
//! Planning runs on every rank with the same collective calls in the same
//! order:
//! 1. [`plan_files`] gathers which files each rank needs and can see.
//! 2. After the balancer has picked who reads what, [`get_load_infos`]
//!    gathers which rank holds each stored shard.
//! 3. [`get_read_items`] intersects local destination shards with stored
//!    shards and gathers the result so every rank sees the whole plan.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::comm::{all_gather_object, CommGroup, Collective};
use crate::error::{PlanningError, Result};
use crate::shard::{disjoint, overlap, LocalTensorIndex, MetadataIndex, ShardDescriptor};

use super::balancer::RankFiles;
use super::read_item::ReadItem;

/// Which rank loaded each stored shard, and from which file.
pub type LoadInfos = BTreeMap<LocalTensorIndex, (u32, String)>;

/// File needs of every rank for one load.
#[derive(Debug, Clone, Default)]
pub struct FilePlan {
    /// Files each rank needs data from.
    pub needed: RankFiles,
    /// Files each rank can open.
    pub visible: RankFiles,
    /// Wanted tensors this rank could not find in the checkpoint.
    pub missing_keys: BTreeSet<String>,
    /// Wanted name to the checkpoint name it was found under.
    pub renames: BTreeMap<String, String>,
}

/// The other spelling of a master-weight tensor name, if `name` is one.
///
/// `a.master_weights.b` and `a.b_fp32_master_0` name the same tensor.
pub fn master_weight_alias(name: &str) -> Option<String> {
    const SUFFIX: &str = "_fp32_master_0";
    let mut parts: Vec<&str> = name.split('.').collect();

    if let Some(pos) = parts.iter().position(|p| *p == "master_weights") {
        parts.remove(pos);
        return Some(format!("{}{SUFFIX}", parts.join(".")));
    }

    let last = parts.pop()?;
    let stripped = last.strip_suffix(SUFFIX)?;
    parts.push(stripped);
    parts.insert(1.min(parts.len()), "master_weights");
    Some(parts.join("."))
}

/// Splits wanted names into renames (found under an alias) and missing keys.
pub fn resolve_names(
    index: &MetadataIndex,
    wanted: &BTreeSet<String>,
    master_weight_compat: bool,
) -> (BTreeMap<String, String>, BTreeSet<String>) {
    let mut renames = BTreeMap::new();
    let mut missing = BTreeSet::new();

    for name in wanted.iter().filter(|n| !index.contains(n)) {
        match master_weight_alias(name) {
            Some(alias) if master_weight_compat && index.contains(&alias) => {
                info!(from = %name, to = %alias, "resolved master weight name");
                renames.insert(name.clone(), alias);
            }
            _ => {
                missing.insert(name.clone());
            }
        }
    }
    (renames, missing)
}

/// Gathers needed and visible files of every rank.
///
/// # Errors
///
/// Returns [`PlanningError::IncompleteCheckpoint`] if some needed file is
/// visible to no rank.
pub fn plan_files(
    comm: &dyn Collective,
    group: Option<&CommGroup>,
    index: &MetadataIndex,
    wanted: &BTreeSet<String>,
    local_files: &[String],
    master_weight_compat: bool,
) -> Result<FilePlan> {
    let (renames, missing_keys) = resolve_names(index, wanted, master_weight_compat);

    let local_needed: Vec<String> = wanted
        .iter()
        .map(|name| renames.get(name).unwrap_or(name))
        .flat_map(|name| index.files_of(name))
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .map(str::to_string)
        .collect();

    let ranks = member_ranks(comm, group);
    let needed: RankFiles = ranks
        .iter()
        .copied()
        .zip(all_gather_object(comm, &local_needed, group)?)
        .collect();
    let visible: RankFiles = ranks
        .iter()
        .copied()
        .zip(all_gather_object(comm, &local_files.to_vec(), group)?)
        .collect();

    let all_needed: BTreeSet<&String> = needed.values().flatten().collect();
    let all_visible: BTreeSet<&String> = visible.values().flatten().collect();
    if all_needed.is_empty() {
        warn!("no checkpoint file holds any requested tensor");
    }

    let absent: Vec<String> = all_needed
        .difference(&all_visible)
        .map(|f| f.to_string())
        .collect();
    if !absent.is_empty() {
        return Err(PlanningError::IncompleteCheckpoint { missing: absent }.into());
    }

    if !missing_keys.is_empty() {
        warn!(keys = ?missing_keys, "tensors missing from checkpoint");
    }
    debug!(?needed, "gathered needed files");

    Ok(FilePlan {
        needed,
        visible,
        missing_keys,
        renames,
    })
}

/// Gathers which rank loaded which stored shard.
///
/// # Errors
///
/// Returns [`PlanningError::DuplicateLoadInfo`] if two ranks claim the same
/// stored shard.
pub fn get_load_infos(
    comm: &dyn Collective,
    group: Option<&CommGroup>,
    index: &MetadataIndex,
    loaded_files: &BTreeSet<String>,
) -> Result<LoadInfos> {
    let rank = comm.rank();
    let local: Vec<(LocalTensorIndex, (u32, String))> = index
        .metadata()
        .storage_metadata
        .iter()
        .filter(|(_, file)| loaded_files.contains(*file))
        .map(|(idx, file)| (idx.clone(), (rank, file.clone())))
        .collect();

    let mut load_infos = LoadInfos::new();
    for per_rank in all_gather_object(comm, &local, group)? {
        for (idx, info) in per_rank {
            if load_infos.contains_key(&idx) {
                return Err(PlanningError::DuplicateLoadInfo {
                    tensor: idx.tensor_key,
                    offset: idx.global_offset,
                }
                .into());
            }
            load_infos.insert(idx, info);
        }
    }
    Ok(load_infos)
}

/// Read items filling this rank's destination shards.
///
/// Tensors absent from the checkpoint produce no items.
///
/// # Errors
///
/// Returns [`PlanningError::MissingLoadInfo`] if an overlapping stored shard
/// was loaded by no rank.
pub fn plan_local_read_items(
    rank: u32,
    index: &MetadataIndex,
    targets: &[ShardDescriptor],
    load_infos: &LoadInfos,
) -> Result<Vec<ReadItem>> {
    let mut items = Vec::new();

    for target in targets {
        for stored in index.shards(&target.key) {
            if disjoint(target, stored) {
                continue;
            }
            let Some(region) = overlap(target, stored) else {
                continue;
            };

            let storage_index = LocalTensorIndex::for_meta(&target.key, stored);
            let (src_rank, file_name) =
                load_infos
                    .get(&storage_index)
                    .ok_or_else(|| PlanningError::MissingLoadInfo {
                        tensor: target.key.clone(),
                        offset: stored.global_offset.clone(),
                    })?;

            items.push(ReadItem {
                tensor_name: target.key.clone(),
                src_global_offset: stored.global_offset.clone(),
                dst_global_offset: target.global_offset.clone(),
                src_rank: *src_rank,
                dst_rank: vec![rank],
                src_local_offset: region.b_local_start,
                dst_local_offset: region.a_local_start,
                slice_shape: region.shape,
                file_name: file_name.clone(),
                dtype: stored.dtype,
                comm_group: None,
            });
        }
    }
    Ok(items)
}

/// Plans this rank's read items and gathers everyone's into one list.
pub fn get_read_items(
    comm: &dyn Collective,
    group: Option<&CommGroup>,
    index: &MetadataIndex,
    targets: &[ShardDescriptor],
    load_infos: &LoadInfos,
) -> Result<Vec<ReadItem>> {
    let local = plan_local_read_items(comm.rank(), index, targets, load_infos)?;
    debug!(count = local.len(), "planned local read items");

    let global: Vec<ReadItem> = all_gather_object(comm, &local, group)?
        .into_iter()
        .flatten()
        .collect();
    info!(count = global.len(), "gathered global read items");
    Ok(global)
}

/// Ranks of `group`, or of the whole world, in gather order.
pub(crate) fn member_ranks(comm: &dyn Collective, group: Option<&CommGroup>) -> Vec<u32> {
    match group {
        Some(group) => group.ranks().to_vec(),
        None => (0..comm.world_size()).collect(),
    }
}
