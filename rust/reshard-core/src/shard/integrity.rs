// rust/reshard-core/src/shard/integrity.rs

//! Layout validation run before any data moves.
//!
//! Source layouts must tile their global shape exactly. Destination layouts
//! only need every shard to be in bounds: a rank may legitimately hold a
//! partial view. Both sides must agree on global shape and dtype per tensor,
//! and flattened shards are rejected here because resharding works on N-D
//! boxes.

use std::collections::{BTreeMap, BTreeSet};

use super::descriptor::{ShardDescriptor, ShardInfo};
use super::metadata::Metadata;
use crate::error::ShardingError;

type Check = std::result::Result<(), ShardingError>;

/// Every shard of every tensor, as gathered from all ranks.
pub type ShardLayout = BTreeMap<String, Vec<ShardInfo>>;

/// Merges per-rank shard lists into one layout keyed by tensor name.
pub fn layout_from_gathered(per_rank: Vec<Vec<ShardInfo>>) -> ShardLayout {
    let mut layout = ShardLayout::new();
    for infos in per_rank {
        for info in infos {
            layout.entry(info.desc.key.clone()).or_default().push(info);
        }
    }
    layout
}

/// Stored shards as N-D boxes; flat runs count as the shard they belong to.
pub fn layout_from_metadata(metadata: &Metadata) -> ShardLayout {
    metadata
        .state_dict_metadata
        .iter()
        .map(|(key, metas)| {
            let infos = metas
                .iter()
                .map(|meta| ShardInfo {
                    desc: meta.to_descriptor(key.clone()),
                    is_flattened: false,
                })
                .collect();
            (key.clone(), infos)
        })
        .collect()
}

/// Checks that `shards` tile `global_shape` with no gap and no partial overlap.
///
/// Exact duplicates (replicas of the same box) count once.
pub fn check_coverage(key: &str, global_shape: &[u64], shards: &[ShardDescriptor]) -> Check {
    if shards.is_empty() {
        return Err(ShardingError::NoShards {
            key: key.to_string(),
        });
    }
    for shard in shards {
        shard.check_rank()?;
        if shard.rank() != global_shape.len() {
            return Err(ShardingError::InconsistentShape {
                key: key.to_string(),
                expected: global_shape.to_vec(),
                found: shard.global_shape.clone(),
            });
        }
    }
    let boxes: BTreeSet<(&[u64], &[u64])> = shards
        .iter()
        .map(|s| (s.global_offset.as_slice(), s.local_shape.as_slice()))
        .collect();
    let boxes: Vec<_> = boxes.into_iter().collect();
    check_cover(key, &boxes, global_shape, 0)
}

fn check_cover(key: &str, boxes: &[(&[u64], &[u64])], global: &[u64], dim: usize) -> Check {
    if dim == global.len() {
        return Ok(());
    }

    let mut groups: BTreeMap<(u64, u64), Vec<(&[u64], &[u64])>> = BTreeMap::new();
    for &(offset, shape) in boxes {
        let end = offset[dim]
            .checked_add(shape[dim])
            .ok_or_else(|| ShardingError::OutOfBounds {
                key: key.to_string(),
                dim,
                offset: offset[dim],
                length: shape[dim],
                global: global[dim],
            })?;
        groups
            .entry((offset[dim], end))
            .or_default()
            .push((offset, shape));
    }

    let mut pos = 0u64;
    for &(start, end) in groups.keys() {
        if start > pos {
            return Err(ShardingError::Gap {
                key: key.to_string(),
                dim,
                start: pos,
                end: start,
            });
        }
        if start < pos {
            return Err(ShardingError::Overlap {
                key: key.to_string(),
                dim,
                start,
                end: pos.min(end),
            });
        }
        pos = end;
    }
    if pos < global[dim] {
        return Err(ShardingError::Gap {
            key: key.to_string(),
            dim,
            start: pos,
            end: global[dim],
        });
    }
    if pos > global[dim] {
        return Err(ShardingError::OutOfBounds {
            key: key.to_string(),
            dim,
            offset: 0,
            length: pos,
            global: global[dim],
        });
    }

    for group in groups.values() {
        check_cover(key, group, global, dim + 1)?;
    }
    Ok(())
}

/// All shards of a tensor agree on global shape and dtype and none is flattened.
pub fn check_consistency(key: &str, infos: &[ShardInfo]) -> Check {
    let first = infos.first().ok_or_else(|| ShardingError::NoShards {
        key: key.to_string(),
    })?;
    for info in infos {
        if info.is_flattened {
            return Err(ShardingError::FlattenedShard {
                key: key.to_string(),
            });
        }
        info.desc.check_rank()?;
        if info.desc.global_shape != first.desc.global_shape {
            return Err(ShardingError::InconsistentShape {
                key: key.to_string(),
                expected: first.desc.global_shape.clone(),
                found: info.desc.global_shape.clone(),
            });
        }
        if info.desc.dtype != first.desc.dtype {
            return Err(ShardingError::InconsistentDtype {
                key: key.to_string(),
                expected: first.desc.dtype,
                found: info.desc.dtype,
            });
        }
    }
    Ok(())
}

pub fn check_boundaries(infos: &[ShardInfo]) -> Check {
    infos.iter().try_for_each(|info| info.desc.check_bounds())
}

/// Consistency, bounds and full coverage for every tensor of a source layout.
pub fn validate_source_layout(layout: &ShardLayout) -> Check {
    for (key, infos) in layout {
        check_consistency(key, infos)?;
        check_boundaries(infos)?;
        let descs: Vec<ShardDescriptor> = infos.iter().map(|i| i.desc.clone()).collect();
        check_coverage(key, &infos[0].desc.global_shape, &descs)?;
    }
    Ok(())
}

/// Consistency and bounds for every tensor of a destination layout.
pub fn validate_target_layout(layout: &ShardLayout) -> Check {
    for (key, infos) in layout {
        check_consistency(key, infos)?;
        check_boundaries(infos)?;
    }
    Ok(())
}

/// Every destination tensor exists in the source with the same global shape.
pub fn check_compatibility(source: &ShardLayout, target: &ShardLayout) -> Check {
    let missing: Vec<String> = target
        .keys()
        .filter(|key| !source.contains_key(*key))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ShardingError::MissingSource { keys: missing });
    }

    for (key, dst_infos) in target {
        let (Some(src), Some(dst)) = (source[key].first(), dst_infos.first()) else {
            continue;
        };
        if src.desc.global_shape != dst.desc.global_shape {
            return Err(ShardingError::InconsistentShape {
                key: key.clone(),
                expected: src.desc.global_shape.clone(),
                found: dst.desc.global_shape.clone(),
            });
        }
    }
    Ok(())
}
