// rust/reshard-core/src/shard/placement.rs

//! Derives shard descriptors from a process mesh and per-mesh-dim placements.

use serde::{Deserialize, Serialize};

use super::descriptor::{ShardDescriptor, ShardedTensor};
use crate::error::{ReshardError, Result};
use crate::tensor::Tensor;

/// How a tensor is laid out along one mesh dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Replicate,
    /// Split along the given tensor dimension.
    Shard(usize),
}

/// N-D arrangement of ranks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMesh {
    shape: Vec<u64>,
    process_ids: Vec<u32>,
}

impl ProcessMesh {
    pub fn new(shape: Vec<u64>, process_ids: Vec<u32>) -> Result<Self> {
        if shape.iter().product::<u64>() != process_ids.len() as u64 {
            return Err(ReshardError::config(format!(
                "mesh shape {shape:?} does not hold {} processes",
                process_ids.len()
            )));
        }
        Ok(Self { shape, process_ids })
    }

    /// A 1-D mesh over ranks `0..world_size`.
    pub fn linear(world_size: u32) -> Self {
        Self {
            shape: vec![u64::from(world_size)],
            process_ids: (0..world_size).collect(),
        }
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn process_ids(&self) -> &[u32] {
        &self.process_ids
    }

    /// Mesh coordinate of `rank`, or `None` if it is not part of the mesh.
    pub fn coordinate(&self, rank: u32) -> Option<Vec<u64>> {
        let pos = self.process_ids.iter().position(|&p| p == rank)? as u64;
        let mut coord = vec![0u64; self.shape.len()];
        let mut rest = pos;
        for d in (0..self.shape.len()).rev() {
            coord[d] = rest % self.shape[d];
            rest /= self.shape[d];
        }
        Some(coord)
    }
}

/// Splits `total` into `parts` ceil-sized chunks; trailing chunks may be short or empty.
pub fn balanced_split(total: u64, parts: u64) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let chunk = total.div_ceil(parts);
    (0..parts)
        .map(|i| chunk.min(total.saturating_sub(i * chunk)))
        .collect()
}

/// Local shape and global offset of `rank`'s piece of a tensor.
///
/// Mesh dimensions are applied in order, so several mesh dims sharding the
/// same tensor dim nest. Returns `Ok(None)` for ranks outside the mesh.
pub fn local_shape_and_offset(
    global_shape: &[u64],
    mesh: &ProcessMesh,
    placements: &[Placement],
    rank: u32,
) -> Result<Option<(Vec<u64>, Vec<u64>)>> {
    if placements.len() != mesh.shape.len() {
        return Err(ReshardError::config(format!(
            "{} placements given for a {}-D mesh",
            placements.len(),
            mesh.shape.len()
        )));
    }
    let Some(coord) = mesh.coordinate(rank) else {
        return Ok(None);
    };

    let mut local = global_shape.to_vec();
    let mut offset = vec![0u64; global_shape.len()];
    for (mesh_dim, placement) in placements.iter().enumerate() {
        let Placement::Shard(dim) = *placement else {
            continue;
        };
        if dim >= global_shape.len() {
            return Err(ReshardError::config(format!(
                "placement shards dim {dim} of a {}-D tensor",
                global_shape.len()
            )));
        }
        let chunks = balanced_split(local[dim], mesh.shape[mesh_dim]);
        let idx = coord[mesh_dim] as usize;
        offset[dim] += chunks[..idx].iter().sum::<u64>();
        local[dim] = chunks[idx];
    }
    Ok(Some((local, offset)))
}

/// Cuts `rank`'s shard out of a full tensor.
pub fn shard_full_tensor(
    key: &str,
    full: &Tensor,
    mesh: &ProcessMesh,
    placements: &[Placement],
    rank: u32,
) -> Result<Option<ShardedTensor>> {
    let Some((local, offset)) = local_shape_and_offset(full.shape(), mesh, placements, rank)?
    else {
        return Ok(None);
    };
    let data = full.slice(&offset, &local)?;
    let desc = ShardDescriptor::new(key, local, full.shape().to_vec(), offset, full.dtype());
    ShardedTensor::new(desc, data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_split() {
        assert_eq!(balanced_split(8, 4), vec![2, 2, 2, 2]);
        assert_eq!(balanced_split(10, 4), vec![3, 3, 3, 1]);
        assert_eq!(balanced_split(5, 4), vec![2, 2, 1, 0]);
        assert!(balanced_split(5, 0).is_empty());
    }

    #[test]
    fn test_mesh_coordinates() {
        let mesh = ProcessMesh::new(vec![2, 3], vec![10, 11, 12, 13, 14, 15]).unwrap();
        assert_eq!(mesh.coordinate(10), Some(vec![0, 0]));
        assert_eq!(mesh.coordinate(14), Some(vec![1, 1]));
        assert_eq!(mesh.coordinate(99), None);
        assert!(ProcessMesh::new(vec![2, 2], vec![0, 1, 2]).is_err());
    }

    #[test]
    fn test_shard_and_replicate() {
        let mesh = ProcessMesh::new(vec![2, 2], vec![0, 1, 2, 3]).unwrap();
        let placements = [Placement::Shard(0), Placement::Replicate];

        let (local, offset) = local_shape_and_offset(&[8, 6], &mesh, &placements, 3)
            .unwrap()
            .unwrap();
        assert_eq!(local, vec![4, 6]);
        assert_eq!(offset, vec![4, 0]);
    }

    #[test]
    fn test_nested_sharding_same_dim() {
        let mesh = ProcessMesh::new(vec![2, 2], vec![0, 1, 2, 3]).unwrap();
        let placements = [Placement::Shard(0), Placement::Shard(0)];

        let offsets: Vec<u64> = (0..4)
            .map(|rank| {
                local_shape_and_offset(&[8], &mesh, &placements, rank)
                    .unwrap()
                    .unwrap()
                    .1[0]
            })
            .collect();
        assert_eq!(offsets, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_rank_outside_mesh() {
        let mesh = ProcessMesh::linear(2);
        let result = local_shape_and_offset(&[4], &mesh, &[Placement::Shard(0)], 5).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_shard_full_tensor() {
        let full = Tensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mesh = ProcessMesh::linear(2);

        let shard = shard_full_tensor("v", &full, &mesh, &[Placement::Shard(0)], 1)
            .unwrap()
            .unwrap();

        assert_eq!(shard.desc.global_offset, vec![2]);
        assert_eq!(shard.tensor.to_f32_vec().unwrap(), vec![3.0, 4.0]);
    }
}
