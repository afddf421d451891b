// rust/reshard-core/src/shard/descriptor.rs

//! Shard descriptors and sharded tensors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ReshardError, Result, ShardingError};
use crate::tensor::{numel, DType, Tensor};

/// Anything occupying an axis-aligned box of a global tensor.
pub trait ShardExtent {
    fn global_offset(&self) -> &[u64];
    fn local_shape(&self) -> &[u64];
}

/// Describes one rectangular piece of a logically global tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub key: String,
    pub local_shape: Vec<u64>,
    pub global_shape: Vec<u64>,
    pub global_offset: Vec<u64>,
    pub dtype: DType,
}

impl ShardDescriptor {
    pub fn new(
        key: impl Into<String>,
        local_shape: Vec<u64>,
        global_shape: Vec<u64>,
        global_offset: Vec<u64>,
        dtype: DType,
    ) -> Self {
        Self {
            key: key.into(),
            local_shape,
            global_shape,
            global_offset,
            dtype,
        }
    }

    /// Descriptor of a whole, unsharded tensor.
    pub fn unsharded(key: impl Into<String>, global_shape: Vec<u64>, dtype: DType) -> Self {
        let offset = vec![0; global_shape.len()];
        Self::new(key, global_shape.clone(), global_shape, offset, dtype)
    }

    pub fn rank(&self) -> usize {
        self.global_shape.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.global_shape.is_empty()
    }

    pub fn numel(&self) -> u64 {
        numel(&self.local_shape)
    }

    pub fn check_rank(&self) -> std::result::Result<(), ShardingError> {
        let rank = self.global_shape.len();
        if self.local_shape.len() != rank || self.global_offset.len() != rank {
            return Err(ShardingError::RankMismatch {
                key: self.key.clone(),
                local: self.local_shape.len(),
                global: rank,
                offset: self.global_offset.len(),
            });
        }
        Ok(())
    }

    /// Verifies the shard is non-empty and lies inside the global shape.
    pub fn check_bounds(&self) -> std::result::Result<(), ShardingError> {
        self.check_rank()?;
        for d in 0..self.rank() {
            let offset = self.global_offset[d];
            let length = self.local_shape[d];
            let global = self.global_shape[d];
            let past_end = offset.checked_add(length).map_or(true, |end| end > global);
            if length == 0 || offset >= global || past_end {
                return Err(ShardingError::OutOfBounds {
                    key: self.key.clone(),
                    dim: d,
                    offset,
                    length,
                    global,
                });
            }
        }
        Ok(())
    }
}

impl ShardExtent for ShardDescriptor {
    fn global_offset(&self) -> &[u64] {
        &self.global_offset
    }

    fn local_shape(&self) -> &[u64] {
        &self.local_shape
    }
}

/// Half-open run `[start, end)` of flat, row-major element positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlatRange {
    pub start: u64,
    pub end: u64,
}

impl FlatRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key of an entry in a sharded state dict.
///
/// A rank usually holds one shard per tensor and uses `Simple`. When it holds
/// several shards of the same tensor they are told apart by offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TensorKey {
    Simple(String),
    Sharded(String, Vec<u64>),
}

impl TensorKey {
    pub fn name(&self) -> &str {
        match self {
            TensorKey::Simple(name) | TensorKey::Sharded(name, _) => name,
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, TensorKey::Sharded(..))
    }

    /// The same key pointing at a different tensor name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        match self {
            TensorKey::Simple(_) => TensorKey::Simple(name.into()),
            TensorKey::Sharded(_, offset) => TensorKey::Sharded(name.into(), offset.clone()),
        }
    }
}

impl From<&str> for TensorKey {
    fn from(name: &str) -> Self {
        TensorKey::Simple(name.to_string())
    }
}

impl From<String> for TensorKey {
    fn from(name: String) -> Self {
        TensorKey::Simple(name)
    }
}

impl fmt::Display for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorKey::Simple(name) => f.write_str(name),
            TensorKey::Sharded(name, offset) => write!(f, "{name}@{offset:?}"),
        }
    }
}

/// Descriptor plus whether the shard is flattened; exchanged during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub desc: ShardDescriptor,
    pub is_flattened: bool,
}

/// A shard descriptor together with the rank-local buffer holding its data.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedTensor {
    pub desc: ShardDescriptor,
    pub tensor: Tensor,
    /// Present when `tensor` is only the flat run of the N-D local shard.
    pub flattened_range: Option<FlatRange>,
}

impl ShardedTensor {
    /// # Errors
    ///
    /// Returns an error if the buffer does not match the descriptor's local
    /// shape or dtype.
    pub fn new(desc: ShardDescriptor, tensor: Tensor) -> Result<Self> {
        if tensor.shape() != desc.local_shape.as_slice() || tensor.dtype() != desc.dtype {
            return Err(ReshardError::tensor(format!(
                "buffer {:?}/{} does not match shard '{}' {:?}/{}",
                tensor.shape(),
                tensor.dtype(),
                desc.key,
                desc.local_shape,
                desc.dtype
            )));
        }
        Ok(Self {
            desc,
            tensor,
            flattened_range: None,
        })
    }

    /// A flattened shard: `tensor` is the 1-D run `range` of the local shard.
    pub fn flattened(desc: ShardDescriptor, tensor: Tensor, range: FlatRange) -> Result<Self> {
        if range.end > desc.numel() || tensor.shape() != [range.len()] || tensor.dtype() != desc.dtype
        {
            return Err(ReshardError::tensor(format!(
                "flat run {:?} with buffer {:?} does not fit shard '{}' {:?}",
                range,
                tensor.shape(),
                desc.key,
                desc.local_shape
            )));
        }
        Ok(Self {
            desc,
            tensor,
            flattened_range: Some(range),
        })
    }

    pub fn key(&self) -> &str {
        &self.desc.key
    }

    pub fn is_flattened(&self) -> bool {
        self.flattened_range.is_some()
    }

    pub fn info(&self) -> ShardInfo {
        ShardInfo {
            desc: self.desc.clone(),
            is_flattened: self.is_flattened(),
        }
    }
}

pub type ShardedStateDict = BTreeMap<TensorKey, ShardedTensor>;

/// Rejects state dicts mixing `Simple` and `Sharded` keys.
pub fn check_key_variants(state_dict: &ShardedStateDict) -> Result<()> {
    let sharded = state_dict.keys().filter(|k| k.is_sharded()).count();
    if sharded != 0 && sharded != state_dict.len() {
        return Err(ReshardError::config(
            "state dict mixes plain and offset-qualified tensor keys",
        ));
    }
    Ok(())
}
