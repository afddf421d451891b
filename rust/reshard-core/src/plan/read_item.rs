// rust/reshard-core/src/plan/read_item.rs

//! The unit of planned data movement.

use serde::{Deserialize, Serialize};

use crate::comm::CommGroup;
use crate::tensor::{numel, DType};

/// Copies `slice_shape` elements of a stored shard into a destination shard.
///
/// Offsets come in pairs: the `*_global_offset` fields identify the source
/// and destination shards, the `*_local_offset` fields locate the region
/// inside each of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadItem {
    pub tensor_name: String,
    pub src_global_offset: Vec<u64>,
    pub dst_global_offset: Vec<u64>,
    /// Rank holding the source bytes after file reads.
    pub src_rank: u32,
    /// Sorted, de-duplicated receiving ranks.
    pub dst_rank: Vec<u32>,
    pub src_local_offset: Vec<u64>,
    pub dst_local_offset: Vec<u64>,
    pub slice_shape: Vec<u64>,
    pub file_name: String,
    pub dtype: DType,
    pub comm_group: Option<CommGroup>,
}

/// Total order used to make schedules identical on every rank.
pub type OrderKey<'a> = (
    &'a str,
    u32,
    &'a [u64],
    &'a [u32],
    &'a [u64],
    &'a [u64],
    &'a [u64],
    &'a [u64],
    &'a str,
    DType,
);

/// Everything but the destination ranks.
pub type MergeKey<'a> = (
    &'a [u64],
    &'a [u64],
    u32,
    &'a [u64],
    &'a [u64],
    &'a [u64],
    &'a str,
    DType,
);

impl ReadItem {
    pub fn order_key(&self) -> OrderKey<'_> {
        (
            &self.tensor_name,
            self.src_rank,
            &self.src_global_offset,
            &self.dst_rank,
            &self.dst_local_offset,
            &self.dst_global_offset,
            &self.src_local_offset,
            &self.slice_shape,
            &self.file_name,
            self.dtype,
        )
    }

    pub fn merge_key(&self) -> MergeKey<'_> {
        (
            &self.src_global_offset,
            &self.dst_global_offset,
            self.src_rank,
            &self.dst_local_offset,
            &self.src_local_offset,
            &self.slice_shape,
            &self.file_name,
            self.dtype,
        )
    }

    /// Source and destinations are the same single rank.
    pub fn is_local(&self) -> bool {
        self.dst_rank.len() == 1 && self.dst_rank[0] == self.src_rank
    }

    /// Every rank that must take part in moving this item.
    pub fn need_ranks(&self) -> Vec<u32> {
        let mut ranks = self.dst_rank.clone();
        ranks.push(self.src_rank);
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }

    pub fn numel(&self) -> u64 {
        numel(&self.slice_shape)
    }

    pub fn nbytes(&self) -> usize {
        self.numel() as usize * self.dtype.size()
    }
}

/// Sorts items by [`ReadItem::order_key`].
pub fn sort_items(items: &mut [ReadItem]) {
    items.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}
