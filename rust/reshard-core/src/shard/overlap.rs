// rust/reshard-core/src/shard/overlap.rs

use super::descriptor::ShardExtent;

/// Intersection of two shards in global coordinates, plus where it starts
/// inside each shard's local buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapRegion {
    pub global_offset: Vec<u64>,
    pub shape: Vec<u64>,
    pub a_local_start: Vec<u64>,
    pub b_local_start: Vec<u64>,
}

/// Computes the intersection of two axis-aligned shards.
///
/// Returns `None` as soon as one dimension has an empty intersection. Rank-0
/// shards always intersect with an empty region.
pub fn overlap<A, B>(a: &A, b: &B) -> Option<OverlapRegion>
where
    A: ShardExtent + ?Sized,
    B: ShardExtent + ?Sized,
{
    let (a_off, a_shape) = (a.global_offset(), a.local_shape());
    let (b_off, b_shape) = (b.global_offset(), b.local_shape());
    if a_off.len() != b_off.len() {
        return None;
    }

    let rank = a_off.len();
    let mut region = OverlapRegion {
        global_offset: Vec::with_capacity(rank),
        shape: Vec::with_capacity(rank),
        a_local_start: Vec::with_capacity(rank),
        b_local_start: Vec::with_capacity(rank),
    };

    for d in 0..rank {
        let lo = a_off[d].max(b_off[d]);
        let hi = (a_off[d] + a_shape[d]).min(b_off[d] + b_shape[d]);
        if lo >= hi {
            return None;
        }
        region.global_offset.push(lo);
        region.shape.push(hi - lo);
        region.a_local_start.push(lo - a_off[d]);
        region.b_local_start.push(lo - b_off[d]);
    }

    Some(region)
}

/// Bounding-box rejection test: true when the shards cannot intersect.
pub fn disjoint<A, B>(a: &A, b: &B) -> bool
where
    A: ShardExtent + ?Sized,
    B: ShardExtent + ?Sized,
{
    let (a_off, a_shape) = (a.global_offset(), a.local_shape());
    let (b_off, b_shape) = (b.global_offset(), b.local_shape());
    a_off.len() != b_off.len()
        || (0..a_off.len()).any(|d| {
            a_off[d] + a_shape[d] <= b_off[d] || b_off[d] + b_shape[d] <= a_off[d]
        })
}
