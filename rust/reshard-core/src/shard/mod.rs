// rust/reshard-core/src/shard/mod.rs

//! Shard geometry: descriptors, checkpoint metadata, overlap computation,
//! layout validation, mesh placement and flat-run index arithmetic.

mod descriptor;
pub mod integrity;
mod metadata;
mod overlap;
pub mod placement;
pub mod unflatten;

pub use descriptor::{
    check_key_variants, FlatRange, ShardDescriptor, ShardExtent, ShardInfo, ShardedStateDict,
    ShardedTensor, TensorKey,
};
pub use integrity::ShardLayout;
pub use metadata::{LocalTensorIndex, LocalTensorMetadata, Metadata, MetadataIndex};
pub use overlap::{disjoint, overlap, OverlapRegion};
pub use placement::{Placement, ProcessMesh};
