// rust/reshard-core/src/lib.rs

//! Distributed Checkpoint Resharding - Core Library
//!
//! This crate saves sharded tensors from a group of ranks and loads them back
//! under a different sharding layout, moving only the bytes each rank needs.
//! It provides shard geometry, checkpoint storage, load planning,
//! communication scheduling and execution over a pluggable collective layer.

pub mod config;
pub mod error;
pub mod tensor;

// Re-export commonly used types for convenience
pub use config::{CheckpointConfig, FileAssignment, LoadConfig, ReshardConfig, StorageConfig};
pub use error::{PlanningError, ReshardError, Result, ShardingError};
pub use tensor::{DType, Device, Tensor};

pub mod storage;
pub use storage::{LocalStorage, StorageBackend};

pub mod comm;
pub use comm::{CommGroup, Collective, LocalMesh, SoloCollective};

pub mod shard;
pub use shard::{
    FlatRange, Metadata, Placement, ProcessMesh, ShardDescriptor, ShardedStateDict,
    ShardedTensor, TensorKey,
};

pub mod checkpoint;
pub use checkpoint::{CheckpointReader, CheckpointWriter};

pub mod plan;
pub mod schedule;
pub mod transfer;

pub mod engine;
pub use engine::{
    reshard_sharded_state_dict, CheckpointLoader, CheckpointSaver, FullParamGather, LoadReport,
    ReshardOptions, SaveReport,
};
