// rust/reshard-core/src/engine/mod.rs

//! Execution layer: everything that moves tensor bytes.
//!
//! - [`CheckpointSaver`] writes a sharded state dict as a checkpoint
//! - [`CheckpointLoader`] loads any checkpoint into any sharded layout
//! - [`reshard_sharded_state_dict`] converts between layouts in memory
//! - [`FullParamGather`] streams full tensors to every rank
//!
//! All of them plan with [`crate::plan`], schedule with [`crate::schedule`]
//! and run the result through the [`Executor`].

mod executor;
mod gather;
mod loader;
mod release;
mod reshard;
mod saver;
mod unflatten;

pub use executor::{
    copy_local, destination_map, target_descriptors, Destinations, EpochReport, Executor,
    SourceTensors,
};
pub use gather::FullParamGather;
pub use loader::{CheckpointLoader, LoadReport};
pub use release::ReleaseTracker;
pub use reshard::{reshard_sharded_state_dict, virtual_file_name, ReshardOptions};
pub use saver::{CheckpointSaver, SaveReport};
pub use unflatten::{
    expand_flattened_targets, restore_flattened_sources, virtual_tensor_name, FlattenedTargets,
};
