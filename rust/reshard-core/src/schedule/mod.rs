// rust/reshard-core/src/schedule/mod.rs

//! Communication scheduling for planned read items.
//!
//! With a single group every broadcast runs on the world, one batch per
//! tensor. With several groups each item runs on the smallest group holding
//! its ranks, and groups are batched by a conflict coloring so rank-disjoint
//! groups proceed together.

mod coloring;
mod scheduler;

pub use coloring::{dsatur, validate_coloring, Coloring, ConflictGraph};
pub use scheduler::{
    find_min_group, schedule_multi_group, schedule_single_group, split_read_items, Batch,
    EpochSchedule, Stage,
};
