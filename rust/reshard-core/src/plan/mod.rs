// rust/reshard-core/src/plan/mod.rs

//! Load planning: which rank reads which file, and which bytes move where.

mod balancer;
mod planner;
mod read_item;

pub use balancer::{
    balance_read_files, create_assigner, BalancedAssigner, FileAssigner, RankFiles,
    VisibilityAssigner,
};
pub use planner::{
    get_load_infos, get_read_items, master_weight_alias, plan_files, plan_local_read_items,
    resolve_names, FilePlan, LoadInfos,
};
pub use read_item::{sort_items, MergeKey, OrderKey, ReadItem};
