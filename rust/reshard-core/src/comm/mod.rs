// rust/reshard-core/src/comm/mod.rs

//! Collective communication used by planning and data movement.
//!
//! The engine never talks to a transport directly. It consumes the
//! [`Collective`] trait; [`LocalMesh`] provides an in-process implementation
//! for tests and single-host runs and [`SoloCollective`] covers world size 1.

mod collective;
mod local;

pub use collective::{all_gather_object, CommGroup, Collective, SoloCollective};
pub use local::{LocalCollective, LocalMesh};
