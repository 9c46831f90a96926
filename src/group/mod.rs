//! Shared-entity process groups and group collectives.

pub mod group_comm;
pub mod proc_group;

pub use group_comm::{CommScalar, GroupCommunicator, Layout, ReduceOp};
pub use proc_group::{ProcGroup, simplest_pick_owner};
