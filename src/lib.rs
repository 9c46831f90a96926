//! # mesh-halo
//!
//! mesh-halo is the partitioned-mesh consistency layer of an
//! unstructured-mesh HPC code: it lets many MPI ranks each own a
//! fragment of a mesh yet behave, for numerical purposes, as if they
//! shared one consistent global mesh.
//!
//! ## Pieces
//! - [`topology::GraphTopology`]: mutable-then-frozen sparse boolean
//!   relations (cell-to-node, node-to-cell, ...) in compressed-row
//!   form, with transpose / boolean-product algebra and row
//!   redistribution.
//! - [`group::ProcGroup`]: registry of shared-entity process groups
//!   with deterministic master election.
//! - [`group::GroupCommunicator`]: buffered, non-blocking
//!   broadcast-from-master and reduce-to-master over those groups.
//! - [`ghost`]: interior/shared/ghost classification and the protocol
//!   that builds and extends the ghost layer.
//!
//! ## Execution model
//! Classic SPMD: one thread per rank, no intra-rank threading. Every
//! `*_begin` posts non-blocking traffic; the matching `*_end` is the
//! only blocking point and must eventually run on every participating
//! rank. Communication backends plug in through
//! [`comm::Communicator`] — serial ([`comm::NoComm`]), in-process
//! ([`comm::RayonComm`], one simulated rank per thread), or MPI
//! (`MpiComm`, behind the `mpi-support` feature).
//!
//! ## Failure philosophy
//! Usage errors (push after finalize, Begin while an exchange is in
//! flight) are programming defects: debug-asserted, never reported.
//! Partition inconsistencies abort the run through
//! [`halo_error::MeshHaloError`] — a half-synchronized ghost layer is
//! worse than a crash.

pub mod comm;
pub mod debug_invariants;
pub mod ghost;
pub mod group;
pub mod halo_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// The most-used traits and types in one import.
pub mod prelude {
    pub use crate::comm::{CommTag, Communicator, NoComm, RayonComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::ghost::{
        EntityClass, EntityKind, MeshInterface, MeshPartition, SharedEntities,
        create_ghost_layer,
    };
    pub use crate::group::{GroupCommunicator, Layout, ProcGroup, ReduceOp};
    pub use crate::halo_error::MeshHaloError;
    pub use crate::topology::{Gid, GraphTopology, mult, transpose};
}
