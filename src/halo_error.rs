//! MeshHaloError: unified error type for mesh-halo public APIs.
//!
//! Only *recoverable-by-reporting* failures live here: communication
//! failures and distributed-topology inconsistencies that must abort the
//! run with a diagnosable message. Usage errors (push after finalize,
//! querying unsorted rows, beginning an exchange while another is in
//! flight) are programming defects and are handled with `debug_assert!`
//! or `panic!` at the call site, never through this enum.

use thiserror::Error;

use crate::topology::Gid;

/// Unified error type for mesh-halo operations.
#[derive(Debug, Error)]
pub enum MeshHaloError {
    /// A point-to-point exchange with a neighbor rank failed.
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A message arrived with a different size than the matching
    /// size-exchange round announced.
    #[error("payload from rank {neighbor}: expected {expected} bytes, got {got}")]
    PayloadSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// A remote rank referenced an entity this rank has no record of.
    /// Continuing would silently corrupt every downstream kernel, so the
    /// caller is expected to abort the run.
    #[error("inconsistent distributed topology: entity {entity} has no local match on rank {rank}")]
    InconsistentTopology { entity: Gid, rank: usize },
    /// A ghost request named an entity the claimed owner does not hold.
    #[error("ghost request for entity {entity} rejected: rank {rank} is not its owner")]
    MissingRemoteEntity { entity: Gid, rank: usize },
    /// The process-group registry was used before `create()` finalized it.
    #[error("process group registry not finalized; call create() first")]
    GroupNotFinalized,
    /// A shared entity has no recorded owner (partition bug upstream).
    #[error("shared entity {entity} has no recorded owner on rank {rank}")]
    MissingOwner { entity: Gid, rank: usize },
    /// An internal table violated its structural invariants.
    #[error("corrupt table: {0}")]
    CorruptTable(&'static str),
}
