//! Message-passing façade and wire framing.

pub mod communicator;
pub mod size_exchange;
pub mod wire;

pub use communicator::{CommTag, Communicator, GhostCommTags, NoComm, RayonComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
pub use size_exchange::exchange_sizes_symmetric;
