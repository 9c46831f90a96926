//! Sparse relation storage and boolean graph algebra.

pub mod algebra;
pub mod counts;
pub mod exchange;
pub mod graph;

pub use algebra::{mult, transpose, transpose_vec};
pub use counts::EntityCounts;
pub use graph::{Connection, Gid, GraphTopology, INVALID_GID};
