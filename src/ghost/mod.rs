//! Ghost-region protocol: classification, interface record, and layer
//! construction.

pub mod interface;
pub mod layer;
pub mod mesh;
pub mod ownership;

pub use interface::MeshInterface;
pub use layer::{append_ghost_entities, create_ghost_layer, update_after_create_ghost};
pub use mesh::{GhostNodeInfo, MeshPartition, SharedEntities};
pub use ownership::{EntityClass, EntityKind, OwnershipTable, pick_owner};
