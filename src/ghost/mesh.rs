//! The local fragment of a distributed mesh.
//!
//! `MeshPartition` holds what the consistency layer needs and nothing
//! more: the cell-to-node relation in local indices, global ids for
//! cells and nodes, node coordinates, and the shared-entity tables the
//! distributed mesh construction produced. Ghost entities are appended
//! at the tail of every index space; the `real` prefix never moves.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::ghost::ownership::{EntityKind, OwnershipTable};
use crate::halo_error::MeshHaloError;
use crate::topology::graph::{Gid, GraphTopology};

/// Shared entities of one kind: which neighbor references which local
/// entity, the entities' global ids, and (for face/edge bridges) the
/// cell-to-entity adjacency in local indices.
pub struct SharedEntities {
    pub by_rank: BTreeMap<usize, BTreeSet<usize>>,
    pub entity_gid: Vec<Gid>,
    pub cell2entity: Option<GraphTopology>,
    g2l: HashMap<Gid, usize>,
}

impl SharedEntities {
    pub fn new(
        by_rank: BTreeMap<usize, BTreeSet<usize>>,
        entity_gid: Vec<Gid>,
        cell2entity: Option<GraphTopology>,
    ) -> Self {
        let g2l = entity_gid
            .iter()
            .enumerate()
            .map(|(l, &g)| (g, l))
            .collect();
        Self {
            by_rank,
            entity_gid,
            cell2entity,
            g2l,
        }
    }

    pub fn local_of(&self, gid: Gid) -> Option<usize> {
        self.g2l.get(&gid).copied()
    }
}

/// Coordinates and owner of a node mirrored from a remote rank.
#[derive(Clone, Copy, Debug)]
pub struct GhostNodeInfo {
    pub owner: usize,
    pub xyz: [f64; 3],
}

pub struct MeshPartition {
    dim: u32,
    my_rank: usize,
    cell2node: GraphTopology,
    cell_gid: Vec<Gid>,
    cell_g2l: HashMap<Gid, usize>,
    node_gid: Vec<Gid>,
    node_g2l: HashMap<Gid, usize>,
    coords: Vec<[f64; 3]>,
    n_real_cells: usize,
    n_real_nodes: usize,
    cell_owner: OwnershipTable,
    node_owner: OwnershipTable,
    shared: BTreeMap<EntityKind, SharedEntities>,
}

impl MeshPartition {
    /// Assemble the fragment from raw connectivity. `cell2node` must be
    /// finalized with local node indices as columns; `shared_nodes`
    /// lists, per neighbor rank, the local nodes that rank also
    /// references.
    pub fn new(
        dim: u32,
        cell2node: GraphTopology,
        cell_gid: Vec<Gid>,
        node_gid: Vec<Gid>,
        coords: Vec<[f64; 3]>,
        my_rank: usize,
        shared_nodes: BTreeMap<usize, BTreeSet<usize>>,
    ) -> Self {
        debug_assert!(cell2node.is_finalized());
        debug_assert!(!cell2node.is_global_id());
        debug_assert_eq!(cell2node.n_rows(), cell_gid.len());
        debug_assert_eq!(node_gid.len(), coords.len());
        let cell_g2l = cell_gid.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        let node_g2l = node_gid.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        let n_real_cells = cell_gid.len();
        let n_real_nodes = node_gid.len();
        let node_owner = OwnershipTable::classify(n_real_nodes, my_rank, &shared_nodes);
        let mut shared = BTreeMap::new();
        shared.insert(
            EntityKind::Node,
            SharedEntities::new(shared_nodes, node_gid.clone(), None),
        );
        Self {
            dim,
            my_rank,
            cell2node,
            cell_gid,
            cell_g2l,
            node_gid,
            node_g2l,
            coords,
            n_real_cells,
            n_real_nodes,
            cell_owner: OwnershipTable::interior(n_real_cells),
            node_owner,
            shared,
        }
    }

    /// Attach shared face/edge tables (with their cell adjacency) so the
    /// kind can serve as a ghost bridge.
    pub fn with_shared_entities(mut self, kind: EntityKind, entities: SharedEntities) -> Self {
        debug_assert!(kind != EntityKind::Node, "node tables are built by new()");
        self.shared.insert(kind, entities);
        self
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Owner of a node, the local rank for interior nodes.
    pub fn node_owner_or_self(&self, l: usize) -> usize {
        self.node_owner.owner(l).unwrap_or(self.my_rank)
    }

    /// Owner of a cell, the local rank for non-ghost cells.
    pub fn cell_owner_or_self(&self, l: usize) -> usize {
        self.cell_owner.owner(l).unwrap_or(self.my_rank)
    }

    pub fn n_cells(&self) -> usize {
        self.cell_gid.len()
    }

    pub fn n_real_cells(&self) -> usize {
        self.n_real_cells
    }

    pub fn n_nodes(&self) -> usize {
        self.node_gid.len()
    }

    pub fn n_real_nodes(&self) -> usize {
        self.n_real_nodes
    }

    pub fn cell2node(&self) -> &GraphTopology {
        &self.cell2node
    }

    pub fn cell_gids(&self) -> &[Gid] {
        &self.cell_gid
    }

    pub fn node_gids(&self) -> &[Gid] {
        &self.node_gid
    }

    pub fn coords(&self) -> &[[f64; 3]] {
        &self.coords
    }

    pub fn cell_local(&self, gid: Gid) -> Option<usize> {
        self.cell_g2l.get(&gid).copied()
    }

    pub fn node_local(&self, gid: Gid) -> Option<usize> {
        self.node_g2l.get(&gid).copied()
    }

    pub fn cell_ownership(&self) -> &OwnershipTable {
        &self.cell_owner
    }

    pub fn node_ownership(&self) -> &OwnershipTable {
        &self.node_owner
    }

    pub(crate) fn node_ownership_mut(&mut self) -> &mut OwnershipTable {
        &mut self.node_owner
    }

    pub fn shared(&self, kind: EntityKind) -> Option<&SharedEntities> {
        self.shared.get(&kind)
    }

    /// Neighbor ranks this fragment shares `kind` entities with.
    pub fn neighbors(&self, kind: EntityKind) -> Vec<usize> {
        self.shared
            .get(&kind)
            .map(|s| s.by_rank.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Cell-to-bridge adjacency for a ghost bridge kind.
    ///
    /// # Panics
    /// Panics if the kind's table was never attached (a usage error).
    pub fn cell2bridge(&self, kind: EntityKind) -> &GraphTopology {
        match kind {
            EntityKind::Node => &self.cell2node,
            _ => self
                .shared
                .get(&kind)
                .and_then(|s| s.cell2entity.as_ref())
                .expect("bridge kind has no cell adjacency attached"),
        }
    }

    /// Global id of a bridge entity.
    pub fn bridge_gid(&self, kind: EntityKind, local: usize) -> Gid {
        match kind {
            EntityKind::Node => self.node_gid[local],
            _ => self.shared[&kind].entity_gid[local],
        }
    }

    /// Local index of a bridge entity by global id.
    pub fn bridge_local(&self, kind: EntityKind, gid: Gid) -> Option<usize> {
        match kind {
            EntityKind::Node => self.node_local(gid),
            _ => self.shared.get(&kind).and_then(|s| s.local_of(gid)),
        }
    }

    /// Append received ghost cells. Each entry carries the cell's global
    /// id, its owner and its node gids; `nodes` supplies owner and
    /// coordinates for every node the receiver might not hold yet.
    /// Returns the new local cell indices, aligned with `cells`.
    pub fn add_ghost_cells(
        &mut self,
        cells: &[(Gid, usize, Vec<Gid>)],
        nodes: &HashMap<Gid, GhostNodeInfo>,
        from_rank: usize,
    ) -> Result<Vec<usize>, MeshHaloError> {
        let mut counts = Vec::with_capacity(cells.len());
        let mut cols: Vec<Gid> = Vec::new();
        let mut new_ids = Vec::with_capacity(cells.len());
        for (gid, owner, node_gids) in cells {
            debug_assert!(
                self.cell_local(*gid).is_none(),
                "ghost cell {gid} already present"
            );
            for &ng in node_gids {
                let local = match self.node_local(ng) {
                    Some(l) => l,
                    None => {
                        let info = nodes.get(&ng).ok_or(MeshHaloError::InconsistentTopology {
                            entity: ng,
                            rank: from_rank,
                        })?;
                        let l = self.node_gid.len();
                        self.node_gid.push(ng);
                        self.node_g2l.insert(ng, l);
                        self.coords.push(info.xyz);
                        self.node_owner.push_ghost(info.owner);
                        l
                    }
                };
                cols.push(local as Gid);
            }
            counts.push(node_gids.len());
            let l = self.cell_gid.len();
            self.cell_gid.push(*gid);
            self.cell_g2l.insert(*gid, l);
            self.cell_owner.push_ghost(*owner);
            new_ids.push(l);
        }
        self.cell2node.add_ghost_layer(&counts, &cols);
        Ok(new_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square_two_cells() -> MeshPartition {
        // two triangles over four nodes
        let c2n = GraphTopology::from_nested(&[vec![0, 1, 2], vec![1, 3, 2]]);
        let coords = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        let shared: BTreeMap<usize, BTreeSet<usize>> =
            BTreeMap::from([(1, BTreeSet::from([1, 3]))]);
        MeshPartition::new(2, c2n, vec![10, 11], vec![0, 1, 2, 3], coords, 0, shared)
    }

    #[test]
    fn construction_classifies_nodes() {
        let m = unit_square_two_cells();
        assert_eq!(m.n_real_cells(), 2);
        assert!(m.node_ownership().is_shared(1));
        assert_eq!(m.node_ownership().owner(1), Some(0));
        assert!(!m.node_ownership().is_shared(0));
    }

    #[test]
    fn ghost_cells_extend_the_tail() {
        let mut m = unit_square_two_cells();
        let mut nodes = HashMap::new();
        nodes.insert(9, GhostNodeInfo { owner: 1, xyz: [2.0, 0.0, 0.0] });
        let new = m
            .add_ghost_cells(&[(20, 1, vec![1, 9, 3])], &nodes, 1)
            .unwrap();
        assert_eq!(new, vec![2]);
        assert_eq!(m.n_cells(), 3);
        assert_eq!(m.n_real_cells(), 2);
        assert_eq!(m.n_nodes(), 5);
        assert!(m.cell_ownership().is_ghost(2));
        assert!(m.node_ownership().is_ghost(4));
        assert_eq!(m.node_local(9), Some(4));
        // the appended row references the resolved local node
        assert_eq!(m.cell2node().cols_of(2), &[1, 4, 3]);
    }

    #[test]
    fn missing_node_record_is_fatal() {
        let mut m = unit_square_two_cells();
        let err = m
            .add_ghost_cells(&[(21, 1, vec![1, 99])], &HashMap::new(), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            MeshHaloError::InconsistentTopology { entity: 99, rank: 1 }
        ));
    }
}
