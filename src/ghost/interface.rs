//! Per-mesh interface record: which entities are shared or ghost, which
//! group each belongs to, and the group communicators built over them.
//!
//! Groups are registered while the ghost layer is under construction
//! (registration is local and communication-free), then the registry is
//! frozen by [`MeshInterface::create`] and communicators are built
//! lazily per entity kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::comm::communicator::{CommTag, Communicator};
use crate::debug_invariants::DebugInvariants;
use crate::ghost::ownership::EntityKind;
use crate::group::group_comm::GroupCommunicator;
use crate::group::proc_group::ProcGroup;
use crate::halo_error::MeshHaloError;
use crate::topology::graph::{Gid, GraphTopology};

#[derive(Clone, Copy, Debug)]
struct Assignment {
    group: usize,
    ghost: bool,
}

pub struct MeshInterface<C: Communicator + Clone> {
    my_rank: usize,
    registry: Option<ProcGroup>,
    groups: Option<Arc<ProcGroup>>,
    entities: BTreeMap<EntityKind, BTreeMap<usize, Assignment>>,
    shared_comms: BTreeMap<EntityKind, GroupCommunicator<C>>,
    ghost_comms: BTreeMap<EntityKind, GroupCommunicator<C>>,
    has_ghost: bool,
    ghost_elem_gid: Vec<Gid>,
    /// Per neighbor rank, the global ids of *that rank's* ghost copies
    /// of cells this rank owns.
    neighbor_ghosts: BTreeMap<usize, BTreeSet<Gid>>,
}

impl<C: Communicator + Clone> MeshInterface<C> {
    pub fn new(my_rank: usize) -> Self {
        let mut registry = ProcGroup::new(my_rank);
        registry.init();
        Self {
            my_rank,
            registry: Some(registry),
            groups: None,
            entities: BTreeMap::new(),
            shared_comms: BTreeMap::new(),
            ghost_comms: BTreeMap::new(),
            has_ghost: false,
            ghost_elem_gid: Vec::new(),
            neighbor_ghosts: BTreeMap::new(),
        }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    fn registry_mut(&mut self) -> &mut ProcGroup {
        self.registry
            .as_mut()
            .expect("interface already finalized; registration is closed")
    }

    /// Register every entity a neighbor also references, electing group
    /// masters deterministically.
    pub fn register_shared(
        &mut self,
        kind: EntityKind,
        by_rank: &BTreeMap<usize, BTreeSet<usize>>,
    ) {
        let my_rank = self.my_rank;
        let mut refs: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (&rank, ids) in by_rank {
            for &i in ids {
                refs.entry(i).or_default().insert(rank);
            }
        }
        for (i, mut members) in refs {
            members.insert(my_rank);
            let group = self.registry_mut().add_group_auto(&members);
            self.entities
                .entry(kind)
                .or_default()
                .insert(i, Assignment { group, ghost: false });
        }
    }

    /// Assign (or re-assign) one entity to the group of an explicit
    /// (member-set, master) pair. Used while ghost construction learns
    /// the full referencing sets.
    pub fn assign(
        &mut self,
        kind: EntityKind,
        local: usize,
        members: &BTreeSet<usize>,
        master: usize,
        ghost: bool,
    ) {
        let group = self.registry_mut().add_group(members, master);
        self.entities
            .entry(kind)
            .or_default()
            .insert(local, Assignment { group, ghost });
    }

    /// Freeze the registry. No registration is possible afterwards.
    pub fn create(&mut self, comm: &C, tag: CommTag) -> Result<(), MeshHaloError> {
        let mut registry = self
            .registry
            .take()
            .ok_or(MeshHaloError::GroupNotFinalized)?;
        registry.create(comm, tag)?;
        self.groups = Some(Arc::new(registry));
        self.debug_assert_invariants();
        Ok(())
    }

    pub fn groups(&self) -> &Arc<ProcGroup> {
        self.groups
            .as_ref()
            .expect("interface not finalized; call create() first")
    }

    pub fn is_created(&self) -> bool {
        self.groups.is_some()
    }

    pub fn group_of(&self, kind: EntityKind, local: usize) -> Option<usize> {
        self.entities
            .get(&kind)
            .and_then(|m| m.get(&local))
            .map(|a| a.group)
    }

    /// Shared (non-ghost) entities of a kind with their group ids, in
    /// local-index order.
    pub fn shared_list(&self, kind: EntityKind) -> (Vec<usize>, Vec<usize>) {
        self.list(kind, false)
    }

    /// Ghost entities of a kind with their group ids, in local-index
    /// order.
    pub fn ghost_list(&self, kind: EntityKind) -> (Vec<usize>, Vec<usize>) {
        self.list(kind, true)
    }

    fn list(&self, kind: EntityKind, ghost: bool) -> (Vec<usize>, Vec<usize>) {
        let mut ids = Vec::new();
        let mut groups = Vec::new();
        if let Some(m) = self.entities.get(&kind) {
            for (&i, a) in m {
                if a.ghost == ghost {
                    ids.push(i);
                    groups.push(a.group);
                }
            }
        }
        (ids, groups)
    }

    /// Group→ldof table for `kind`, with every group's entities sorted
    /// by global id so all ranks pack group buffers in the same order.
    fn gid_sorted_table(&self, kind: EntityKind, gids: &[Gid], ghosts: bool) -> GraphTopology {
        let n_groups = self.groups().n_groups();
        let mut rows: Vec<Vec<(Gid, usize)>> = vec![Vec::new(); n_groups];
        if let Some(m) = self.entities.get(&kind) {
            for (&i, a) in m {
                if ghosts || !a.ghost {
                    rows[a.group].push((gids[i], i));
                }
            }
        }
        let nested: Vec<Vec<Gid>> = rows
            .into_iter()
            .map(|mut r| {
                r.sort_unstable();
                r.into_iter().map(|(_, i)| i as Gid).collect()
            })
            .collect();
        GraphTopology::from_nested(&nested)
    }

    /// Communicator over the shared (non-ghost) entities of `kind`.
    /// `gids` maps every local entity of the kind to its global id.
    /// Built on first use.
    pub fn shared_comm(
        &mut self,
        kind: EntityKind,
        comm: &C,
        gids: &[Gid],
        base_tag: CommTag,
    ) -> &mut GroupCommunicator<C> {
        if !self.shared_comms.contains_key(&kind) {
            let tbl = self.gid_sorted_table(kind, gids, false);
            let mut gc = GroupCommunicator::new(self.groups().clone(), comm.clone(), base_tag);
            gc.set_group_ldof_table(tbl);
            self.shared_comms.insert(kind, gc);
        }
        self.shared_comms.get_mut(&kind).unwrap()
    }

    /// Communicator over *all* grouped entities of `kind`, ghost copies
    /// included. Built on first use.
    pub fn ghost_comm(
        &mut self,
        kind: EntityKind,
        comm: &C,
        gids: &[Gid],
        base_tag: CommTag,
    ) -> &mut GroupCommunicator<C> {
        if !self.ghost_comms.contains_key(&kind) {
            let tbl = self.gid_sorted_table(kind, gids, true);
            let mut gc = GroupCommunicator::new(self.groups().clone(), comm.clone(), base_tag);
            gc.set_group_ldof_table(tbl);
            self.ghost_comms.insert(kind, gc);
        }
        self.ghost_comms.get_mut(&kind).unwrap()
    }

    pub fn has_ghost(&self) -> bool {
        self.has_ghost
    }

    pub(crate) fn set_has_ghost(&mut self) {
        self.has_ghost = true;
    }

    /// Global ids of this rank's ghost cells, in append order.
    pub fn ghost_elem_gids(&self) -> &[Gid] {
        &self.ghost_elem_gid
    }

    pub(crate) fn push_ghost_elem(&mut self, gid: Gid) {
        self.ghost_elem_gid.push(gid);
    }

    /// Which of this rank's cells each neighbor mirrors.
    pub fn neighbor_ghosts(&self) -> &BTreeMap<usize, BTreeSet<Gid>> {
        &self.neighbor_ghosts
    }

    pub(crate) fn neighbor_ghosts_mut(&mut self) -> &mut BTreeMap<usize, BTreeSet<Gid>> {
        &mut self.neighbor_ghosts
    }

    /// Drop ghost bookkeeping so a layer can be rebuilt from scratch.
    /// Local indices are renumbered by the rebuild; stale lists must not
    /// survive it.
    pub fn clear_ghost_entities(&mut self) {
        for m in self.entities.values_mut() {
            m.retain(|_, a| !a.ghost);
        }
        self.ghost_comms.clear();
        self.ghost_elem_gid.clear();
        self.neighbor_ghosts.clear();
        self.has_ghost = false;
    }
}

impl<C: Communicator + Clone> DebugInvariants for MeshInterface<C> {
    fn validate_invariants(&self) -> Result<(), MeshHaloError> {
        let Some(groups) = &self.groups else {
            return Ok(());
        };
        for m in self.entities.values() {
            for a in m.values() {
                if a.ghost && groups.group_master_rank(a.group) == self.my_rank {
                    return Err(MeshHaloError::CorruptTable(
                        "ghost entity grouped under a local master",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;

    #[test]
    fn shared_registration_groups_by_rank_set() {
        let mut iface: MeshInterface<NoComm> = MeshInterface::new(0);
        let by_rank = BTreeMap::from([
            (1usize, BTreeSet::from([4usize, 5])),
            (2usize, BTreeSet::from([5usize])),
        ]);
        iface.register_shared(EntityKind::Node, &by_rank);
        // 4 -> {0,1}, 5 -> {0,1,2}: two distinct groups
        let g4 = iface.group_of(EntityKind::Node, 4).unwrap();
        let g5 = iface.group_of(EntityKind::Node, 5).unwrap();
        assert_ne!(g4, g5);
        let (ids, groups) = iface.shared_list(EntityKind::Node);
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(groups.len(), ids.len());
    }

    #[test]
    fn reassignment_replaces_the_group() {
        let mut iface: MeshInterface<NoComm> = MeshInterface::new(0);
        let by_rank = BTreeMap::from([(1usize, BTreeSet::from([7usize]))]);
        iface.register_shared(EntityKind::Node, &by_rank);
        let before = iface.group_of(EntityKind::Node, 7).unwrap();
        let wider = BTreeSet::from([0usize, 1, 2]);
        iface.assign(EntityKind::Node, 7, &wider, 1, false);
        let after = iface.group_of(EntityKind::Node, 7).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn ghost_lists_are_separate() {
        let mut iface: MeshInterface<NoComm> = MeshInterface::new(0);
        let members = BTreeSet::from([0usize, 1]);
        iface.assign(EntityKind::Cell, 3, &members, 1, true);
        iface.assign(EntityKind::Cell, 1, &members, 0, false);
        let (ghost_ids, _) = iface.ghost_list(EntityKind::Cell);
        let (shared_ids, _) = iface.shared_list(EntityKind::Cell);
        assert_eq!(ghost_ids, vec![3]);
        assert_eq!(shared_ids, vec![1]);
    }

    #[test]
    fn create_builds_serial_comms() {
        let mut iface: MeshInterface<NoComm> = MeshInterface::new(0);
        iface.create(&NoComm, CommTag::new(0x3500)).unwrap();
        let gids = [10, 11, 12, 13];
        let gc = iface.ghost_comm(EntityKind::Cell, &NoComm, &gids, CommTag::new(0x3600));
        assert_eq!(gc.group_topology().n_groups(), 1);
    }

    #[test]
    fn comm_tables_are_gid_sorted_within_groups() {
        let mut iface: MeshInterface<NoComm> = MeshInterface::new(0);
        let members = BTreeSet::from([0usize, 1]);
        iface.assign(EntityKind::Cell, 2, &members, 0, false);
        iface.assign(EntityKind::Cell, 0, &members, 0, false);
        iface.create(&NoComm, CommTag::new(0x3700)).unwrap();
        // entity 2 has the smaller gid, so it leads its group's row
        let gids = [50, 99, 40];
        let gc = iface.shared_comm(EntityKind::Cell, &NoComm, &gids, CommTag::new(0x3800));
        let tbl = gc.group_ldof_table();
        assert_eq!(tbl.cols_of(1), &[2, 0]);
    }
}
