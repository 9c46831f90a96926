//! Interior / shared / ghost classification and owner election.
//!
//! Every entity referenced by more than one rank gets an owner, elected
//! by the same deterministic rule everywhere ([`pick_owner`], lowest
//! rank) so no communication is needed to agree. Ghost entities arrive
//! later and are appended with the owner their sender reported.

use std::collections::{BTreeMap, BTreeSet};

pub use crate::group::proc_group::simplest_pick_owner as pick_owner;

/// Mesh entity dimension class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum EntityKind {
    Node,
    Edge,
    Face,
    Cell,
}

/// Who may read and who writes an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityClass {
    /// Referenced only by the local rank.
    Interior,
    /// Referenced by several ranks, the local rank among the owners.
    Shared,
    /// Read-only local mirror of an entity owned elsewhere.
    Ghost,
}

/// Per-entity class and owner; ghosts occupy the tail.
#[derive(Clone, Debug, Default)]
pub struct OwnershipTable {
    class: Vec<EntityClass>,
    owner: Vec<Option<usize>>,
}

impl OwnershipTable {
    /// Classify `n_local` entities given, per neighbor rank, the set of
    /// local entities that rank also references.
    pub fn classify(
        n_local: usize,
        my_rank: usize,
        shared_by_rank: &BTreeMap<usize, BTreeSet<usize>>,
    ) -> Self {
        let mut class = vec![EntityClass::Interior; n_local];
        let mut owner = vec![None; n_local];
        let mut refs: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (&rank, ids) in shared_by_rank {
            for &i in ids {
                debug_assert!(i < n_local, "shared entity id out of range");
                refs.entry(i).or_default().insert(rank);
            }
        }
        for (i, mut ranks) in refs {
            ranks.insert(my_rank);
            class[i] = EntityClass::Shared;
            owner[i] = Some(pick_owner(&ranks));
        }
        Self { class, owner }
    }

    pub fn interior(n_local: usize) -> Self {
        Self {
            class: vec![EntityClass::Interior; n_local],
            owner: vec![None; n_local],
        }
    }

    /// Append one ghost entity owned by `owner`.
    pub fn push_ghost(&mut self, owner: usize) {
        self.class.push(EntityClass::Ghost);
        self.owner.push(Some(owner));
    }

    pub fn len(&self) -> usize {
        self.class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class.is_empty()
    }

    pub fn class(&self, i: usize) -> EntityClass {
        self.class[i]
    }

    pub fn owner(&self, i: usize) -> Option<usize> {
        self.owner[i]
    }

    pub fn is_shared(&self, i: usize) -> bool {
        self.class[i] == EntityClass::Shared
    }

    pub fn is_ghost(&self, i: usize) -> bool {
        self.class[i] == EntityClass::Ghost
    }

    /// Promote an interior entity to shared once a remote referencer
    /// appears (ghost-layer growth can widen sharing after the fact).
    pub fn promote_shared(&mut self, i: usize, owner: usize) {
        debug_assert!(self.class[i] != EntityClass::Ghost);
        self.class[i] = EntityClass::Shared;
        self.owner[i] = Some(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(usize, &[usize])]) -> BTreeMap<usize, BTreeSet<usize>> {
        entries
            .iter()
            .map(|&(r, ids)| (r, ids.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn classify_splits_interior_and_shared() {
        // entities 1 and 2 also referenced by rank 1; entity 2 by rank 2 too
        let t = OwnershipTable::classify(4, 0, &map(&[(1, &[1, 2]), (2, &[2])]));
        assert_eq!(t.class(0), EntityClass::Interior);
        assert_eq!(t.class(1), EntityClass::Shared);
        assert_eq!(t.owner(1), Some(0));
        assert_eq!(t.owner(2), Some(0));
        assert_eq!(t.owner(3), None);
    }

    #[test]
    fn owner_is_lowest_referencing_rank() {
        let t = OwnershipTable::classify(1, 3, &map(&[(1, &[0]), (5, &[0])]));
        assert_eq!(t.owner(0), Some(1));
    }

    #[test]
    fn ghosts_append_at_tail() {
        let mut t = OwnershipTable::classify(2, 0, &map(&[]));
        t.push_ghost(4);
        assert_eq!(t.len(), 3);
        assert!(t.is_ghost(2));
        assert_eq!(t.owner(2), Some(4));
    }
}
