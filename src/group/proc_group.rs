//! Registry of shared-entity process groups.
//!
//! Every shared or ghost entity is referenced by a set of ranks, one of
//! which is its master. Many entities share the same (rank-set, master)
//! pair — all nodes along one partition boundary, say — so the registry
//! collapses identical pairs into a single small group id. Registration
//! is communication-free; [`ProcGroup::create`] performs one neighbor
//! exchange to learn each group's id in its master's numbering, then
//! freezes the registry.

use std::collections::{BTreeMap, BTreeSet};

use crate::comm::communicator::{CommTag, Communicator, Wait};
use crate::comm::wire::{self, WireGroupId};
use crate::halo_error::MeshHaloError;

/// Deterministic master election: the lowest rank of the set. A pure
/// function of the set, so every member computes the same master with
/// no communication.
pub fn simplest_pick_owner(members: &BTreeSet<usize>) -> usize {
    *members.iter().next().expect("empty rank set")
}

#[derive(Debug, Default)]
pub struct ProcGroup {
    my_rank: usize,
    groups: Vec<BTreeSet<usize>>,
    master_rank: Vec<usize>,
    registry: BTreeMap<(Vec<usize>, usize), usize>,
    by_set: BTreeMap<Vec<usize>, usize>,
    // built by create()
    lproc2proc: Vec<usize>,
    group_lprocs: Vec<Vec<usize>>,
    master_lproc: Vec<usize>,
    group_master_gid: Vec<usize>,
    finalized: bool,
}

impl ProcGroup {
    pub fn new(my_rank: usize) -> Self {
        Self {
            my_rank,
            ..Self::default()
        }
    }

    /// Seed group 0: the singleton {self}, master = self.
    pub fn init(&mut self) {
        debug_assert!(self.groups.is_empty(), "init on a non-empty registry");
        let mut set = BTreeSet::new();
        set.insert(self.my_rank);
        self.add_group(&set, self.my_rank);
    }

    /// Register a group with an explicit master. A no-op returning the
    /// existing id when the (member-set, master) pair is already known.
    pub fn add_group(&mut self, members: &BTreeSet<usize>, master: usize) -> usize {
        debug_assert!(!self.finalized, "add_group after create");
        debug_assert!(members.contains(&master), "master not in member set");
        debug_assert!(members.contains(&self.my_rank), "calling rank not in member set");
        let key = (members.iter().copied().collect::<Vec<_>>(), master);
        if let Some(&g) = self.registry.get(&key) {
            return g;
        }
        let g = self.groups.len();
        self.by_set.entry(key.0.clone()).or_insert(g);
        self.registry.insert(key, g);
        self.groups.push(members.clone());
        self.master_rank.push(master);
        g
    }

    /// Register a group, electing the master by [`simplest_pick_owner`].
    /// Deduplicates on the member set alone.
    pub fn add_group_auto(&mut self, members: &BTreeSet<usize>) -> usize {
        if let Some(&g) = self
            .by_set
            .get(&members.iter().copied().collect::<Vec<_>>())
        {
            return g;
        }
        self.add_group(members, simplest_pick_owner(members))
    }

    /// Group registered for this member set, whatever its master.
    pub fn which_group(&self, members: &BTreeSet<usize>) -> Option<usize> {
        self.by_set
            .get(&members.iter().copied().collect::<Vec<_>>())
            .copied()
    }

    /// Group registered for this exact (member-set, master) pair.
    pub fn which_group_with_master(
        &self,
        members: &BTreeSet<usize>,
        master: usize,
    ) -> Option<usize> {
        self.registry
            .get(&(members.iter().copied().collect::<Vec<_>>(), master))
            .copied()
    }

    /// Finalize the registry: build the neighbor table, per-group member
    /// lists in local-neighbor ids, and each group's id in its master's
    /// numbering (one exchange round with every master/member pair).
    ///
    /// Local-neighbor id 0 is always the calling rank.
    pub fn create<C: Communicator>(
        &mut self,
        comm: &C,
        tag: CommTag,
    ) -> Result<(), MeshHaloError> {
        debug_assert!(!self.finalized, "create called twice");

        let mut neighbors: BTreeSet<usize> = BTreeSet::new();
        for g in &self.groups {
            neighbors.extend(g.iter().copied());
        }
        neighbors.remove(&self.my_rank);
        self.lproc2proc = std::iter::once(self.my_rank).chain(neighbors).collect();
        let proc2lproc: BTreeMap<usize, usize> = self
            .lproc2proc
            .iter()
            .enumerate()
            .map(|(l, &p)| (p, l))
            .collect();

        self.group_lprocs = self
            .groups
            .iter()
            .map(|set| {
                let mut lprocs: Vec<usize> = set.iter().map(|p| proc2lproc[p]).collect();
                lprocs.sort_unstable();
                lprocs
            })
            .collect();
        self.master_lproc = self
            .master_rank
            .iter()
            .map(|m| proc2lproc[m])
            .collect();

        // master-side group ids: groups a rank masters are ordered by
        // canonical member list on both sides, so only the ids travel
        self.group_master_gid = vec![0; self.groups.len()];
        let mut per_master: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (g, &m) in self.master_rank.iter().enumerate() {
            if self.groups[g].len() > 1 {
                per_master.entry(m).or_default().push(g);
            }
        }
        for gs in per_master.values_mut() {
            gs.sort_by(|&a, &b| self.groups[a].cmp(&self.groups[b]));
        }

        let mut recvs = Vec::new();
        for (&m, gs) in &per_master {
            if m == self.my_rank {
                continue;
            }
            let len = gs.len() * std::mem::size_of::<WireGroupId>();
            recvs.push((m, gs.clone(), comm.irecv(m, tag.as_u16(), len)));
        }
        let mut sends = Vec::new();
        let mut send_bufs = Vec::new();
        if let Some(mine) = per_master.get(&self.my_rank) {
            for &g in mine {
                self.group_master_gid[g] = g;
            }
            // every other member of a group I master learns my id for it
            let mut per_member: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for &g in mine {
                for &p in &self.groups[g] {
                    if p != self.my_rank {
                        per_member.entry(p).or_default().push(g);
                    }
                }
            }
            for (p, gs) in per_member {
                let recs: Vec<WireGroupId> = gs.iter().map(|&g| WireGroupId::of(g)).collect();
                sends.push(comm.isend(p, tag.as_u16(), wire::cast_slice(&recs)));
                send_bufs.push(recs);
            }
        }
        for s in sends {
            let _ = s.wait();
        }
        for (m, gs, h) in recvs {
            let data = h.wait().ok_or_else(|| MeshHaloError::CommError {
                neighbor: m,
                source: format!("no master group ids from rank {m}").into(),
            })?;
            let ids: &[WireGroupId] = wire::cast_slice_from(&data);
            if ids.len() != gs.len() {
                return Err(MeshHaloError::PayloadSizeMismatch {
                    neighbor: m,
                    expected: gs.len() * std::mem::size_of::<WireGroupId>(),
                    got: data.len(),
                });
            }
            for (&g, id) in gs.iter().zip(ids) {
                self.group_master_gid[g] = id.get();
            }
        }

        self.finalized = true;
        log::debug!(
            "proc groups on rank {}: {} groups, {} neighbors",
            self.my_rank,
            self.groups.len(),
            self.lproc2proc.len() - 1
        );
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Number of groups.
    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Number of neighbors, the local processor included.
    pub fn n_neighbors(&self) -> usize {
        self.lproc2proc.len()
    }

    /// MPI rank of local neighbor `i` (0 is the calling rank).
    pub fn neighbor_rank(&self, i: usize) -> usize {
        self.lproc2proc[i]
    }

    /// True if the calling rank is master of group `g`.
    pub fn is_master(&self, g: usize) -> bool {
        self.master_lproc[g] == 0
    }

    /// Local-neighbor id of the master of group `g`.
    pub fn group_master(&self, g: usize) -> usize {
        self.master_lproc[g]
    }

    /// Rank of the master of group `g`.
    pub fn group_master_rank(&self, g: usize) -> usize {
        self.lproc2proc[self.master_lproc[g]]
    }

    /// Group `g`'s id in its master's own numbering.
    pub fn group_master_gid(&self, g: usize) -> usize {
        self.group_master_gid[g]
    }

    /// Number of ranks in group `g`.
    pub fn group_size(&self, g: usize) -> usize {
        self.groups[g].len()
    }

    /// Members of group `g` as local-neighbor ids, ascending (so the
    /// calling rank leads).
    pub fn group_lprocs(&self, g: usize) -> &[usize] {
        &self.group_lprocs[g]
    }

    /// Members of group `g` as ranks.
    pub fn group_rank_set(&self, g: usize) -> &BTreeSet<usize> {
        &self.groups[g]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::{NoComm, RayonComm};
    use serial_test::serial;

    fn set(ranks: &[usize]) -> BTreeSet<usize> {
        ranks.iter().copied().collect()
    }

    #[test]
    fn pick_owner_is_lowest_rank() {
        assert_eq!(simplest_pick_owner(&set(&[3, 1, 7])), 1);
        assert_eq!(simplest_pick_owner(&set(&[0])), 0);
    }

    #[test]
    fn registration_dedups() {
        let mut pg = ProcGroup::new(0);
        pg.init();
        let a = pg.add_group(&set(&[0, 2]), 0);
        let b = pg.add_group(&set(&[0, 2]), 0);
        let c = pg.add_group(&set(&[0, 2]), 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pg.which_group(&set(&[0, 2])), Some(a));
        assert_eq!(pg.which_group_with_master(&set(&[0, 2]), 2), Some(c));
        assert_eq!(pg.which_group(&set(&[0, 5])), None);
    }

    #[test]
    fn auto_master_ignores_master_on_dedup() {
        let mut pg = ProcGroup::new(2);
        pg.init();
        let a = pg.add_group(&set(&[1, 2]), 2);
        let b = pg.add_group_auto(&set(&[1, 2]));
        assert_eq!(a, b);
    }

    #[test]
    fn create_serial_registry() {
        let mut pg = ProcGroup::new(0);
        pg.init();
        pg.create(&NoComm, CommTag::new(0x3000)).unwrap();
        assert_eq!(pg.n_groups(), 1);
        assert_eq!(pg.n_neighbors(), 1);
        assert!(pg.is_master(0));
        assert_eq!(pg.group_master_rank(0), 0);
        assert_eq!(pg.group_master_gid(0), 0);
    }

    #[test]
    #[serial]
    fn create_exchanges_master_gids() {
        RayonComm::reset_mailbox();
        let tag = CommTag::new(0x3100);

        // rank 1 registers the shared pair group after an unrelated one,
        // so its local id for it differs from rank 0's
        let t = std::thread::spawn(move || {
            let comm = RayonComm::new(1, 2);
            let mut pg = ProcGroup::new(1);
            pg.init();
            let g = pg.add_group(&set(&[0, 1]), 0);
            pg.create(&comm, tag).unwrap();
            (g, pg.group_master_gid(g), pg.is_master(g), pg.group_master_rank(g))
        });

        let comm = RayonComm::new(0, 2);
        let mut pg = ProcGroup::new(0);
        pg.init();
        let g0 = pg.add_group(&set(&[0, 1]), 0);
        pg.create(&comm, tag).unwrap();

        let (g1, master_gid, is_master, master_rank) = t.join().unwrap();
        assert!(pg.is_master(g0));
        assert!(!is_master);
        assert_eq!(master_rank, 0);
        // rank 1 addresses the group by rank 0's numbering
        assert_eq!(master_gid, g0);
        assert_eq!(pg.group_master_gid(g0), g0);
        assert_eq!(g1, 1);
    }
}
