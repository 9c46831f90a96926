//! Buffered, non-blocking collectives over shared-entity groups.
//!
//! A `GroupCommunicator` drives two collective patterns across the
//! groups of a [`ProcGroup`]:
//!
//! * **update** (broadcast): every shared/ghost copy ends up holding the
//!   master's value — master-authoritative replication, not a merge;
//! * **reduce**: the master folds every member's contribution with a
//!   commutative, associative operator.
//!
//! Both split into a `*_begin` that posts non-blocking traffic and a
//! `*_end` that waits and applies. At most one operation may be in
//! flight per communicator; the three-state lock makes a violation a
//! loud failure instead of silent buffer corruption. Between Begin and
//! End the caller may do unrelated work, but the matching End must
//! eventually run on every participating rank or the run deadlocks —
//! there is no timeout or cancellation.
//!
//! Per-group messages are tagged `base_tag + group-id-in-master`, so
//! groups between the same rank pair never mix; within one group the
//! single-outstanding-operation rule guarantees the payload seen at
//! `update_end` is exactly what the master sent in the matching
//! `update_begin`.

use std::sync::Arc;

use bytemuck::Pod;

use crate::comm::communicator::{CommTag, Communicator, Wait};
use crate::halo_error::MeshHaloError;
use crate::group::proc_group::ProcGroup;
use crate::topology::graph::{Gid, GraphTopology};

/// Index space a per-entity data array is addressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// Dense over all local entities (ghosts included); positions come
    /// from the group→ldof table columns.
    All,
    /// Dense over the concatenated shared-entity ordering; positions are
    /// the group→ldof table slots themselves.
    Shared,
    /// Dense over true (owned, non-duplicated) entities; positions come
    /// from the group→ltdof table columns.
    True,
}

/// Lock state: at most one collective in flight per communicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommState {
    Idle,
    Broadcast,
    Reduce,
}

/// Associative, commutative fold applied by the master at `reduce_end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    BitOr,
}

/// Element types that can travel through group collectives.
pub trait CommScalar:
    Pod + num_traits::NumAssign + PartialOrd + Send + Sync + 'static
{
    /// Bitwise OR; only defined for integer data.
    fn bit_or_assign(&mut self, _other: Self) {
        panic!("bitwise OR reduction requires integer data");
    }
}

macro_rules! int_comm_scalar {
    ($($t:ty),*) => {$(
        impl CommScalar for $t {
            fn bit_or_assign(&mut self, other: Self) {
                *self |= other;
            }
        }
    )*};
}
int_comm_scalar!(i32, i64, u32, u64);

impl CommScalar for f32 {}
impl CommScalar for f64 {}

impl ReduceOp {
    pub fn fold<T: CommScalar>(self, acc: &mut T, v: T) {
        match self {
            ReduceOp::Sum => *acc += v,
            ReduceOp::Min => {
                if v < *acc {
                    *acc = v;
                }
            }
            ReduceOp::Max => {
                if v > *acc {
                    *acc = v;
                }
            }
            ReduceOp::BitOr => acc.bit_or_assign(v),
        }
    }
}

struct PendingRecv<H> {
    group: usize,
    peer: usize,
    handle: H,
    expected: usize,
}

/// Collective engine over the groups of one [`ProcGroup`].
pub struct GroupCommunicator<C: Communicator> {
    gtopo: Arc<ProcGroup>,
    comm: C,
    base_tag: CommTag,
    group_ldof: GraphTopology,
    group_ltdof: Option<GraphTopology>,
    /// Per-group receive staging, exclusively owned by the communicator.
    group_buf: Vec<Vec<u8>>,
    state: CommState,
    pending_sends: Vec<C::SendHandle>,
    pending_recvs: Vec<PendingRecv<C::RecvHandle>>,
}

impl<C: Communicator> GroupCommunicator<C> {
    /// The communicator is unusable until [`Self::create`] (or
    /// [`Self::create_shared`]) has built the group→ldof table.
    pub fn new(gtopo: Arc<ProcGroup>, comm: C, base_tag: CommTag) -> Self {
        debug_assert!(gtopo.is_finalized(), "ProcGroup not finalized");
        Self {
            gtopo,
            comm,
            base_tag,
            group_ldof: GraphTopology::new(),
            group_ltdof: None,
            group_buf: Vec::new(),
            state: CommState::Idle,
            pending_sends: Vec::new(),
            pending_recvs: Vec::new(),
        }
    }

    /// Initialize from a local-dof → group map (`ldof_group[i]` is the
    /// group of entity `i`; group 0 entities are interior and never
    /// communicated). Buffers are allocated internally.
    pub fn create(&mut self, ldof_group: &[usize]) {
        let n_groups = self.gtopo.n_groups();
        let mut tbl = GraphTopology::new();
        tbl.make_i(n_groups);
        for &g in ldof_group {
            if g != 0 {
                tbl.add_a_column_in_row(g);
            }
        }
        tbl.make_j();
        for (i, &g) in ldof_group.iter().enumerate() {
            if g != 0 {
                tbl.add_connection(g, i as Gid);
            }
        }
        tbl.shift_up_i();
        self.group_ldof = tbl;
        self.finalize();
    }

    /// Initialize from a shared-entity → group map plus the shared
    /// entities' local indices (`shared_ids[s]` is the local index of
    /// shared entity `s`).
    pub fn create_shared(&mut self, sldof_group: &[usize], shared_ids: &[usize]) {
        debug_assert_eq!(sldof_group.len(), shared_ids.len());
        let n_groups = self.gtopo.n_groups();
        let mut tbl = GraphTopology::new();
        tbl.make_i(n_groups);
        for &g in sldof_group {
            if g != 0 {
                tbl.add_a_column_in_row(g);
            }
        }
        tbl.make_j();
        for (s, &g) in sldof_group.iter().enumerate() {
            if g != 0 {
                tbl.add_connection(g, shared_ids[s] as Gid);
            }
        }
        tbl.shift_up_i();
        self.group_ldof = tbl;
        self.finalize();
    }

    /// Install a pre-built group→ldof table. Callers that need a
    /// particular within-group ordering (e.g. sorted by global id so
    /// every rank packs buffers identically) build the table themselves.
    pub fn set_group_ldof_table(&mut self, tbl: GraphTopology) {
        debug_assert!(tbl.is_finalized());
        debug_assert_eq!(tbl.n_rows(), self.gtopo.n_groups());
        self.group_ldof = tbl;
        self.finalize();
    }

    /// Allocate the per-group buffer arena once the ldof table is set.
    pub fn finalize(&mut self) {
        self.group_buf = vec![Vec::new(); self.gtopo.n_groups()];
    }

    /// Enable [`Layout::True`]: `ldof_ltdof[i]` maps each local entity
    /// to its true-dof index, [`crate::topology::INVALID_GID`] for
    /// duplicates.
    pub fn build_ltdof_table(&mut self, ldof_ltdof: &[Gid]) {
        let mut t = self.group_ldof.clone();
        for c in t.col_mut() {
            *c = ldof_ltdof[*c as usize];
        }
        self.group_ltdof = Some(t);
    }

    pub fn group_topology(&self) -> &ProcGroup {
        &self.gtopo
    }

    pub fn group_ldof_table(&self) -> &GraphTopology {
        &self.group_ldof
    }

    fn n_ldofs(&self, g: usize) -> usize {
        let cpr = self.group_ldof.cpr_row_slice();
        cpr[g + 1] - cpr[g]
    }

    fn group_tag(&self, g: usize) -> u16 {
        self.base_tag
            .offset(self.gtopo.group_master_gid(g) as u16)
            .as_u16()
    }

    /// Copy the entries of group `g` from `ldata` into `buf`
    /// (`buf.len() == n_ldofs(g) * length`).
    fn copy_group_to_buffer<T: CommScalar>(
        &self,
        ldata: &[T],
        buf: &mut [T],
        g: usize,
        layout: Layout,
        length: usize,
    ) {
        let cpr = self.group_ldof.cpr_row_slice();
        let (b, e) = (cpr[g], cpr[g + 1]);
        match layout {
            Layout::All => {
                for (k, &ldof) in self.group_ldof.col_slice()[b..e].iter().enumerate() {
                    let src = ldof as usize * length;
                    buf[k * length..(k + 1) * length]
                        .copy_from_slice(&ldata[src..src + length]);
                }
            }
            Layout::Shared => {
                buf.copy_from_slice(&ldata[b * length..e * length]);
            }
            Layout::True => {
                let ltdof = self
                    .group_ltdof
                    .as_ref()
                    .expect("Layout::True before build_ltdof_table");
                for (k, &tdof) in ltdof.col_slice()[b..e].iter().enumerate() {
                    debug_assert!(tdof >= 0, "duplicated entity in true-dof layout");
                    let src = tdof as usize * length;
                    buf[k * length..(k + 1) * length]
                        .copy_from_slice(&ldata[src..src + length]);
                }
            }
        }
    }

    /// Copy the entries of group `g` from `buf` back into `ldata`.
    fn copy_group_from_buffer<T: CommScalar>(
        &self,
        buf: &[T],
        ldata: &mut [T],
        g: usize,
        layout: Layout,
        length: usize,
    ) {
        let cpr = self.group_ldof.cpr_row_slice();
        let (b, e) = (cpr[g], cpr[g + 1]);
        match layout {
            Layout::All => {
                for (k, &ldof) in self.group_ldof.col_slice()[b..e].iter().enumerate() {
                    let dst = ldof as usize * length;
                    ldata[dst..dst + length]
                        .copy_from_slice(&buf[k * length..(k + 1) * length]);
                }
            }
            Layout::Shared => {
                ldata[b * length..e * length].copy_from_slice(buf);
            }
            Layout::True => {
                let ltdof = self
                    .group_ltdof
                    .as_ref()
                    .expect("Layout::True before build_ltdof_table");
                for (k, &tdof) in ltdof.col_slice()[b..e].iter().enumerate() {
                    debug_assert!(tdof >= 0, "duplicated entity in true-dof layout");
                    let dst = tdof as usize * length;
                    ldata[dst..dst + length]
                        .copy_from_slice(&buf[k * length..(k + 1) * length]);
                }
            }
        }
    }

    /// Begin a broadcast within each group where the master is the root.
    ///
    /// # Panics
    /// Panics if another collective is already in flight.
    pub fn update_begin<T: CommScalar>(&mut self, ldata: &[T], layout: Layout, length: usize) {
        assert_eq!(
            self.state,
            CommState::Idle,
            "update_begin while a collective is in flight"
        );
        self.state = CommState::Broadcast;
        for g in 1..self.gtopo.n_groups() {
            let nl = self.n_ldofs(g);
            if nl == 0 {
                continue;
            }
            let bytes = nl * length * std::mem::size_of::<T>();
            if self.gtopo.is_master(g) {
                let mut scratch = vec![T::zero(); nl * length];
                self.copy_group_to_buffer(ldata, &mut scratch, g, layout, length);
                let tag = self.group_tag(g);
                for &lproc in self.gtopo.group_lprocs(g) {
                    if lproc == 0 {
                        continue;
                    }
                    let peer = self.gtopo.neighbor_rank(lproc);
                    self.pending_sends.push(self.comm.isend(
                        peer,
                        tag,
                        bytemuck::cast_slice(&scratch),
                    ));
                }
            } else {
                let peer = self.gtopo.group_master_rank(g);
                let handle = self.comm.irecv(peer, self.group_tag(g), bytes);
                self.pending_recvs.push(PendingRecv {
                    group: g,
                    peer,
                    handle,
                    expected: bytes,
                });
            }
        }
    }

    /// Finalize a broadcast: wait for all posted traffic and write the
    /// master's values into `ldata` for every non-master group. The
    /// element type, layout family and `length` must match the Begin.
    pub fn update_end<T: CommScalar>(
        &mut self,
        ldata: &mut [T],
        layout: Layout,
        length: usize,
    ) -> Result<(), MeshHaloError> {
        assert_eq!(
            self.state,
            CommState::Broadcast,
            "update_end without matching update_begin"
        );
        for s in self.pending_sends.drain(..) {
            let _ = s.wait();
        }
        for pr in std::mem::take(&mut self.pending_recvs) {
            let g = pr.group;
            let peer = pr.peer;
            let data = pr.handle.wait().ok_or_else(|| MeshHaloError::CommError {
                neighbor: peer,
                source: format!("broadcast payload for group {g} lost").into(),
            })?;
            if data.len() != pr.expected {
                return Err(MeshHaloError::PayloadSizeMismatch {
                    neighbor: peer,
                    expected: pr.expected,
                    got: data.len(),
                });
            }
            self.group_buf[g] = data;
            let vals: Vec<T> = bytemuck::pod_collect_to_vec(&self.group_buf[g]);
            self.copy_group_from_buffer(&vals, ldata, g, layout, length);
        }
        self.state = CommState::Idle;
        Ok(())
    }

    /// Broadcast within each group where the master is the root.
    pub fn update<T: CommScalar>(
        &mut self,
        ldata: &mut [T],
        layout: Layout,
        length: usize,
    ) -> Result<(), MeshHaloError> {
        self.update_begin(ldata, layout, length);
        self.update_end(ldata, layout, length)
    }

    /// Begin a reduction toward each group's master. The input is
    /// addressed as [`Layout::All`].
    ///
    /// # Panics
    /// Panics if another collective is already in flight.
    pub fn reduce_begin<T: CommScalar>(&mut self, ldata: &[T], length: usize) {
        assert_eq!(
            self.state,
            CommState::Idle,
            "reduce_begin while a collective is in flight"
        );
        self.state = CommState::Reduce;
        for g in 1..self.gtopo.n_groups() {
            let nl = self.n_ldofs(g);
            if nl == 0 {
                continue;
            }
            let bytes = nl * length * std::mem::size_of::<T>();
            let tag = self.group_tag(g);
            if self.gtopo.is_master(g) {
                for &lproc in self.gtopo.group_lprocs(g) {
                    if lproc == 0 {
                        continue;
                    }
                    let peer = self.gtopo.neighbor_rank(lproc);
                    let handle = self.comm.irecv(peer, tag, bytes);
                    self.pending_recvs.push(PendingRecv {
                        group: g,
                        peer,
                        handle,
                        expected: bytes,
                    });
                }
            } else {
                let mut scratch = vec![T::zero(); nl * length];
                self.copy_group_to_buffer(ldata, &mut scratch, g, Layout::All, length);
                let peer = self.gtopo.group_master_rank(g);
                self.pending_sends
                    .push(self.comm.isend(peer, tag, bytemuck::cast_slice(&scratch)));
            }
        }
    }

    fn reduce_wait<T: CommScalar>(&mut self) -> Result<Vec<(usize, Vec<T>)>, MeshHaloError> {
        for s in self.pending_sends.drain(..) {
            let _ = s.wait();
        }
        let mut chunks = Vec::new();
        for pr in std::mem::take(&mut self.pending_recvs) {
            let g = pr.group;
            let data = pr.handle.wait().ok_or_else(|| MeshHaloError::CommError {
                neighbor: pr.peer,
                source: format!("reduction payload for group {g} lost").into(),
            })?;
            if data.len() != pr.expected {
                return Err(MeshHaloError::PayloadSizeMismatch {
                    neighbor: pr.peer,
                    expected: pr.expected,
                    got: data.len(),
                });
            }
            chunks.push((g, bytemuck::pod_collect_to_vec(&data)));
        }
        Ok(chunks)
    }

    /// Finalize a reduction, folding every member's contribution into
    /// `ldata` at master groups ([`Layout::All`] addressing). Non-master
    /// entries are left untouched. Arrival order does not matter: `op`
    /// is associative and commutative.
    ///
    /// `ldata` must be the same logical array handed to
    /// [`Self::reduce_begin`]; the master's own contribution is read
    /// from it here.
    pub fn reduce_end<T: CommScalar>(
        &mut self,
        ldata: &mut [T],
        length: usize,
        op: ReduceOp,
    ) -> Result<(), MeshHaloError> {
        assert_eq!(
            self.state,
            CommState::Reduce,
            "reduce_end without matching reduce_begin"
        );
        let chunks = self.reduce_wait::<T>()?;
        let cpr = self.group_ldof.cpr_row_slice().to_vec();
        for (g, chunk) in chunks {
            let (b, e) = (cpr[g], cpr[g + 1]);
            for (k, &ldof) in self.group_ldof.col_slice()[b..e].iter().enumerate() {
                let dst = ldof as usize * length;
                for c in 0..length {
                    op.fold(&mut ldata[dst + c], chunk[k * length + c]);
                }
            }
        }
        self.state = CommState::Idle;
        Ok(())
    }

    /// Finalize a reduction into a true-dof array instead: targets come
    /// from the group→ltdof table, so ghost slots that a following
    /// broadcast would overwrite anyway are never touched. The master's
    /// own contribution is read from `tdata`, which must hold the same
    /// master-group values as the array handed to
    /// [`Self::reduce_begin`].
    pub fn reduce_end_true<T: CommScalar>(
        &mut self,
        tdata: &mut [T],
        length: usize,
        op: ReduceOp,
    ) -> Result<(), MeshHaloError> {
        assert_eq!(
            self.state,
            CommState::Reduce,
            "reduce_end_true without matching reduce_begin"
        );
        let ltdof = self
            .group_ltdof
            .as_ref()
            .expect("reduce_end_true before build_ltdof_table");
        let cpr = ltdof.cpr_row_slice().to_vec();
        let cols = ltdof.col_slice().to_vec();
        let chunks = self.reduce_wait::<T>()?;
        for (g, chunk) in chunks {
            let (b, e) = (cpr[g], cpr[g + 1]);
            for (k, &tdof) in cols[b..e].iter().enumerate() {
                debug_assert!(tdof >= 0, "duplicated entity in true-dof layout");
                let dst = tdof as usize * length;
                for c in 0..length {
                    op.fold(&mut tdata[dst + c], chunk[k * length + c]);
                }
            }
        }
        self.state = CommState::Idle;
        Ok(())
    }

    /// Reduce within each group where the master is the root.
    pub fn reduce<T: CommScalar>(
        &mut self,
        ldata: &mut [T],
        length: usize,
        op: ReduceOp,
    ) -> Result<(), MeshHaloError> {
        self.reduce_begin(ldata, length);
        self.reduce_end(ldata, length, op)
    }
}

impl<C: Communicator> Drop for GroupCommunicator<C> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.state == CommState::Idle,
                "GroupCommunicator dropped with a collective in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::{CommTag, NoComm};
    use std::collections::BTreeSet;

    fn two_rank_group() -> Arc<ProcGroup> {
        let mut pg = ProcGroup::new(0);
        pg.init();
        let members: BTreeSet<usize> = [0usize, 1].into_iter().collect();
        pg.add_group(&members, 0);
        pg.create(&NoComm, CommTag::new(0x3300)).unwrap();
        Arc::new(pg)
    }

    fn gc() -> GroupCommunicator<NoComm> {
        let mut gc = GroupCommunicator::new(two_rank_group(), NoComm, CommTag::new(0x3400));
        // entities 1 and 3 of five belong to the shared group
        gc.create(&[0, 1, 0, 1, 0]);
        gc
    }

    #[test]
    fn ldof_table_collects_group_members() {
        let gc = gc();
        let cpr = gc.group_ldof_table().cpr_row_slice();
        assert_eq!(cpr, &[0, 0, 2]);
        assert_eq!(gc.group_ldof_table().col_slice(), &[1, 3]);
    }

    #[test]
    fn shared_table_maps_positions_to_ldofs() {
        let mut gc = GroupCommunicator::new(two_rank_group(), NoComm, CommTag::new(0x3450));
        // shared entities 0 and 1 live at local indices 4 and 2
        gc.create_shared(&[1, 1], &[4, 2]);
        assert_eq!(gc.group_ldof_table().col_slice(), &[4, 2]);
    }

    #[test]
    fn buffer_copies_respect_layouts() {
        let mut gc = gc();
        gc.build_ltdof_table(&[0, 1, 2, 3, 4]);
        let ldata = [10i64, 11, 12, 13, 14];
        let mut buf = [0i64; 2];
        gc.copy_group_to_buffer(&ldata, &mut buf, 1, Layout::All, 1);
        assert_eq!(buf, [11, 13]);
        gc.copy_group_to_buffer(&ldata, &mut buf, 1, Layout::True, 1);
        assert_eq!(buf, [11, 13]);

        let shared = [21i64, 23];
        gc.copy_group_to_buffer(&shared, &mut buf, 1, Layout::Shared, 1);
        assert_eq!(buf, [21, 23]);

        let mut out = [0i64; 5];
        gc.copy_group_from_buffer(&buf, &mut out, 1, Layout::All, 1);
        assert_eq!(out, [0, 21, 0, 23, 0]);
    }

    #[test]
    fn vector_payloads_interleave_components() {
        let gc = gc();
        let ldata: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let mut buf = [0f64; 4];
        gc.copy_group_to_buffer(&ldata, &mut buf, 1, Layout::All, 2);
        assert_eq!(buf, [2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn master_update_runs_without_peers() {
        // NoComm drops the sends; the lock must still cycle cleanly
        let mut gc = gc();
        let mut ldata = [1f64, 2.0, 3.0, 4.0, 5.0];
        gc.update(&mut ldata, Layout::All, 1).unwrap();
        assert_eq!(ldata, [1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    #[should_panic(expected = "in flight")]
    fn double_begin_panics() {
        let mut gc = gc();
        let ldata = [0f64; 5];
        gc.update_begin(&ldata, Layout::All, 1);
        gc.update_begin(&ldata, Layout::All, 1);
    }

    #[test]
    #[should_panic(expected = "without matching")]
    fn end_without_begin_panics() {
        let mut gc = gc();
        let mut ldata = [0f64; 5];
        let _ = gc.update_end(&mut ldata, Layout::All, 1);
    }

    #[test]
    fn reduce_ops_fold() {
        let mut acc = 3i64;
        ReduceOp::Sum.fold(&mut acc, 4);
        assert_eq!(acc, 7);
        ReduceOp::Min.fold(&mut acc, 5);
        assert_eq!(acc, 5);
        ReduceOp::Max.fold(&mut acc, 2);
        assert_eq!(acc, 5);
        ReduceOp::BitOr.fold(&mut acc, 2);
        assert_eq!(acc, 7);
    }

    #[test]
    #[should_panic(expected = "integer data")]
    fn bit_or_on_floats_is_a_defect() {
        let mut acc = 1.0f64;
        ReduceOp::BitOr.fold(&mut acc, 2.0);
    }
}
