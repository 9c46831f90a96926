//! Redistribution of a row-oriented relation across ranks.
//!
//! The one network-touching operation of the topology layer: rows move
//! to the rank a partition vector assigns them, carrying their column
//! lists and global row ids. Framing is a byte-size round followed by
//! one payload message per non-empty rank pair.

use std::collections::BTreeMap;

use crate::comm::communicator::{CommTag, Communicator, Wait};
use crate::comm::size_exchange::exchange_sizes_symmetric;
use crate::comm::wire::{self, WireCount, WireGid, WireRowHdr};
use crate::debug_invariants::DebugInvariants;
use crate::halo_error::MeshHaloError;
use crate::topology::graph::{Gid, GraphTopology};

impl GraphTopology {
    /// Redistribute rows to the owners named by `partition`
    /// (`partition[i]` is the destination rank of local row `i`).
    /// `row_gid` travels with the rows and is rewritten to match the new
    /// local ordering: retained rows first, then received rows by sender
    /// rank ascending.
    ///
    /// This is a bulk all-to-all; every rank of `comm` must call it.
    pub fn exchange_data<C: Communicator>(
        &mut self,
        comm: &C,
        partition: &[usize],
        row_gid: &mut Vec<Gid>,
        tag: CommTag,
    ) -> Result<(), MeshHaloError> {
        debug_assert!(self.is_finalized(), "exchange_data before finalize");
        debug_assert_eq!(partition.len(), self.n_rows());
        debug_assert_eq!(row_gid.len(), self.n_rows());
        let me = comm.rank();
        let peers: Vec<usize> = (0..comm.size()).filter(|&p| p != me).collect();

        // gather departing rows per destination, then pack
        let mut departing: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &dst) in partition.iter().enumerate() {
            if dst != me {
                departing.entry(dst).or_default().push(i);
            }
        }
        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&dst, rows) in &departing {
            let mut buf = Vec::new();
            wire::put(&mut buf, &WireCount::new(rows.len()));
            for &i in rows {
                let cols = self.cols_of(i);
                wire::put(&mut buf, &WireRowHdr::new(row_gid[i], me, cols.len()));
                for &c in cols {
                    wire::put(&mut buf, &WireGid::of(c));
                }
            }
            outgoing.insert(dst, buf);
        }

        let sizes_out: BTreeMap<usize, usize> =
            outgoing.iter().map(|(&p, b)| (p, b.len())).collect();
        let sizes_in =
            exchange_sizes_symmetric(&sizes_out, comm, tag, peers.iter().copied())?;

        let mut recvs = Vec::new();
        for &p in &peers {
            let len = sizes_in.get(&p).copied().unwrap_or(0);
            if len > 0 {
                recvs.push((p, comm.irecv(p, tag.offset(1).as_u16(), len)));
            }
        }
        let mut sends = Vec::new();
        for (&p, buf) in &outgoing {
            sends.push(comm.isend(p, tag.offset(1).as_u16(), buf));
        }

        // retained rows, in their original order
        let mut new_rows: Vec<Vec<Gid>> = Vec::new();
        let mut new_gid: Vec<Gid> = Vec::new();
        for (i, &dst) in partition.iter().enumerate() {
            if dst == me {
                new_rows.push(self.cols_of(i).to_vec());
                new_gid.push(row_gid[i]);
            }
        }

        let mut payloads: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut maybe_err = None;
        for (p, h) in recvs {
            match h.wait() {
                Some(data) => {
                    payloads.insert(p, data);
                }
                None => {
                    if maybe_err.is_none() {
                        maybe_err = Some(MeshHaloError::CommError {
                            neighbor: p,
                            source: format!("row payload from rank {p} lost").into(),
                        });
                    }
                }
            }
        }
        for s in sends {
            let _ = s.wait();
        }
        if let Some(err) = maybe_err {
            return Err(err);
        }

        for (p, data) in payloads {
            let mut off = 0;
            let n_rows = wire::take::<WireCount>(&data, &mut off)
                .ok_or_else(|| truncated(p))?
                .get();
            for _ in 0..n_rows {
                let hdr: WireRowHdr = wire::take(&data, &mut off).ok_or_else(|| truncated(p))?;
                let cols: Vec<WireGid> =
                    wire::take_n(&data, &mut off, hdr.n_cols()).ok_or_else(|| truncated(p))?;
                new_rows.push(cols.iter().map(WireGid::get).collect());
                new_gid.push(hdr.gid());
            }
        }

        let global_id = self.is_global_id();
        let mut rebuilt = GraphTopology::from_nested(&new_rows);
        rebuilt.set_global_id(global_id);
        *self = rebuilt;
        *row_gid = new_gid;
        crate::debug_invariants!(self.validate_invariants(), "exchanged topology");
        log::debug!(
            "exchange_data: rank {me} now owns {} rows ({} received)",
            self.n_rows(),
            self.n_rows() - partition.iter().filter(|&&d| d == me).count()
        );
        Ok(())
    }
}

fn truncated(peer: usize) -> MeshHaloError {
    MeshHaloError::CommError {
        neighbor: peer,
        source: format!("truncated row payload from rank {peer}").into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::RayonComm;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rows_follow_partition_between_two_ranks() {
        RayonComm::reset_mailbox();
        let tag = CommTag::new(0x2400);

        // rank 0 owns rows {g10, g11}, sends g11 over; rank 1 owns {g20}
        // and sends it to rank 0.
        let t = std::thread::spawn(move || {
            let comm = RayonComm::new(1, 2);
            let mut g = GraphTopology::from_nested(&[vec![7, 8]]);
            g.set_global_id(true);
            let mut gids = vec![20];
            g.exchange_data(&comm, &[0], &mut gids, tag).unwrap();
            (gids, (0..g.n_rows()).map(|r| g.cols_of(r).to_vec()).collect::<Vec<_>>())
        });

        let comm = RayonComm::new(0, 2);
        let mut g = GraphTopology::from_nested(&[vec![1, 2], vec![3]]);
        g.set_global_id(true);
        let mut gids = vec![10, 11];
        g.exchange_data(&comm, &[0, 1], &mut gids, tag).unwrap();

        let (gids1, rows1) = t.join().unwrap();
        // rank 0 kept row g10 and received g20
        assert_eq!(gids, vec![10, 20]);
        assert_eq!(g.cols_of(0), &[1, 2]);
        assert_eq!(g.cols_of(1), &[7, 8]);
        // rank 1 received g11
        assert_eq!(gids1, vec![11]);
        assert_eq!(rows1, vec![vec![3]]);
    }
}
