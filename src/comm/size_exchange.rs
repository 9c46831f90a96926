//! Stage-1 of every two-stage exchange: tell each neighbor how many
//! bytes to expect.
//!
//! The exchange is symmetric: a count is posted to and from every rank
//! in `neighbors`, zero included, so both sides always know whether a
//! payload message follows. Every send/receive handle is drained before
//! returning, even when an error is reported.

use std::collections::BTreeMap;

use crate::comm::communicator::{CommTag, Communicator, Wait};
use crate::comm::wire::{self, WireCount};
use crate::halo_error::MeshHaloError;

/// Exchange per-neighbor counts. `outgoing` maps neighbor rank to the
/// count announced to it; ranks in `neighbors` missing from `outgoing`
/// announce zero. Returns the counts announced *to us* by each neighbor.
pub fn exchange_sizes_symmetric<C: Communicator>(
    outgoing: &BTreeMap<usize, usize>,
    comm: &C,
    tag: CommTag,
    neighbors: impl IntoIterator<Item = usize> + Clone,
) -> Result<BTreeMap<usize, usize>, MeshHaloError> {
    let mut recvs = Vec::new();
    for nbr in neighbors.clone() {
        let h = comm.irecv(nbr, tag.as_u16(), std::mem::size_of::<WireCount>());
        recvs.push((nbr, h));
    }

    let mut sends = Vec::new();
    for nbr in neighbors {
        let count = WireCount::new(outgoing.get(&nbr).copied().unwrap_or(0));
        sends.push(comm.isend(nbr, tag.as_u16(), wire::cast_slice(std::slice::from_ref(&count))));
    }

    let mut incoming = BTreeMap::new();
    let mut maybe_err = None;
    for (nbr, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                let cnt: WireCount = bytemuck::pod_read_unaligned(&data);
                incoming.insert(nbr, cnt.get());
            }
            Some(data) => {
                if maybe_err.is_none() {
                    maybe_err = Some(MeshHaloError::PayloadSizeMismatch {
                        neighbor: nbr,
                        expected: std::mem::size_of::<WireCount>(),
                        got: data.len(),
                    });
                }
            }
            None => {
                if maybe_err.is_none() {
                    maybe_err = Some(MeshHaloError::CommError {
                        neighbor: nbr,
                        source: format!("failed to receive size from rank {nbr}").into(),
                    });
                }
            }
        }
    }

    // always drain the send handles before returning
    for s in sends {
        let _ = s.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::RayonComm;
    use serial_test::serial;

    #[test]
    #[serial]
    fn counts_cross_between_two_ranks() {
        RayonComm::reset_mailbox();
        let tag = CommTag::new(0x2100);
        let t = std::thread::spawn(move || {
            let c1 = RayonComm::new(1, 2);
            let out = BTreeMap::from([(0usize, 7usize)]);
            exchange_sizes_symmetric(&out, &c1, tag, [0usize]).unwrap()
        });
        let c0 = RayonComm::new(0, 2);
        let out = BTreeMap::from([(1usize, 3usize)]);
        let got0 = exchange_sizes_symmetric(&out, &c0, tag, [1usize]).unwrap();
        let got1 = t.join().unwrap();
        assert_eq!(got0[&1], 7);
        assert_eq!(got1[&0], 3);
    }

    #[test]
    #[serial]
    fn missing_entry_announces_zero() {
        RayonComm::reset_mailbox();
        let tag = CommTag::new(0x2200);
        let t = std::thread::spawn(move || {
            let c1 = RayonComm::new(1, 2);
            exchange_sizes_symmetric(&BTreeMap::new(), &c1, tag, [0usize]).unwrap()
        });
        let c0 = RayonComm::new(0, 2);
        let got0 = exchange_sizes_symmetric(&BTreeMap::new(), &c0, tag, [1usize]).unwrap();
        let got1 = t.join().unwrap();
        assert_eq!(got0[&1], 0);
        assert_eq!(got1[&0], 0);
    }
}
