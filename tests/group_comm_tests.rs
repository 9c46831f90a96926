//! Multi-rank GroupCommunicator behavior over the in-process backend.
//!
//! Every simulated rank runs on its own thread with its own registry
//! and communicator, exactly as SPMD ranks would.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serial_test::serial;

use mesh_halo::comm::{CommTag, RayonComm};
use mesh_halo::group::{GroupCommunicator, Layout, ProcGroup, ReduceOp, simplest_pick_owner};

fn pair_communicator(rank: usize, tag: CommTag) -> GroupCommunicator<RayonComm> {
    let comm = RayonComm::new(rank, 2);
    let mut pg = ProcGroup::new(rank);
    pg.init();
    let members: BTreeSet<usize> = [0usize, 1].into_iter().collect();
    pg.add_group(&members, 0);
    pg.create(&comm, tag).unwrap();
    let mut gc = GroupCommunicator::new(Arc::new(pg), comm, tag.offset(0x10));
    // entity correspondence across the boundary:
    //   rank 0 locals [1, 3]  <->  rank 1 locals [0, 2]
    if rank == 0 {
        gc.create(&[0, 1, 0, 1, 0]);
    } else {
        gc.create(&[1, 0, 1, 0, 0]);
    }
    gc
}

#[test]
#[serial]
fn broadcast_delivers_master_values() {
    RayonComm::reset_mailbox();
    let tag = CommTag::new(0x5000);
    let t = std::thread::spawn(move || {
        let mut gc = pair_communicator(1, tag);
        let mut ldata = [0f64, 1.0, 2.0, 3.0, 4.0];
        gc.update(&mut ldata, Layout::All, 1).unwrap();
        ldata
    });
    let mut gc = pair_communicator(0, tag);
    let mut ldata = [10f64, 11.0, 12.0, 13.0, 14.0];
    gc.update(&mut ldata, Layout::All, 1).unwrap();

    let ghost_side = t.join().unwrap();
    // the master's array is untouched
    assert_eq!(ldata, [10.0, 11.0, 12.0, 13.0, 14.0]);
    // shared slots on the non-master took the master's values
    assert_eq!(ghost_side, [11.0, 1.0, 13.0, 3.0, 4.0]);
}

#[test]
#[serial]
fn broadcast_twice_is_idempotent() {
    RayonComm::reset_mailbox();
    let tag = CommTag::new(0x5100);
    let t = std::thread::spawn(move || {
        let mut gc = pair_communicator(1, tag);
        let mut ldata = [0f64, 1.0, 2.0, 3.0, 4.0];
        gc.update(&mut ldata, Layout::All, 1).unwrap();
        let first = ldata;
        gc.update(&mut ldata, Layout::All, 1).unwrap();
        (first, ldata)
    });
    let mut gc = pair_communicator(0, tag);
    let mut ldata = [10f64, 11.0, 12.0, 13.0, 14.0];
    gc.update(&mut ldata, Layout::All, 1).unwrap();
    gc.update(&mut ldata, Layout::All, 1).unwrap();

    let (first, second) = t.join().unwrap();
    assert_eq!(first, second);
}

#[test]
#[serial]
fn reduce_sums_into_master_only() {
    RayonComm::reset_mailbox();
    let tag = CommTag::new(0x5200);
    let t = std::thread::spawn(move || {
        let mut gc = pair_communicator(1, tag);
        let mut ldata = [5i64, 1, 6, 3, 4];
        gc.reduce(&mut ldata, 1, ReduceOp::Sum).unwrap();
        ldata
    });
    let mut gc = pair_communicator(0, tag);
    let mut ldata = [10i64, 11, 12, 13, 14];
    gc.reduce(&mut ldata, 1, ReduceOp::Sum).unwrap();

    let member = t.join().unwrap();
    assert_eq!(ldata, [10, 16, 12, 19, 14]);
    // non-master entries are never written by a reduction
    assert_eq!(member, [5, 1, 6, 3, 4]);
}

#[test]
#[serial]
fn reduce_min_and_vector_payloads() {
    RayonComm::reset_mailbox();
    let tag = CommTag::new(0x5300);
    let t = std::thread::spawn(move || {
        let mut gc = pair_communicator(1, tag);
        // two components per entity
        let mut ldata = [7i64, -2, 0, 0, 9, 1, 0, 0, 0, 0];
        gc.reduce(&mut ldata, 2, ReduceOp::Min).unwrap();
    });
    let mut gc = pair_communicator(0, tag);
    let mut ldata = [0i64, 0, 8, 3, 0, 0, 5, 5, 0, 0];
    gc.reduce(&mut ldata, 2, ReduceOp::Min).unwrap();
    t.join().unwrap();

    // entity 1 holds min((8,3),(7,-2)); entity 3 holds min((5,5),(9,1))
    assert_eq!(&ldata[2..4], &[7, -2]);
    assert_eq!(&ldata[6..8], &[5, 1]);
}

/// One three-rank group, members delayed at random: for `Op = Sum` the
/// master's post-reduce value must equal the exact sum of every
/// member's contribution for any arrival order.
#[test]
#[serial]
fn reduce_sum_is_arrival_order_independent() {
    for round in 0..4u16 {
        RayonComm::reset_mailbox();
        let tag = CommTag::new(0x5400).offset(round.wrapping_mul(0x20));
        let spawn = move |rank: usize, contribution: i64, delay_ms: u64| {
            std::thread::spawn(move || {
                let comm = RayonComm::new(rank, 3);
                let mut pg = ProcGroup::new(rank);
                pg.init();
                let members: BTreeSet<usize> = [0usize, 1, 2].into_iter().collect();
                pg.add_group(&members, 0);
                pg.create(&comm, tag).unwrap();
                let mut gc = GroupCommunicator::new(Arc::new(pg), comm, tag.offset(0x10));
                gc.create(&[0, 1]);
                let mut ldata = [0i64, contribution];
                std::thread::sleep(Duration::from_millis(delay_ms));
                gc.reduce(&mut ldata, 1, ReduceOp::Sum).unwrap();
                ldata[1]
            })
        };
        let mut rng = SmallRng::seed_from_u64(0xB0B + round as u64);
        let d1 = rng.gen_range(0..20);
        let d2 = rng.gen_range(0..20);
        let master = spawn(0, 100, 0);
        let m1 = spawn(1, 7, d1);
        let m2 = spawn(2, 30, d2);
        assert_eq!(master.join().unwrap(), 137);
        // members keep their own contribution
        assert_eq!(m1.join().unwrap(), 7);
        assert_eq!(m2.join().unwrap(), 30);
    }
}

#[test]
#[serial]
fn broadcast_in_shared_layout() {
    RayonComm::reset_mailbox();
    let tag = CommTag::new(0x5600);
    let t = std::thread::spawn(move || {
        let mut gc = pair_communicator(1, tag);
        // dense over the shared entities only
        let mut shared = [0f64, 0.0];
        gc.update(&mut shared, Layout::Shared, 1).unwrap();
        shared
    });
    let mut gc = pair_communicator(0, tag);
    let mut shared = [7f64, 9.0];
    gc.update(&mut shared, Layout::Shared, 1).unwrap();

    assert_eq!(t.join().unwrap(), [7.0, 9.0]);
    assert_eq!(shared, [7.0, 9.0]);
}

#[test]
#[serial]
fn reduce_into_true_dof_array() {
    RayonComm::reset_mailbox();
    let tag = CommTag::new(0x5700);
    let t = std::thread::spawn(move || {
        let mut gc = pair_communicator(1, tag);
        // the shared entities are owned by rank 0, so none are true here
        gc.build_ltdof_table(&[-1, 0, -1, 1, 2]);
        let ldata = [5i64, 1, 6, 3, 4];
        let mut tdata = [1i64, 3, 4];
        gc.reduce_begin(&ldata, 1);
        gc.reduce_end_true(&mut tdata, 1, ReduceOp::Sum).unwrap();
        tdata
    });
    let mut gc = pair_communicator(0, tag);
    gc.build_ltdof_table(&[0, 1, 2, 3, 4]);
    let ldata = [10i64, 11, 12, 13, 14];
    let mut tdata = ldata;
    gc.reduce_begin(&ldata, 1);
    gc.reduce_end_true(&mut tdata, 1, ReduceOp::Sum).unwrap();

    // the master folds into its true-dof slots
    assert_eq!(tdata, [10, 16, 12, 19, 14]);
    // a pure member's true-dof array is untouched
    assert_eq!(t.join().unwrap(), [1, 3, 4]);
}

#[test]
fn pick_owner_is_deterministic_and_pure() {
    let sets: [&[usize]; 3] = [&[2, 9, 4], &[0], &[7, 3]];
    for ranks in sets {
        let s: BTreeSet<usize> = ranks.iter().copied().collect();
        let a = simplest_pick_owner(&s);
        let b = simplest_pick_owner(&s.clone());
        assert_eq!(a, b);
        assert_eq!(a, *ranks.iter().min().unwrap());
    }
}
