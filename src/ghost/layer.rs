//! Ghost-layer construction and extension.
//!
//! Layer 1 seeds from the shared bridge entities (faces in 3-D, edges or
//! nodes in 2-D): each rank asks every bridge neighbor for the remote
//! cells touching their common bridge set and mirrors them locally.
//! Further layers grow across neighbor-of-neighbor information: the
//! requester names the frontier ghost cells it already holds and each
//! owner answers with its own cells bridge-adjacent to them.
//!
//! A request naming an entity its supposed owner has no record of is a
//! partition-consistency bug upstream and aborts the construction — an
//! incomplete ghost layer is a silent-wrong-answer hazard for every
//! downstream kernel.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use itertools::Itertools;

use crate::comm::communicator::{CommTag, Communicator, GhostCommTags, Wait};
use crate::comm::size_exchange::exchange_sizes_symmetric;
use crate::comm::wire::{self, WireCount, WireGid, WireGroupId, WireNodeRec, WireRowHdr};
use crate::ghost::interface::MeshInterface;
use crate::ghost::mesh::{GhostNodeInfo, MeshPartition};
use crate::ghost::ownership::EntityKind;
use crate::halo_error::MeshHaloError;
use crate::topology::algebra::transpose;
use crate::topology::graph::Gid;

/// Build `num_layers` of ghost cells over `bridge`, then finalize the
/// interface (groups, ownership, communicators become available).
/// Collective: every rank of `comm` must call it with the same `bridge`,
/// `num_layers` and `base_tag`. Returns the number of ghost cells added.
pub fn create_ghost_layer<C: Communicator + Clone>(
    mesh: &mut MeshPartition,
    iface: &mut MeshInterface<C>,
    comm: &C,
    bridge: EntityKind,
    num_layers: usize,
    base_tag: CommTag,
) -> Result<usize, MeshHaloError> {
    debug_assert!(num_layers >= 1);
    debug_assert!(num_layers < 12, "tag window exhausted");

    // shared entities first; ghost groups are refined afterwards
    if let Some(s) = mesh.shared(EntityKind::Node) {
        let by_rank = s.by_rank.clone();
        iface.register_shared(EntityKind::Node, &by_rank);
    }
    if bridge != EntityKind::Node {
        let s = mesh
            .shared(bridge)
            .expect("bridge kind has no shared-entity table");
        let by_rank = s.by_rank.clone();
        iface.register_shared(bridge, &by_rank);
    }

    let neighbors = mesh.neighbors(bridge);

    // layer 1: request the cells behind the shared bridge entities
    let mut requests: BTreeMap<usize, Vec<Gid>> = BTreeMap::new();
    if let Some(s) = mesh.shared(bridge) {
        for (&p, ids) in &s.by_rank {
            let gids = ids
                .iter()
                .map(|&l| mesh.bridge_gid(bridge, l))
                .collect::<Vec<_>>();
            requests.insert(p, gids);
        }
    }
    let tags = GhostCommTags::for_round(base_tag, 0);
    let incoming = exchange_gid_lists(comm, &neighbors, &requests, tags)?;

    let mut added = 0usize;
    let mut frontier: BTreeMap<usize, BTreeSet<Gid>> = BTreeMap::new();
    {
        let b2c = transpose(mesh.cell2bridge(bridge));
        let mut replies: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&p, gids) in &incoming {
            let mut cells: BTreeSet<usize> = BTreeSet::new();
            let already = iface.neighbor_ghosts().get(&p).cloned().unwrap_or_default();
            for &gid in gids {
                let l = mesh
                    .bridge_local(bridge, gid)
                    .ok_or(MeshHaloError::InconsistentTopology {
                        entity: gid,
                        rank: iface.my_rank(),
                    })?;
                if l < b2c.n_rows() {
                    for &c in b2c.cols_of(l) {
                        let c = c as usize;
                        if c < mesh.n_real_cells() && !already.contains(&mesh.cell_gids()[c]) {
                            cells.insert(c);
                        }
                    }
                }
            }
            let cells: Vec<usize> = cells.into_iter().collect();
            iface
                .neighbor_ghosts_mut()
                .entry(p)
                .or_default()
                .extend(cells.iter().map(|&c| mesh.cell_gids()[c]));
            replies.insert(p, build_cell_payload(mesh, &cells));
        }
        let payloads =
            exchange_byte_payloads(comm, &neighbors, &replies, tags.reply_sizes, tags.reply)?;
        for (p, data) in payloads {
            let new_gids = apply_cell_payload(mesh, iface, p, &data)?;
            added += new_gids.len();
            frontier.entry(p).or_default().extend(new_gids);
        }
    }

    // deeper layers grow across the owners' own cell adjacency
    for layer in 1..num_layers {
        let round_tags = GhostCommTags::for_round(base_tag, layer as u16);
        frontier = append_ghost_entities(mesh, iface, comm, bridge, &frontier, round_tags)?;
        added += frontier.values().map(BTreeSet::len).sum::<usize>();
        if frontier.values().all(BTreeSet::is_empty) {
            break;
        }
    }

    update_after_create_ghost(mesh, iface, comm, base_tag)?;
    log::debug!(
        "ghost layer on rank {}: {} ghost cells over {} neighbors",
        iface.my_rank(),
        added,
        neighbors.len()
    );
    Ok(added)
}

/// One ghost-extension round: for each owner rank, request the cells
/// bridge-adjacent to the frontier ghost cells already held, and append
/// what comes back. Usable only while the interface is still open for
/// registration; [`update_after_create_ghost`] must run afterwards.
/// Returns the newly added ghost cells grouped by owner — the next
/// frontier.
pub fn append_ghost_entities<C: Communicator + Clone>(
    mesh: &mut MeshPartition,
    iface: &mut MeshInterface<C>,
    comm: &C,
    bridge: EntityKind,
    frontier: &BTreeMap<usize, BTreeSet<Gid>>,
    tags: GhostCommTags,
) -> Result<BTreeMap<usize, BTreeSet<Gid>>, MeshHaloError> {
    let neighbors = mesh.neighbors(bridge);
    let requests: BTreeMap<usize, Vec<Gid>> = neighbors
        .iter()
        .map(|&p| {
            (
                p,
                frontier
                    .get(&p)
                    .map(|s| s.iter().copied().collect())
                    .unwrap_or_default(),
            )
        })
        .collect();
    let incoming = exchange_gid_lists(comm, &neighbors, &requests, tags)?;

    let c2b = mesh.cell2bridge(bridge);
    let b2c = transpose(c2b);
    let mut replies: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for (&p, gids) in &incoming {
        let mut cells: BTreeSet<usize> = BTreeSet::new();
        let already = iface.neighbor_ghosts().get(&p).cloned().unwrap_or_default();
        for &gid in gids {
            let seed = mesh
                .cell_local(gid)
                .filter(|&l| l < mesh.n_real_cells())
                .ok_or(MeshHaloError::MissingRemoteEntity {
                    entity: gid,
                    rank: iface.my_rank(),
                })?;
            for &e in c2b.cols_of(seed) {
                let e = e as usize;
                if e >= b2c.n_rows() {
                    continue;
                }
                for &c in b2c.cols_of(e) {
                    let c = c as usize;
                    if c < mesh.n_real_cells() && !already.contains(&mesh.cell_gids()[c]) {
                        cells.insert(c);
                    }
                }
            }
        }
        let cells: Vec<usize> = cells.into_iter().collect();
        iface
            .neighbor_ghosts_mut()
            .entry(p)
            .or_default()
            .extend(cells.iter().map(|&c| mesh.cell_gids()[c]));
        replies.insert(p, build_cell_payload(mesh, &cells));
    }

    let payloads =
        exchange_byte_payloads(comm, &neighbors, &replies, tags.reply_sizes, tags.reply)?;
    let mut next: BTreeMap<usize, BTreeSet<Gid>> = BTreeMap::new();
    for (p, data) in payloads {
        let new_gids = apply_cell_payload(mesh, iface, p, &data)?;
        next.entry(p).or_default().extend(new_gids);
    }
    Ok(next)
}

/// Reconcile group memberships after the layers are in place, then
/// freeze the interface.
///
/// Ghosting widens the referencing set of boundary entities, and only
/// the owner can see the union. Two all-to-all rounds restore a
/// mesh-wide consistent view: referencers name their ghost nodes to the
/// owners, owners answer every member with the final (gid, member-set)
/// records for each entity whose set changed — cells always, nodes when
/// a new referencer appeared. Every rank then holds identical
/// (member-set, master) pairs and the registry can finalize.
pub fn update_after_create_ghost<C: Communicator + Clone>(
    mesh: &mut MeshPartition,
    iface: &mut MeshInterface<C>,
    comm: &C,
    base_tag: CommTag,
) -> Result<(), MeshHaloError> {
    let me = iface.my_rank();
    let everyone: Vec<usize> = (0..comm.size()).filter(|&p| p != me).collect();

    // round A: tell each owner which of its nodes we now mirror
    let mut notify: BTreeMap<usize, Vec<Gid>> = BTreeMap::new();
    for l in mesh.n_real_nodes()..mesh.n_nodes() {
        let owner = mesh
            .node_ownership()
            .owner(l)
            .ok_or(MeshHaloError::MissingOwner {
                entity: mesh.node_gids()[l],
                rank: me,
            })?;
        notify.entry(owner).or_default().push(mesh.node_gids()[l]);
    }
    let tags_a = GhostCommTags::from_base(base_tag.offset(0x30));
    let incoming = exchange_gid_lists(comm, &everyone, &notify, tags_a)?;

    // original referencing sets of my nodes, mine included
    let mut node_refs: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    if let Some(s) = mesh.shared(EntityKind::Node) {
        for (&rank, ids) in &s.by_rank {
            for &i in ids {
                node_refs.entry(i).or_default().insert(rank);
            }
        }
    }
    let mut changed_nodes: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (&r, gids) in &incoming {
        for &gid in gids {
            let l = mesh
                .node_local(gid)
                .ok_or(MeshHaloError::InconsistentTopology { entity: gid, rank: r })?;
            changed_nodes
                .entry(l)
                .or_insert_with(|| {
                    let mut set = node_refs.get(&l).cloned().unwrap_or_default();
                    set.insert(me);
                    set
                })
                .insert(r);
        }
    }

    // my cells mirrored elsewhere, with their final referencing sets
    let mut shared_cells: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (&r, gids) in iface.neighbor_ghosts() {
        for &gid in gids {
            let l = mesh.cell_local(gid).expect("sent cell vanished");
            let set = shared_cells
                .entry(l)
                .or_insert_with(|| BTreeSet::from([me]));
            set.insert(r);
        }
    }

    // owner-side assignment, and one record per (entity, member)
    let mut outgoing: BTreeMap<usize, (Vec<u8>, Vec<u8>)> = BTreeMap::new();
    for (&l, members) in &shared_cells {
        iface.assign(EntityKind::Cell, l, members, me, false);
        for &m in members {
            if m != me {
                let (cells, _) = outgoing.entry(m).or_default();
                put_set_record(cells, mesh.cell_gids()[l], me, members);
            }
        }
    }
    for (&l, members) in &changed_nodes {
        iface.assign(EntityKind::Node, l, members, me, false);
        mesh.node_ownership_mut().promote_shared(l, me);
        for &m in members {
            if m != me {
                let (_, nodes) = outgoing.entry(m).or_default();
                put_set_record(nodes, mesh.node_gids()[l], me, members);
            }
        }
    }

    // round B: (gid, member-set) records, cells then nodes
    let mut replies: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for &p in &everyone {
        let (cells, nodes) = outgoing.remove(&p).unwrap_or_default();
        let n_cells = shared_cells
            .values()
            .filter(|s| s.contains(&p))
            .count();
        let n_nodes = changed_nodes
            .values()
            .filter(|s| s.contains(&p))
            .count();
        if n_cells == 0 && n_nodes == 0 {
            continue;
        }
        let mut buf = Vec::new();
        wire::put(&mut buf, &WireCount::new(n_cells));
        buf.extend_from_slice(&cells);
        wire::put(&mut buf, &WireCount::new(n_nodes));
        buf.extend_from_slice(&nodes);
        replies.insert(p, buf);
    }
    let tags_b = GhostCommTags::from_base(base_tag.offset(0x34));
    let payloads =
        exchange_byte_payloads(comm, &everyone, &replies, tags_b.reply_sizes, tags_b.reply)?;
    for (o, data) in payloads {
        let mut off = 0;
        let n_cells = wire::take::<WireCount>(&data, &mut off)
            .ok_or_else(|| truncated(o))?
            .get();
        for _ in 0..n_cells {
            let (gid, master, members) = take_set_record(&data, &mut off, o)?;
            let l = mesh
                .cell_local(gid)
                .ok_or(MeshHaloError::InconsistentTopology { entity: gid, rank: o })?;
            iface.assign(EntityKind::Cell, l, &members, master, true);
        }
        let n_nodes = wire::take::<WireCount>(&data, &mut off)
            .ok_or_else(|| truncated(o))?
            .get();
        for _ in 0..n_nodes {
            let (gid, master, members) = take_set_record(&data, &mut off, o)?;
            let l = mesh
                .node_local(gid)
                .ok_or(MeshHaloError::InconsistentTopology { entity: gid, rank: o })?;
            let ghost = mesh.node_ownership().is_ghost(l);
            iface.assign(EntityKind::Node, l, &members, master, ghost);
        }
    }

    iface.create(comm, base_tag.offset(0x3F))?;
    iface.set_has_ghost();
    Ok(())
}

fn put_set_record(buf: &mut Vec<u8>, gid: Gid, master: usize, members: &BTreeSet<usize>) {
    wire::put(buf, &WireRowHdr::new(gid, master, members.len()));
    for &m in members {
        wire::put(buf, &WireGroupId::of(m));
    }
}

fn take_set_record(
    data: &[u8],
    off: &mut usize,
    from: usize,
) -> Result<(Gid, usize, BTreeSet<usize>), MeshHaloError> {
    let hdr: WireRowHdr = wire::take(data, off).ok_or_else(|| truncated(from))?;
    let members: Vec<WireGroupId> =
        wire::take_n(data, off, hdr.n_cols()).ok_or_else(|| truncated(from))?;
    Ok((
        hdr.gid(),
        hdr.owner(),
        members.iter().map(WireGroupId::get).collect(),
    ))
}

/// Two-stage exchange of global-id lists with a fixed neighbor set.
fn exchange_gid_lists<C: Communicator>(
    comm: &C,
    neighbors: &[usize],
    outgoing: &BTreeMap<usize, Vec<Gid>>,
    tags: GhostCommTags,
) -> Result<BTreeMap<usize, Vec<Gid>>, MeshHaloError> {
    let counts: BTreeMap<usize, usize> =
        outgoing.iter().map(|(&p, v)| (p, v.len())).collect();
    let incoming_counts =
        exchange_sizes_symmetric(&counts, comm, tags.request_sizes, neighbors.iter().copied())?;

    let mut recvs = Vec::new();
    for &p in neighbors {
        let n = incoming_counts.get(&p).copied().unwrap_or(0);
        if n > 0 {
            let len = n * std::mem::size_of::<WireGid>();
            recvs.push((p, n, comm.irecv(p, tags.request.as_u16(), len)));
        }
    }
    let mut sends = Vec::new();
    let mut send_bufs = Vec::new();
    for (&p, gids) in outgoing {
        if gids.is_empty() {
            continue;
        }
        let recs: Vec<WireGid> = gids.iter().map(|&g| WireGid::of(g)).collect();
        sends.push(comm.isend(p, tags.request.as_u16(), wire::cast_slice(&recs)));
        send_bufs.push(recs);
    }

    let mut incoming = BTreeMap::new();
    let mut maybe_err = None;
    for (p, n, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == n * std::mem::size_of::<WireGid>() => {
                let recs: &[WireGid] = wire::cast_slice_from(&data);
                incoming.insert(p, recs.iter().map(WireGid::get).collect::<Vec<_>>());
            }
            Some(data) => {
                if maybe_err.is_none() {
                    maybe_err = Some(MeshHaloError::PayloadSizeMismatch {
                        neighbor: p,
                        expected: n * std::mem::size_of::<WireGid>(),
                        got: data.len(),
                    });
                }
            }
            None => {
                if maybe_err.is_none() {
                    maybe_err = Some(truncated(p));
                }
            }
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Two-stage exchange of opaque byte payloads with a fixed neighbor set.
fn exchange_byte_payloads<C: Communicator>(
    comm: &C,
    neighbors: &[usize],
    outgoing: &BTreeMap<usize, Vec<u8>>,
    size_tag: CommTag,
    data_tag: CommTag,
) -> Result<BTreeMap<usize, Vec<u8>>, MeshHaloError> {
    let sizes: BTreeMap<usize, usize> =
        outgoing.iter().map(|(&p, b)| (p, b.len())).collect();
    let incoming_sizes =
        exchange_sizes_symmetric(&sizes, comm, size_tag, neighbors.iter().copied())?;

    let mut recvs = Vec::new();
    for &p in neighbors {
        let len = incoming_sizes.get(&p).copied().unwrap_or(0);
        if len > 0 {
            recvs.push((p, comm.irecv(p, data_tag.as_u16(), len)));
        }
    }
    let mut sends = Vec::new();
    for (&p, buf) in outgoing {
        if !buf.is_empty() {
            sends.push(comm.isend(p, data_tag.as_u16(), buf));
        }
    }

    let mut payloads = BTreeMap::new();
    let mut maybe_err = None;
    for (p, h) in recvs {
        match h.wait() {
            Some(data) => {
                payloads.insert(p, data);
            }
            None => {
                if maybe_err.is_none() {
                    maybe_err = Some(truncated(p));
                }
            }
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    match maybe_err {
        Some(err) => Err(err),
        None => Ok(payloads),
    }
}

/// Pack the connectivity and node records of `cells` (local, real).
fn build_cell_payload(mesh: &MeshPartition, cells: &[usize]) -> Vec<u8> {
    let mut buf = Vec::new();
    wire::put(&mut buf, &WireCount::new(cells.len()));
    let mut nodes: Vec<usize> = Vec::new();
    for &c in cells {
        let cols = mesh.cell2node().cols_of(c);
        wire::put(
            &mut buf,
            &WireRowHdr::new(mesh.cell_gids()[c], mesh.cell_owner_or_self(c), cols.len()),
        );
        for &n in cols {
            wire::put(&mut buf, &WireGid::of(mesh.node_gids()[n as usize]));
            nodes.push(n as usize);
        }
    }
    let nodes: Vec<usize> = nodes.into_iter().sorted_unstable().dedup().collect();
    wire::put(&mut buf, &WireCount::new(nodes.len()));
    for l in nodes {
        wire::put(
            &mut buf,
            &WireNodeRec::new(mesh.node_gids()[l], mesh.node_owner_or_self(l), mesh.coords()[l]),
        );
    }
    buf
}

/// Decode a cell payload from `from` and append its cells and nodes as
/// ghosts. Returns the gids of the cells actually added.
fn apply_cell_payload<C: Communicator + Clone>(
    mesh: &mut MeshPartition,
    iface: &mut MeshInterface<C>,
    from: usize,
    data: &[u8],
) -> Result<Vec<Gid>, MeshHaloError> {
    let me = iface.my_rank();
    let mut off = 0;
    let n_cells = wire::take::<WireCount>(data, &mut off)
        .ok_or_else(|| truncated(from))?
        .get();
    let mut batch: Vec<(Gid, usize, Vec<Gid>)> = Vec::with_capacity(n_cells);
    for _ in 0..n_cells {
        let hdr: WireRowHdr = wire::take(data, &mut off).ok_or_else(|| truncated(from))?;
        let cols: Vec<WireGid> =
            wire::take_n(data, &mut off, hdr.n_cols()).ok_or_else(|| truncated(from))?;
        batch.push((hdr.gid(), hdr.owner(), cols.iter().map(WireGid::get).collect()));
    }
    let n_nodes = wire::take::<WireCount>(data, &mut off)
        .ok_or_else(|| truncated(from))?
        .get();
    let mut nodes: HashMap<Gid, GhostNodeInfo> = HashMap::with_capacity(n_nodes);
    for _ in 0..n_nodes {
        let rec: WireNodeRec = wire::take(data, &mut off).ok_or_else(|| truncated(from))?;
        nodes.insert(
            rec.gid(),
            GhostNodeInfo {
                owner: rec.owner(),
                xyz: rec.xyz,
            },
        );
    }

    // a cell may have been delivered through an earlier bridge entity
    batch.retain(|(gid, _, _)| mesh.cell_local(*gid).is_none());
    debug_assert!(batch.iter().all(|&(_, owner, _)| owner != me));
    let _ = mesh.add_ghost_cells(&batch, &nodes, from)?;
    for (gid, _, _) in &batch {
        iface.push_ghost_elem(*gid);
    }
    Ok(batch.into_iter().map(|(gid, _, _)| gid).collect())
}

fn truncated(peer: usize) -> MeshHaloError {
    MeshHaloError::CommError {
        neighbor: peer,
        source: format!("truncated ghost payload from rank {peer}").into(),
    }
}
