//! Fixed, little-endian wire records for the exchange paths.
//!
//! Every multi-byte integer is stored pre-LE with `.to_le()` and decoded
//! with `from_le()`, so the framing is byte-order independent. Records
//! are `Pod` and cast straight to/from the byte buffers handed to the
//! communicator.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

pub fn cast_slice_from<T: Pod>(v: &[u8]) -> &[T] {
    bytemuck::cast_slice(v)
}

/// Count of following records.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A global entity id carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireGid {
    pub id_le: i64,
}

impl WireGid {
    pub fn of(id: i64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> i64 {
        i64::from_le(self.id_le)
    }
}

/// A group id exchanged while finalizing the process-group registry.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireGroupId {
    pub id_le: u32,
}

impl WireGroupId {
    pub fn of(id: usize) -> Self {
        Self {
            id_le: (id as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.id_le) as usize
    }
}

/// Header of one redistributed or ghosted row: the row's global id, its
/// owning rank and its column count. The column gids follow inline.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireRowHdr {
    pub gid_le: i64,
    pub owner_le: u32,
    pub n_cols_le: u32,
}

impl WireRowHdr {
    pub fn new(gid: i64, owner: usize, n_cols: usize) -> Self {
        Self {
            gid_le: gid.to_le(),
            owner_le: (owner as u32).to_le(),
            n_cols_le: (n_cols as u32).to_le(),
        }
    }
    pub fn gid(&self) -> i64 {
        i64::from_le(self.gid_le)
    }
    pub fn owner(&self) -> usize {
        u32::from_le(self.owner_le) as usize
    }
    pub fn n_cols(&self) -> usize {
        u32::from_le(self.n_cols_le) as usize
    }
}

/// One mirrored node: global id, owning rank, coordinates.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireNodeRec {
    pub gid_le: i64,
    pub owner_le: u32,
    pub _pad: u32,
    pub xyz: [f64; 3],
}

impl WireNodeRec {
    pub fn new(gid: i64, owner: usize, xyz: [f64; 3]) -> Self {
        Self {
            gid_le: gid.to_le(),
            owner_le: (owner as u32).to_le(),
            _pad: 0,
            xyz,
        }
    }
    pub fn gid(&self) -> i64 {
        i64::from_le(self.gid_le)
    }
    pub fn owner(&self) -> usize {
        u32::from_le(self.owner_le) as usize
    }
}

/// Append a `Pod` record to a byte buffer.
pub fn put<T: Pod>(buf: &mut Vec<u8>, rec: &T) {
    buf.extend_from_slice(bytemuck::bytes_of(rec));
}

/// Read a `Pod` record at `*off`, advancing it. `None` on short input.
pub fn take<T: Pod + Copy>(buf: &[u8], off: &mut usize) -> Option<T> {
    let end = off.checked_add(size_of::<T>())?;
    let bytes = buf.get(*off..end)?;
    *off = end;
    Some(bytemuck::pod_read_unaligned(bytes))
}

/// Read `n` consecutive records at `*off`, advancing it.
pub fn take_n<T: Pod + Copy>(buf: &[u8], off: &mut usize, n: usize) -> Option<Vec<T>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(take::<T>(buf, off)?);
    }
    Some(out)
}

static_assertions::const_assert_eq!(size_of::<WireCount>(), 4);
static_assertions::const_assert_eq!(size_of::<WireGid>(), 8);
static_assertions::const_assert_eq!(size_of::<WireGroupId>(), 4);
static_assertions::const_assert_eq!(size_of::<WireRowHdr>(), 16);
static_assertions::const_assert_eq!(size_of::<WireNodeRec>(), 40);
