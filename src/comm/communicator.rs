//! Thin façade over intra-process or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking — the exchange layers
//! call `.wait()` before they trust that data is ready. Receive handles
//! own their buffer; callers state the expected byte length up front and
//! get the bytes back from `wait()`, so no raw buffer pointer ever
//! leaves the communicator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of exactly `len` bytes from `peer`. Longer
    /// messages are truncated to `len`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// This process's rank.
    fn rank(&self) -> usize;
    /// Number of ranks in the communicator.
    fn size(&self) -> usize;
    /// Collective barrier; a no-op for serial backends.
    fn barrier(&self) {}
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Typed message tag. Protocols derive their per-round tags from a base
/// via [`CommTag::offset`] so distinct epochs never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub fn new(base: u16) -> Self {
        Self(base)
    }
    pub fn as_u16(self) -> u16 {
        self.0
    }
    pub fn offset(self, delta: u16) -> Self {
        Self(self.0.wrapping_add(delta))
    }
}

/// Tag block for one ghost-layer round: entity-id request, reply sizes,
/// reply payload.
#[derive(Clone, Copy, Debug)]
pub struct GhostCommTags {
    pub request_sizes: CommTag,
    pub request: CommTag,
    pub reply_sizes: CommTag,
    pub reply: CommTag,
}

impl GhostCommTags {
    pub fn from_base(base: CommTag) -> Self {
        Self {
            request_sizes: base,
            request: base.offset(1),
            reply_sizes: base.offset(2),
            reply: base.offset(3),
        }
    }

    /// Tags for ghost-layer round `round` (layer extensions reuse the
    /// same block shifted past all previous rounds).
    pub fn for_round(base: CommTag, round: u16) -> Self {
        Self::from_base(base.offset(round.wrapping_mul(4)))
    }
}

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process, one simulated rank per thread ---

type Key = (usize, usize, u16); // (src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);

/// Receive handle backed by a polling thread on the shared mailbox.
pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock().unwrap();
        guard.take()
    }
}

/// In-process backend: every simulated rank runs on its own thread and
/// messages pass through a global FIFO mailbox keyed by
/// `(src, dst, tag)`.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }

    /// Drop every queued message. Tests sharing the process-wide mailbox
    /// call this between scenarios.
    pub fn reset_mailbox() {
        MAILBOX.clear();
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> LocalHandle {
        let key = (peer, self.rank, tag);
        let buf_arc = Arc::new(Mutex::new(None));
        let buf_clone = buf_arc.clone();
        let handle = std::thread::spawn(move || {
            loop {
                let msg = MAILBOX.get_mut(&key).and_then(|mut q| q.pop_front());
                if let Some(bytes) = msg {
                    let n = len.min(bytes.len());
                    *buf_clone.lock().unwrap() = Some(bytes[..n].to_vec());
                    break;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            buf: buf_arc,
            handle: Some(handle),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::Communicator as _;
    use std::sync::Arc;

    /// MPI-world backend. Initialization is idempotent: a second
    /// construction in the same process attaches to the existing world.
    #[derive(Clone)]
    pub struct MpiComm {
        _universe: Option<Arc<Universe>>,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Self {
            let (world, universe) = match mpi::initialize() {
                Some(universe) => (universe.world(), Some(Arc::new(universe))),
                None => (SimpleCommunicator::world(), None),
            };
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
            }
        }
    }

    pub struct MpiSendHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        _buf: Box<[u8]>,
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            None
        }
    }

    pub struct MpiRecvHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: Box<[u8]>,
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            Some(self.buf.into_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let owned: Box<[u8]> = buf.into();
            // the handle owns the buffer until wait(), so extending the
            // borrow to 'static is sound
            let slice: &'static [u8] = unsafe { std::mem::transmute::<&[u8], _>(&owned) };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(mpi::request::StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                _buf: owned,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> MpiRecvHandle {
            let mut owned: Box<[u8]> = vec![0u8; len].into_boxed_slice();
            let slice: &'static mut [u8] =
                unsafe { std::mem::transmute::<&mut [u8], _>(&mut owned[..]) };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(mpi::request::StaticScope, slice, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: owned,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rayon_roundtrip_two_ranks() {
        RayonComm::reset_mailbox();
        let c0 = RayonComm::new(0, 2);
        let c1 = RayonComm::new(1, 2);

        let h = c1.irecv(0, 7, 4);
        c0.isend(1, 7, &[1, 2, 3, 4]);
        assert_eq!(h.wait().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    #[serial]
    fn rayon_fifo_order() {
        RayonComm::reset_mailbox();
        let c0 = RayonComm::new(0, 2);
        let c1 = RayonComm::new(1, 2);

        for i in 0..10u8 {
            c0.isend(1, 9, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            let h = c1.irecv(0, 9, 1);
            out.push(h.wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    #[serial]
    fn rayon_truncates_to_posted_len() {
        RayonComm::reset_mailbox();
        let c0 = RayonComm::new(0, 2);
        let c1 = RayonComm::new(1, 2);

        c0.isend(1, 11, &[1, 2, 3, 4, 5, 6]);
        let h = c1.irecv(0, 11, 4);
        assert_eq!(h.wait().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn tag_blocks_do_not_overlap() {
        let a = GhostCommTags::for_round(CommTag::new(0x4000), 0);
        let b = GhostCommTags::for_round(CommTag::new(0x4000), 1);
        assert_ne!(a.reply.as_u16(), b.request_sizes.as_u16());
        assert_eq!(b.request_sizes.as_u16(), 0x4004);
    }
}
