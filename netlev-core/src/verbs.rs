//! Verbs vocabulary (§4.10): the handful of types the device/connection/completion
//! layer is built from, independent of which transport actually moves the bytes.
//!
//! No `libibverbs`/`librdmacm` FFI crate is available here, and fabricating a vendor
//! binding is out of bounds. `connection`/`device`/`reactor` supply the one concrete
//! transport shipped in this crate, built on `mio` + `TcpStream`. A production build
//! would supply an `ibverbs`-backed `CompletionSink`/connection pair behind the same
//! shapes used here; see DESIGN.md for the tradeoff.

use std::sync::atomic::{AtomicU64, Ordering};

/// Peer info exchanged during connection setup (§3 "Peer info").
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub credits_granted: u32,
    pub remote_rkey: u32,
    pub qp_num: u32,
}

/// What kind of work request a completion refers to, used to interpret `wr_id`
/// (§9 "Work-id tagging").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Op {
    Send,
    Recv,
    RdmaWrite,
}

/// A 64-bit `wr_id`, tagged with a discriminant in the low bits so the completion
/// dispatcher can tell a bare receive-entry id, a client fetch-request pointer, and a
/// server chunk pointer apart before doing anything with the payload (§9).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct WorkId(u64);

const TAG_RECV: u64 = 0;
const TAG_CLIENT_REQ: u64 = 1;
const TAG_SERVER_CHUNK: u64 = 2;
const TAG_MASK: u64 = 0b11;
const TAG_SHIFT: u32 = 2;

impl WorkId {
    pub fn for_recv(slot: u64) -> WorkId {
        WorkId((slot << TAG_SHIFT) | TAG_RECV)
    }

    pub fn for_client_request(req_handle: u64) -> WorkId {
        WorkId((req_handle << TAG_SHIFT) | TAG_CLIENT_REQ)
    }

    pub fn for_server_chunk(chunk_id: u64) -> WorkId {
        WorkId((chunk_id << TAG_SHIFT) | TAG_SERVER_CHUNK)
    }

    pub fn is_chunk(self) -> bool {
        (self.0 & TAG_MASK) == TAG_SERVER_CHUNK
    }

    pub fn is_client_request(self) -> bool {
        (self.0 & TAG_MASK) == TAG_CLIENT_REQ
    }

    pub fn value(self) -> u64 {
        self.0 >> TAG_SHIFT
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Status of a polled work completion.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CompletionStatus {
    Ok,
    /// Expected during teardown once outstanding work is flushed off a destroyed QP.
    Flush,
    /// Anything else: demotes the owning connection to `BAD`.
    Error(i32),
}

/// One entry polled off a device's completion queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: WorkId,
    pub op: Op,
    pub status: CompletionStatus,
    pub conn_qp_num: u32,
    pub bytes: u32,
}

/// Monotonically increasing wr_id source; one per process is sufficient since `WorkId`
/// values are only ever compared within the process that generated them.
pub struct WorkIdGenerator {
    next: AtomicU64,
}

impl WorkIdGenerator {
    pub fn new() -> WorkIdGenerator {
        WorkIdGenerator { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for WorkIdGenerator {
    fn default() -> Self {
        WorkIdGenerator::new()
    }
}

/// Sink a device exposes so connections can post completions for the event loop's CQ
/// handler to later poll and dispatch (§4.2, §4.3). Kept as a trait, rather than a
/// concrete type reference, so tests can substitute an inspectable fake.
pub trait CompletionSink: Send + Sync {
    fn push(&self, completion: WorkCompletion);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_id_tag_round_trips() {
        let recv = WorkId::for_recv(42);
        assert!(!recv.is_chunk());
        assert!(!recv.is_client_request());
        assert_eq!(recv.value(), 42);

        let chunk = WorkId::for_server_chunk(7);
        assert!(chunk.is_chunk());
        assert_eq!(chunk.value(), 7);

        let req = WorkId::for_client_request(99);
        assert!(req.is_client_request());
        assert_eq!(req.value(), 99);
    }
}
