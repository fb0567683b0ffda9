//! External interfaces the transport talks to but never inspects the internals of
//! (§6 "Collaborator contracts"): the reducer-side merge manager, the supplier-side
//! MOF mover and data store. The transport only depends on these traits; a real
//! deployment's merge/sort and MOF-file code would implement them and is out of
//! scope here, so each trait also gets a small in-memory reference implementation
//! used by the engines' own tests.

use crate::connection::Connection;
use crate::wire::{FetchAck, FetchRequest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Discriminator every `Chunk` carries, akin to a `chunk_t*`'s leading tag field, so
/// a completion handler can recognize one before touching it.
pub const PTR_CHUNK: u32 = 0x4348_4e4b; // "CHNK"

/// Opaque (to the transport) handle for a range of MOF bytes the server has pulled
/// off disk and is about to RDMA-WRITE to a client (§3 "Chunk").
#[derive(Debug, Clone)]
pub struct Chunk {
    pub tag: u32,
    pub path: String,
    pub offset: u64,
    pub bytes: Arc<Vec<u8>>,
}

impl Chunk {
    pub fn is_chunk(&self) -> bool {
        self.tag == PTR_CHUNK
    }
}

/// A fetch request as parsed and attached to its connection on the server side
/// (§4.7). Carries everything `rdma_write_mof_send_ack` needs once a chunk is ready.
#[derive(Clone)]
pub struct ShuffleReq {
    pub fetch: FetchRequest,
    pub conn: Arc<Connection>,
}

/// The reducer-side handle created by `issue_fetch` (§4.6). Lives in the client
/// engine's outstanding-request table until its ack arrives.
pub struct FetchReqHandle {
    pub host: String,
    pub job_id: String,
    pub map_id: String,
    pub reduce_id: u32,
    pub mof_path: String,
    pub file_offset: u64,
    pub buf_len: usize,
    pub pair: crate::pool::PairId,
    pub freq_handle: u64,
    pub recvd_msg: Option<FetchAck>,
}

/// The reducer-side collaborator: told when a request's ack has arrived
/// (`update_fetch_req`) and when its bytes are ready to read
/// (`mark_req_as_ready`). The transport never inspects merger state beyond these
/// calls (§6).
pub trait MergeManager: Send + Sync {
    fn update_fetch_req(&self, req: &FetchReqHandle);
    fn mark_req_as_ready(&self, req: &FetchReqHandle);
    /// Called when the connection a fetch was outstanding on goes `BAD` before its ack
    /// arrives; the caller is expected to retry rather than wait forever (§8 Scenario 3).
    fn fail_fetch_req(&self, req: &FetchReqHandle);
}

/// The supplier-side collaborator that schedules disk reads for incoming requests
/// (§4.7 "MOF mover"). Kept distinct from `MergeManager` because, unlike the
/// original's single process, client and server here never share an address space -
/// collapsing them into one trait would force a req type neither side fully uses.
pub trait MofMover: Send + Sync {
    fn insert_incoming_req(&self, req: ShuffleReq);
}

/// The supplier-side MOF data store (§6 "MOF data store"): blocking chunk
/// acquire/release keyed by `(path, offset, length)`.
pub trait MofStore: Send + Sync {
    fn acquire_chunk(&self, path: &str, offset: u64, length: u64) -> Chunk;
    fn release_chunk(&self, chunk: Chunk);
}

/// In-memory `MofStore` used by integration tests and by `netlev-server`'s own demo
/// mode: files are just named byte buffers registered ahead of time, with no real
/// filesystem I/O.
pub struct InMemoryMofStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryMofStore {
    pub fn new() -> InMemoryMofStore {
        InMemoryMofStore { files: Mutex::new(HashMap::new()) }
    }

    pub fn put(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(path.into(), bytes);
    }
}

impl Default for InMemoryMofStore {
    fn default() -> Self {
        InMemoryMofStore::new()
    }
}

impl MofStore for InMemoryMofStore {
    fn acquire_chunk(&self, path: &str, offset: u64, length: u64) -> Chunk {
        let files = self.files.lock().unwrap();
        let data = files.get(path).map(|bytes| {
            let start = (offset as usize).min(bytes.len());
            let end = (start + length as usize).min(bytes.len());
            bytes[start..end].to_vec()
        });
        Chunk {
            tag: PTR_CHUNK,
            path: path.to_string(),
            offset,
            bytes: Arc::new(data.unwrap_or_default()),
        }
    }

    fn release_chunk(&self, _chunk: Chunk) {
        // Nothing to release for an in-memory store beyond dropping the Arc.
    }
}

/// `MergeManager` used by the demo binary and by tests: records every request it was
/// told about, in call order, for assertions.
#[derive(Default)]
pub struct RecordingMergeManager {
    updated: Mutex<Vec<u64>>,
    readied: Mutex<Vec<u64>>,
    failed: Mutex<Vec<u64>>,
}

impl RecordingMergeManager {
    pub fn new() -> RecordingMergeManager {
        RecordingMergeManager::default()
    }

    pub fn readied(&self) -> Vec<u64> {
        self.readied.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<u64> {
        self.failed.lock().unwrap().clone()
    }
}

impl MergeManager for RecordingMergeManager {
    fn update_fetch_req(&self, req: &FetchReqHandle) {
        self.updated.lock().unwrap().push(req.freq_handle);
    }

    fn mark_req_as_ready(&self, req: &FetchReqHandle) {
        self.readied.lock().unwrap().push(req.freq_handle);
    }

    fn fail_fetch_req(&self, req: &FetchReqHandle) {
        self.failed.lock().unwrap().push(req.freq_handle);
    }
}

/// `MofMover` that runs the fetch synchronously on the calling (event-loop) thread by
/// going straight to an in-memory store. A production mover would queue the request
/// for a worker pool instead of servicing it inline.
pub struct InlineMofMover<F: Fn(ShuffleReq, Chunk) + Send + Sync> {
    store: Arc<dyn MofStore>,
    on_ready: F,
}

impl<F: Fn(ShuffleReq, Chunk) + Send + Sync> InlineMofMover<F> {
    pub fn new(store: Arc<dyn MofStore>, on_ready: F) -> InlineMofMover<F> {
        InlineMofMover { store, on_ready }
    }
}

impl<F: Fn(ShuffleReq, Chunk) + Send + Sync> MofMover for InlineMofMover<F> {
    fn insert_incoming_req(&self, req: ShuffleReq) {
        let chunk = self.store.acquire_chunk(&req.fetch.mof_path, req.fetch.file_offset, req.fetch.chunk_size as u64);
        (self.on_ready)(req, chunk);
    }
}
