//! Server (supplier-side) engine (C7).

use crate::collaborators::{Chunk, MofMover, MofStore, ShuffleReq};
use crate::config::{ShuffleConfig, MAX_CQ_EVENTS_PER_WAKE_SERVER};
use crate::connection::{ConnState, Connection, Delivered};
use crate::device::Device;
use crate::error::{ConnectionError, Result};
use crate::reactor::EventLoop;
use crate::verbs::{CompletionStatus, Op, PeerInfo, WorkCompletion, WorkId, WorkIdGenerator};
use crate::wire::{FetchAck, FetchRequest, MessageType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Event loop wakeup cadence for the server engine's dedicated thread.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct ServerEngine {
    event_loop: Arc<EventLoop>,
    device: Arc<Device>,
    cfg: ShuffleConfig,
    mover: Arc<dyn MofMover>,
    mof_store: Arc<dyn MofStore>,
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    /// Chunks in flight between `rdma_write_mof_send_ack` posting the ack and the CQ
    /// reporting its signalled completion, keyed by the wr_id tagging the SEND
    /// (§4.3 "the chunk is released exactly once").
    pending_chunks: Mutex<HashMap<u64, (Arc<Connection>, Chunk)>>,
    work_ids: WorkIdGenerator,
    next_qp_num: AtomicU32,
    logger: slog::Logger,
}

impl ServerEngine {
    pub fn new(
        event_loop: Arc<EventLoop>,
        cfg: ShuffleConfig,
        mof_store: Arc<dyn MofStore>,
        logger: slog::Logger,
    ) -> Result<Arc<ServerEngine>> {
        let (device, cq_token) = Device::new("netlev_server0", &event_loop)?;

        let engine = Arc::new_cyclic(|weak: &Weak<ServerEngine>| {
            let weak_for_cq = weak.clone();
            event_loop.set_handler(cq_token, move || {
                if let Some(engine) = weak_for_cq.upgrade() {
                    engine.drain_completions();
                }
            });

            let weak_for_mover = weak.clone();
            let mover: Arc<dyn MofMover> = Arc::new(crate::collaborators::InlineMofMover::new(
                mof_store.clone(),
                move |req: ShuffleReq, chunk: Chunk| {
                    if let Some(engine) = weak_for_mover.upgrade() {
                        engine.rdma_write_mof_send_ack(req, chunk);
                    }
                },
            ));

            ServerEngine {
                event_loop,
                device,
                cfg,
                mover,
                mof_store,
                connections: Mutex::new(HashMap::new()),
                pending_chunks: Mutex::new(HashMap::new()),
                work_ids: WorkIdGenerator::new(),
                next_qp_num: AtomicU32::new(1),
                logger,
            }
        });

        Ok(engine)
    }

    pub fn stop(&self) {
        self.event_loop.stop();
    }

    /// Binds `addr` and registers the listener's accept handler on the event loop.
    /// Blocks only long enough to bind; accepted connections are handled entirely on
    /// the event thread from then on (§4.3 "Server accept").
    pub fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr).map_err(ConnectionError::from)?;
        let local_addr = listener.local_addr().map_err(ConnectionError::from)?;

        let engine_weak = Arc::downgrade(self);
        self.event_loop
            .register(&mut listener, Interest::READABLE, move || {
                if let Some(engine) = engine_weak.upgrade() {
                    engine.accept_ready(&mut listener);
                }
            })
            .map_err(ConnectionError::from)?;

        slog::info!(self.logger, "listening"; "addr" => %local_addr);
        Ok(local_addr)
    }

    fn accept_ready(self: &Arc<Self>, listener: &mut TcpListener) {
        loop {
            match listener.accept() {
                Ok((std_stream, peer_addr)) => {
                    if let Err(e) = self.accept_one(std_stream) {
                        slog::warn!(self.logger, "accept handshake failed"; "peer" => %peer_addr, "error" => %e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    slog::error!(self.logger, "accept failed"; "error" => %e);
                    break;
                }
            }
        }
    }

    fn accept_one(self: &Arc<Self>, std_stream: std::net::TcpStream) -> std::result::Result<(), ConnectionError> {
        let mut std_stream = std_stream;
        let peer_qp_num = std_stream.read_u32::<LittleEndian>()?;
        let peer_credits = std_stream.read_u32::<LittleEndian>()?;
        let peer_rkey = std_stream.read_u32::<LittleEndian>()?;

        let qp_num = self.next_qp_num.fetch_add(1, Ordering::Relaxed);
        let local_credits = self.cfg.wqes_per_conn.saturating_sub(1);
        std_stream.write_u32::<LittleEndian>(qp_num)?;
        std_stream.write_u32::<LittleEndian>(local_credits)?;
        std_stream.write_u32::<LittleEndian>(0)?;

        std_stream.set_nodelay(true).ok();
        std_stream.set_nonblocking(true)?;
        let mut mio_stream = TcpStream::from_std(std_stream);

        let engine_weak = Arc::downgrade(self);
        self.event_loop
            .register(&mut mio_stream, Interest::READABLE, move || {
                if let Some(engine) = engine_weak.upgrade() {
                    engine.on_connection_readable(qp_num);
                }
            })?;

        let peer = PeerInfo { credits_granted: peer_credits, remote_rkey: peer_rkey, qp_num: peer_qp_num };
        let conn = Arc::new(Connection::new(
            mio_stream,
            peer,
            qp_num,
            self.cfg.wqes_per_conn,
            self.device.clone(),
            self.logger.clone(),
        ));
        conn.mark_established();
        self.connections.lock().unwrap().insert(qp_num, conn);

        slog::info!(self.logger, "accepted connection"; "qp_num" => qp_num);
        Ok(())
    }

    fn on_connection_readable(self: &Arc<Self>, qp_num: u32) {
        let conn = match self.connections.lock().unwrap().get(&qp_num).cloned() {
            Some(conn) => conn,
            None => return,
        };

        match conn.on_readable() {
            Ok(delivered) => {
                for item in delivered {
                    self.handle_delivered(&conn, item);
                }
            }
            Err(_) => {
                slog::warn!(self.logger, "connection went bad"; "qp_num" => qp_num);
                if conn.received_counter() == 0 {
                    self.connections.lock().unwrap().remove(&qp_num);
                }
            }
        }
    }

    fn handle_delivered(self: &Arc<Self>, conn: &Arc<Connection>, item: Delivered) {
        let payload = match item {
            Delivered::Message { payload, .. } => payload,
            // A server never expects an RDMA-WRITE addressed to it: nothing here owns
            // a buffer pool pair to land it in.
            Delivered::RdmaWrite { .. } => {
                slog::warn!(self.logger, "unexpected RDMA write on server side, ignoring");
                return;
            }
        };

        let fetch = match FetchRequest::decode(&payload) {
            Ok(fetch) => fetch,
            Err(e) => {
                slog::warn!(self.logger, "malformed fetch request, dropping"; "error" => %e);
                conn.note_request_completed();
                return;
            }
        };

        let req = ShuffleReq { fetch, conn: conn.clone() };
        self.mover.insert_incoming_req(req);
    }

    /// `rdma_write_mof_send_ack(req, local_addr, length, chunk, record)` (§4.7).
    fn rdma_write_mof_send_ack(self: &Arc<Self>, req: ShuffleReq, chunk: Chunk) {
        let conn = req.conn.clone();
        let rdma_send_size = (self.cfg.rdma_buf_size as u64).min(chunk.bytes.len() as u64);

        let ack = FetchAck {
            raw_length: chunk.bytes.len() as u64,
            part_length: chunk.bytes.len() as u64,
            rdma_send_size: rdma_send_size as u32,
            file_offset: req.fetch.file_offset,
            mof_path: req.fetch.mof_path.clone(),
        };

        let payload = match ack.encode() {
            Ok(payload) => payload,
            Err(e) => {
                slog::warn!(self.logger, "ack payload too large, dropping"; "error" => %e);
                self.mof_store.release_chunk(chunk);
                conn.note_request_completed();
                return;
            }
        };

        if conn.state() == ConnState::Bad {
            self.mof_store.release_chunk(chunk);
            conn.note_request_completed();
            if conn.received_counter() == 0 {
                self.connections.lock().unwrap().remove(&conn.qp_num);
            }
            return;
        }

        let chunk_wr_id = WorkId::for_server_chunk(self.work_ids.next());
        let rdma_bytes = &chunk.bytes[..rdma_send_size as usize];

        if let Err(e) = conn.rdma_write(chunk_wr_id, req.fetch.remote_addr, 0, rdma_bytes, false) {
            slog::warn!(self.logger, "rdma write failed"; "error" => %e);
            self.mof_store.release_chunk(chunk);
            conn.note_request_completed();
            return;
        }

        // The chunk must be released exactly once; stash it before posting so the CQ
        // completion handler for this wr_id (whenever it actually fires - immediately
        // if credits were available, later if this ack had to backlog) can find it.
        self.pending_chunks.lock().unwrap().insert(chunk_wr_id.raw(), (conn.clone(), chunk.clone()));

        match conn.post_message(chunk_wr_id, MessageType::Rts, req.fetch.freq_handle, payload, true) {
            Ok(_) => {}
            Err(e) => {
                slog::warn!(self.logger, "posting ack failed"; "error" => %e);
                if let Some((conn, chunk)) = self.pending_chunks.lock().unwrap().remove(&chunk_wr_id.raw()) {
                    self.mof_store.release_chunk(chunk);
                    conn.note_request_completed();
                }
            }
        }
    }

    fn drain_completions(&self) {
        for completion in self.device.poll(MAX_CQ_EVENTS_PER_WAKE_SERVER) {
            self.dispatch_completion(completion);
        }
    }

    fn dispatch_completion(&self, completion: WorkCompletion) {
        match completion.status {
            CompletionStatus::Flush => {
                slog::debug!(self.logger, "flush completion during teardown");
                if completion.wr_id.is_chunk() {
                    self.release_pending_chunk(completion.wr_id.raw());
                }
            }
            CompletionStatus::Error(status) => {
                if let Some(conn) = self.connections.lock().unwrap().get(&completion.conn_qp_num).cloned() {
                    conn.mark_bad();
                }
                if completion.wr_id.is_chunk() {
                    self.release_pending_chunk(completion.wr_id.raw());
                }
                slog::error!(self.logger, "completion error"; "status" => status, "qp_num" => completion.conn_qp_num);
            }
            CompletionStatus::Ok => {
                if completion.op == Op::Send && completion.wr_id.is_chunk() {
                    self.release_pending_chunk(completion.wr_id.raw());
                }
            }
        }
    }

    fn release_pending_chunk(&self, wr_id: u64) {
        if let Some((conn, chunk)) = self.pending_chunks.lock().unwrap().remove(&wr_id) {
            self.mof_store.release_chunk(chunk);
            conn.note_request_completed();
            if conn.state() == ConnState::Bad && conn.received_counter() == 0 {
                self.connections.lock().unwrap().remove(&conn.qp_num);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryMofStore;
    use crate::wire::{encode_credit_frame, Frame, FrameReader, Header};
    use std::io::Write as StdWrite;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::AtomicUsize;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_config() -> ShuffleConfig {
        ShuffleConfig {
            wqes_per_conn: 4,
            signal_interval: 1,
            netlev_timeout_ms: 2000,
            reconnect_tries: 2,
            use_contig_pages: false,
            compression_buffer_ratio: 0.2,
            rdma_buf_size: 4096,
            num_pairs: 2,
            compression_enabled: false,
        }
    }

    /// Wraps `InMemoryMofStore` to count releases, so a test can tell whether
    /// `rdma_write_mof_send_ack`'s chunk was released exactly once.
    struct CountingMofStore {
        inner: InMemoryMofStore,
        releases: AtomicUsize,
    }

    impl CountingMofStore {
        fn new() -> CountingMofStore {
            CountingMofStore { inner: InMemoryMofStore::new(), releases: AtomicUsize::new(0) }
        }

        fn put(&self, path: impl Into<String>, bytes: Vec<u8>) {
            self.inner.put(path, bytes);
        }

        fn release_count(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    impl MofStore for CountingMofStore {
        fn acquire_chunk(&self, path: &str, offset: u64, length: u64) -> Chunk {
            self.inner.acquire_chunk(path, offset, length)
        }

        fn release_chunk(&self, chunk: Chunk) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release_chunk(chunk);
        }
    }

    /// Performs the client half of the handshake over a bare `std::net::TcpStream`,
    /// returning the peer's granted qp_num/credits/rkey.
    fn handshake(stream: &mut StdTcpStream) -> (u32, u32, u32) {
        stream.write_u32::<LittleEndian>(1).unwrap();
        stream.write_u32::<LittleEndian>(3).unwrap();
        stream.write_u32::<LittleEndian>(0).unwrap();
        let qp_num = stream.read_u32::<LittleEndian>().unwrap();
        let credits = stream.read_u32::<LittleEndian>().unwrap();
        let rkey = stream.read_u32::<LittleEndian>().unwrap();
        (qp_num, credits, rkey)
    }

    #[test]
    fn accept_handshake_assigns_qp_num_and_grants_credits() {
        let (event_loop, _join) = EventLoop::start(Duration::from_millis(20), test_logger()).unwrap();
        let store = Arc::new(InMemoryMofStore::new());
        let engine = ServerEngine::new(event_loop, test_config(), store, test_logger()).unwrap();
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut stream = StdTcpStream::connect(addr).unwrap();
        let (qp_num, credits, _rkey) = handshake(&mut stream);
        assert!(qp_num >= 1);
        assert_eq!(credits, test_config().wqes_per_conn - 1);

        engine.stop();
    }

    #[test]
    fn rdma_write_mof_send_ack_delivers_ack_and_data_and_releases_chunk_once() {
        let (event_loop, _join) = EventLoop::start(Duration::from_millis(20), test_logger()).unwrap();
        let store = Arc::new(CountingMofStore::new());
        let pattern: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        store.put("map_0", pattern.clone());
        let engine = ServerEngine::new(event_loop, test_config(), store.clone(), test_logger()).unwrap();
        let addr = engine.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut stream = StdTcpStream::connect(addr).unwrap();
        handshake(&mut stream);

        let freq_handle = 0xabcd_u64;
        let request = FetchRequest {
            jobid: "job1".into(),
            mapid: "map_0".into(),
            mop_offset: 0,
            reduceid: 0,
            remote_addr: 7,
            freq_handle,
            chunk_size: pattern.len() as u32,
            file_offset: 0,
            mof_path: "map_0".into(),
            total_uncompressed: pattern.len() as u64,
            total_rdma: pattern.len() as u64,
        };
        let payload = request.encode().unwrap();
        let header = Header { credits: 0, msg_type: MessageType::Rts, tot_len: payload.len() as u16, src_req: freq_handle };
        let frame = encode_credit_frame(&header, &payload).unwrap();
        stream.write_all(&frame).unwrap();

        stream.set_nonblocking(true).unwrap();
        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for _ in 0..100 {
            frames.extend(reader.read_available(&mut stream).unwrap_or_default());
            if frames.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(frames.len(), 2, "expected an ack frame and an rdma write frame");

        let mut saw_ack = false;
        let mut saw_data = false;
        for frame in &frames {
            match frame {
                Frame::Credit { header, payload } => {
                    assert_eq!(header.src_req, freq_handle);
                    let ack = FetchAck::decode(payload).unwrap();
                    assert_eq!(ack.raw_length, pattern.len() as u64);
                    assert_eq!(ack.mof_path, "map_0");
                    saw_ack = true;
                }
                Frame::RdmaWrite { pair_id, data, .. } => {
                    assert_eq!(*pair_id, 7);
                    assert_eq!(data, &pattern);
                    saw_data = true;
                }
            }
        }
        assert!(saw_ack && saw_data);

        let mut releases = 0;
        for _ in 0..50 {
            releases = store.release_count();
            if releases == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(releases, 1, "chunk must be released exactly once");

        engine.stop();
    }
}
