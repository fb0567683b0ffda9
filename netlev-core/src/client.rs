//! Client (reducer-side) engine (C6).

use crate::collaborators::{FetchReqHandle, MergeManager};
use crate::config::{ShuffleConfig, MAX_CQ_EVENTS_PER_WAKE_CLIENT};
use crate::connection::{ConnState, Connection, Delivered};
use crate::device::Device;
use crate::error::{ConnectionError, Error, Result};
use crate::pool::BufferPool;
use crate::reactor::EventLoop;
use crate::verbs::{CompletionStatus, Op, WorkId, WorkIdGenerator};
use crate::wire::{FetchAck, FetchRequest, MessageType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Event loop wakeup cadence; short enough that `stop()` is observed promptly without
/// spinning.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct ClientEngine {
    event_loop: Arc<EventLoop>,
    device: Arc<Device>,
    pool: Arc<BufferPool>,
    cfg: ShuffleConfig,
    merger: Arc<dyn MergeManager>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    by_qp: Mutex<HashMap<u32, Arc<Connection>>>,
    tokens: Mutex<HashMap<u32, Token>>,
    dns_cache: Mutex<HashMap<String, SocketAddr>>,
    outstanding: Mutex<HashMap<u64, FetchReqHandle>>,
    work_ids: WorkIdGenerator,
    next_qp_num: AtomicU32,
    sends_since_signal: AtomicU32,
    logger: slog::Logger,
}

impl ClientEngine {
    pub fn new(
        event_loop: Arc<EventLoop>,
        cfg: ShuffleConfig,
        merger: Arc<dyn MergeManager>,
        logger: slog::Logger,
    ) -> Result<Arc<ClientEngine>> {
        let (device, cq_token) = Device::new("netlev_client0", &event_loop)?;
        let pair_size = cfg.pair_size();
        let pool = Arc::new(BufferPool::new(cfg.num_pairs, pair_size)?);

        let engine = Arc::new_cyclic(|weak: &Weak<ClientEngine>| {
            let weak_for_cq = weak.clone();
            event_loop.set_handler(cq_token, move || {
                if let Some(engine) = weak_for_cq.upgrade() {
                    engine.drain_completions();
                }
            });

            ClientEngine {
                event_loop,
                device,
                pool,
                cfg,
                merger,
                connections: Mutex::new(HashMap::new()),
                by_qp: Mutex::new(HashMap::new()),
                tokens: Mutex::new(HashMap::new()),
                dns_cache: Mutex::new(HashMap::new()),
                outstanding: Mutex::new(HashMap::new()),
                work_ids: WorkIdGenerator::new(),
                next_qp_num: AtomicU32::new(1),
                sends_since_signal: AtomicU32::new(0),
                logger,
            }
        });

        Ok(engine)
    }

    pub fn stop(&self) {
        self.event_loop.stop();
    }

    /// `issue_fetch(req, buff, buf_len)` (§4.6), flattened to its constituent fields
    /// since this crate has no single reducer-owned `req` object to mutate in place.
    #[allow(clippy::too_many_arguments)]
    pub fn issue_fetch(
        self: &Arc<Self>,
        host: &str,
        job_id: &str,
        map_id: &str,
        reduce_id: u32,
        mof_path: &str,
        file_offset: u64,
        buf_len: usize,
    ) -> Result<u64> {
        if buf_len == 0 {
            return Err(Error::InvalidArgument("buf_len must be > 0"));
        }

        let conn = self.connect(host)?;
        let pair = self.pool.acquire();

        let freq_handle = self.work_ids.next();
        let fetch = FetchRequest {
            jobid: job_id.to_string(),
            mapid: map_id.to_string(),
            mop_offset: file_offset,
            reduceid: reduce_id,
            remote_addr: pair.id as u64,
            freq_handle,
            chunk_size: buf_len as u32,
            file_offset,
            mof_path: mof_path.to_string(),
            total_uncompressed: buf_len as u64,
            total_rdma: buf_len as u64,
        };

        let payload = match fetch.encode() {
            Ok(p) => p,
            Err(e) => {
                self.pool.release(pair.id);
                return Err(Error::Wire(e));
            }
        };

        let signalled = self.sends_since_signal.fetch_add(1, Ordering::Relaxed) % self.cfg.signal_interval == 0;
        let wr_id = WorkId::for_client_request(freq_handle);

        if let Err(e) = conn.post_message(wr_id, MessageType::Rts, freq_handle, payload, signalled) {
            self.pool.release(pair.id);
            return Err(Error::Connection(e));
        }

        self.outstanding.lock().unwrap().insert(
            freq_handle,
            FetchReqHandle {
                host: host.to_string(),
                job_id: job_id.to_string(),
                map_id: map_id.to_string(),
                reduce_id,
                mof_path: mof_path.to_string(),
                file_offset,
                buf_len,
                pair: pair.id,
                freq_handle,
                recvd_msg: None,
            },
        );

        Ok(freq_handle)
    }

    /// Looks up (or establishes) a connection to `host`, an already-resolvable
    /// `host:port` string. Retries up to `reconnect_tries` times on failure (§4.3).
    pub fn connect(self: &Arc<Self>, host: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connections.lock().unwrap().get(host) {
            if conn.state() == ConnState::Established {
                return Ok(conn.clone());
            }
        }

        let addr = self.resolve(host)?;
        for attempt in 0..self.cfg.reconnect_tries {
            match self.try_connect_once(host, addr) {
                Ok(conn) => {
                    self.connections.lock().unwrap().insert(host.to_string(), conn.clone());
                    self.by_qp.lock().unwrap().insert(conn.qp_num, conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    slog::warn!(self.logger, "connect attempt failed"; "host" => host, "attempt" => attempt, "error" => %e);
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectRetriesExhausted))
    }

    fn resolve(&self, host: &str) -> Result<SocketAddr> {
        if let Some(addr) = self.dns_cache.lock().unwrap().get(host) {
            return Ok(*addr);
        }
        let addr = host
            .to_socket_addrs()
            .map_err(ConnectionError::from)?
            .next()
            .ok_or(ConnectionError::DeviceUnavailable)?;
        self.dns_cache.lock().unwrap().insert(host.to_string(), addr);
        Ok(addr)
    }

    fn try_connect_once(self: &Arc<Self>, host: &str, addr: SocketAddr) -> std::result::Result<Arc<Connection>, ConnectionError> {
        let mut std_stream = StdTcpStream::connect_timeout(&addr, Duration::from_millis(self.cfg.netlev_timeout_ms))?;
        std_stream.set_nodelay(true).ok();

        let qp_num = self.next_qp_num.fetch_add(1, Ordering::Relaxed);
        let local_credits = self.cfg.wqes_per_conn.saturating_sub(1);

        std_stream.write_u32::<LittleEndian>(qp_num)?;
        std_stream.write_u32::<LittleEndian>(local_credits)?;
        std_stream.write_u32::<LittleEndian>(0)?;

        let peer_qp_num = std_stream.read_u32::<LittleEndian>()?;
        let peer_credits = std_stream.read_u32::<LittleEndian>()?;
        let peer_rkey = std_stream.read_u32::<LittleEndian>()?;

        std_stream.set_nonblocking(true)?;
        let mut mio_stream = TcpStream::from_std(std_stream);

        let engine_weak = Arc::downgrade(self);
        let token = self
            .event_loop
            .register(&mut mio_stream, Interest::READABLE, move || {
                if let Some(engine) = engine_weak.upgrade() {
                    engine.on_connection_readable(qp_num);
                }
            })
            .map_err(ConnectionError::from)?;

        let peer = crate::verbs::PeerInfo { credits_granted: peer_credits, remote_rkey: peer_rkey, qp_num: peer_qp_num };
        let conn = Arc::new(Connection::new(
            mio_stream,
            peer,
            qp_num,
            self.cfg.wqes_per_conn,
            self.device.clone(),
            self.logger.clone(),
        ));
        conn.mark_established();

        self.tokens.lock().unwrap().insert(qp_num, token);
        slog::info!(self.logger, "connected"; "host" => host, "qp_num" => qp_num);
        Ok(conn)
    }

    fn on_connection_readable(self: &Arc<Self>, qp_num: u32) {
        let conn = match self.by_qp.lock().unwrap().get(&qp_num).cloned() {
            Some(conn) => conn,
            None => return,
        };

        match conn.on_readable() {
            Ok(delivered) => {
                for item in delivered {
                    self.handle_delivered(item);
                }
            }
            Err(_) => {
                slog::warn!(self.logger, "connection went bad"; "qp_num" => qp_num);
                self.fail_outstanding_for_connection(qp_num);
            }
        }
    }

    /// Fails every in-flight fetch that was waiting on `qp_num`'s connection: returns
    /// each one's buffer-pool pair to the free list and reports the failure through
    /// `MergeManager` so the caller can retry rather than hang forever (§8 Scenario 3).
    fn fail_outstanding_for_connection(&self, qp_num: u32) {
        let host = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .find(|(_, conn)| conn.qp_num == qp_num)
            .map(|(host, _)| host.clone());

        let Some(host) = host else { return };

        let failed: Vec<FetchReqHandle> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            let ids: Vec<u64> =
                outstanding.iter().filter(|(_, req)| req.host == host).map(|(id, _)| *id).collect();
            ids.into_iter().filter_map(|id| outstanding.remove(&id)).collect()
        };

        for req in failed {
            self.pool.release(req.pair);
            self.merger.fail_fetch_req(&req);
        }
    }

    fn handle_delivered(&self, item: Delivered) {
        match item {
            Delivered::Message { src_req, payload } => {
                let ack = match FetchAck::decode(&payload) {
                    Ok(ack) => ack,
                    Err(e) => {
                        slog::warn!(self.logger, "malformed ack, dropping"; "error" => %e);
                        return;
                    }
                };

                let mut req = match self.outstanding.lock().unwrap().remove(&src_req) {
                    Some(req) => req,
                    None => {
                        slog::warn!(self.logger, "ack for unknown freq_handle, dropping"; "src_req" => src_req);
                        return;
                    }
                };

                req.recvd_msg = Some(ack);
                self.comp_fetch_req(req);
            }
            Delivered::RdmaWrite { pair_id, offset, data } => {
                let pair = self.pool.pair(pair_id as usize);
                self.pool.write_primary_at(&pair, offset as usize, &data);
            }
        }
    }

    /// `client.comp_fetch_req(req)` (§4.6): the engine is transparent to whether a
    /// decompression shim sits above it - any such shim installs its own
    /// `MergeManager` and is invoked the same way a direct merger would be.
    fn comp_fetch_req(&self, req: FetchReqHandle) {
        self.merger.update_fetch_req(&req);
        self.merger.mark_req_as_ready(&req);
        self.pool.release(req.pair);
    }

    fn drain_completions(&self) {
        for completion in self.device.poll(MAX_CQ_EVENTS_PER_WAKE_CLIENT) {
            self.dispatch_completion(completion);
        }
    }

    fn dispatch_completion(&self, completion: crate::verbs::WorkCompletion) {
        match completion.status {
            CompletionStatus::Flush => {
                slog::debug!(self.logger, "flush completion during teardown");
            }
            CompletionStatus::Error(status) => {
                if let Some(conn) = self.by_qp.lock().unwrap().get(&completion.conn_qp_num).cloned() {
                    conn.mark_bad();
                }
                slog::error!(self.logger, "completion error"; "status" => status, "qp_num" => completion.conn_qp_num);
            }
            CompletionStatus::Ok => {
                // Client sends carry no resource that needs releasing on completion -
                // only the server's chunk-tagged SEND does (§4.3).
                debug_assert!(completion.op == Op::Send || completion.op == Op::RdmaWrite);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingMergeManager;
    use crate::wire::{encode_credit_frame, Frame, FrameReader};
    use std::io::Write;
    use std::net::TcpListener as StdTcpListener;

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

    #[test]
    fn issue_fetch_rejects_zero_length_buffer() {
        let (event_loop, _join) = EventLoop::start(Duration::from_millis(20), test_logger()).unwrap();
        let merger = Arc::new(RecordingMergeManager::new());
        let engine = ClientEngine::new(event_loop, test_config(), merger, test_logger()).unwrap();

        let err = engine.issue_fetch("127.0.0.1:1", "job1", "map0", 0, "path", 0, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn issue_fetch_posts_a_well_formed_request_and_completes_on_ack() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (event_loop, _join) = EventLoop::start(Duration::from_millis(20), test_logger()).unwrap();
        let merger = Arc::new(RecordingMergeManager::new());
        let engine = ClientEngine::new(event_loop, test_config(), merger.clone(), test_logger()).unwrap();

        let freq_handle = engine.issue_fetch(&addr.to_string(), "job1", "map0", 2, "/m/0", 0, 128).unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        let peer_qp_num = peer.read_u32::<LittleEndian>().unwrap();
        let _peer_credits = peer.read_u32::<LittleEndian>().unwrap();
        let _peer_rkey = peer.read_u32::<LittleEndian>().unwrap();
        assert!(peer_qp_num >= 1);
        peer.write_u32::<LittleEndian>(99).unwrap();
        peer.write_u32::<LittleEndian>(3).unwrap();
        peer.write_u32::<LittleEndian>(0).unwrap();

        peer.set_nonblocking(true).unwrap();
        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for _ in 0..50 {
            frames = reader.read_available(&mut peer).unwrap_or_default();
            if !frames.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let request = match &frames[0] {
            Frame::Credit { header, payload } => {
                assert_eq!(header.msg_type, MessageType::Rts);
                assert_eq!(header.src_req, freq_handle);
                FetchRequest::decode(payload).unwrap()
            }
            _ => panic!("expected a credit frame carrying the fetch request"),
        };
        assert_eq!(request.jobid, "job1");
        assert_eq!(request.mapid, "map0");
        assert_eq!(request.reduceid, 2);
        assert_eq!(request.mof_path, "/m/0");

        let ack = FetchAck {
            raw_length: 128,
            part_length: 128,
            rdma_send_size: 128,
            file_offset: 0,
            mof_path: "/m/0".to_string(),
        };
        let header = Header { credits: 1, msg_type: MessageType::Rts, tot_len: 0, src_req: freq_handle };
        let frame = encode_credit_frame(&header, &ack.encode().unwrap()).unwrap();
        peer.set_nonblocking(false).unwrap();
        peer.write_all(&frame).unwrap();

        let mut acked = false;
        for _ in 0..50 {
            if merger.readied().contains(&freq_handle) {
                acked = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(acked, "ack was never delivered to the merge manager");
    }
}
