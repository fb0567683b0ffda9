//! Connection lifecycle (C3) and credit-based flow control (C4).
//!
//! Generalizes `networking::chunk`'s send/receive bookkeeping from a single
//! unbounded stream to a credit-limited one: a connection may not post more sends
//! than its peer has granted receive buffers for, queues the rest on a backlog, and
//! replenishes the peer once it has consumed half its own posted receives.

use crate::error::ConnectionError;
use crate::verbs::{CompletionSink, CompletionStatus, Op, PeerInfo, WorkCompletion, WorkId};
use crate::wire::{encode_credit_frame, encode_rdma_write_frame, Frame, FrameReader, Header, MessageType};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    Connecting,
    Rtr,
    Established,
    Bad,
    Closed,
}

/// A message delivered to the owning engine off `Connection::on_readable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    /// A non-NOOP credit-protocol message: a fetch request on the server side, a fetch
    /// ack on the client side.
    Message { src_req: u64, payload: Vec<u8> },
    /// A one-sided RDMA WRITE landing directly in a buffer pool pair; carries no
    /// `src_req` because it consumes no posted receive (§4.10).
    RdmaWrite { pair_id: u64, offset: u32, data: Vec<u8> },
}

struct Pending {
    wr_id: WorkId,
    header: Header,
    payload: Vec<u8>,
    signalled: bool,
}

struct Inner {
    state: ConnState,
    stream: TcpStream,
    reader: FrameReader,
    /// Sends this side may still post before it must backlog (§4.4).
    credits: u32,
    /// Receives consumed since this side last told its peer to grant more credit.
    returning: u32,
    backlog: VecDeque<Pending>,
    egress: Vec<u8>,
}

impl Inner {
    fn queue_bytes(&mut self, bytes: Vec<u8>) {
        self.egress.extend(bytes);
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.egress.is_empty() {
            match self.stream.write(&self.egress) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote zero bytes")),
                Ok(n) => {
                    self.egress.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// One established (or establishing) connection between this process and a peer.
pub struct Connection {
    inner: Mutex<Inner>,
    pub peer: PeerInfo,
    pub qp_num: u32,
    wqes_per_conn: u32,
    completion_sink: Arc<dyn CompletionSink>,
    /// Requests received on this connection not yet fully handled: incremented when a
    /// `Delivered::Message` surfaces, decremented by the owning engine once that
    /// request's response has completed. Used by the server to defer deleting a `BAD`
    /// connection while work is still outstanding (§4.3, §4.9).
    received_counter: AtomicU32,
    logger: slog::Logger,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: PeerInfo,
        qp_num: u32,
        wqes_per_conn: u32,
        completion_sink: Arc<dyn CompletionSink>,
        logger: slog::Logger,
    ) -> Connection {
        Connection {
            inner: Mutex::new(Inner {
                state: ConnState::Rtr,
                stream,
                reader: FrameReader::new(),
                credits: peer.credits_granted,
                returning: 0,
                backlog: VecDeque::new(),
                egress: Vec::new(),
            }),
            peer,
            qp_num,
            wqes_per_conn,
            completion_sink,
            received_counter: AtomicU32::new(0),
            logger,
        }
    }

    /// Receive work entries posted for this connection; a constant equal to
    /// `wqes_per_conn` for the lifetime of an `ESTABLISHED` connection rather than a
    /// discrete pool of WQE objects, since the loopback backend has no separate
    /// receive-entry resource to post against (§4.9 invariant 2).
    pub fn posted_recvs(&self) -> u32 {
        self.wqes_per_conn
    }

    pub fn received_counter(&self) -> u32 {
        self.received_counter.load(Ordering::SeqCst)
    }

    /// Called by the owning engine once a request's response has fully completed
    /// (chunk released, or request dropped as malformed).
    pub fn note_request_completed(&self) {
        self.received_counter.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    pub fn mark_established(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Rtr || inner.state == ConnState::Connecting {
            inner.state = ConnState::Established;
        }
    }

    pub fn mark_bad(&self) {
        self.inner.lock().unwrap().state = ConnState::Bad;
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().state = ConnState::Closed;
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }

    pub fn credits(&self) -> u32 {
        self.inner.lock().unwrap().credits
    }

    /// Posts a credit-protocol message, or queues it on the backlog if no send credit
    /// is currently available. Returns `Ok(true)` if sent immediately, `Ok(false)` if
    /// backlogged (§4.4 "post-or-backlog").
    pub fn post_message(
        &self,
        wr_id: WorkId,
        msg_type: MessageType,
        src_req: u64,
        payload: Vec<u8>,
        signalled: bool,
    ) -> Result<bool, ConnectionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Established {
            return Err(ConnectionError::ConnectionBad);
        }

        let header = Header { credits: 0, msg_type, tot_len: payload.len() as u16, src_req };

        if inner.credits == 0 {
            inner.backlog.push_back(Pending { wr_id, header, payload, signalled });
            return Ok(false);
        }

        inner.credits -= 1;
        self.send_now(&mut inner, wr_id, header, payload, signalled)?;
        Ok(true)
    }

    /// One-sided RDMA WRITE: never backlogged, consumes no credit of either side's
    /// (§4.10 "no matching posted receive").
    pub fn rdma_write(
        &self,
        wr_id: WorkId,
        pair_id: u64,
        offset: u32,
        data: &[u8],
        signalled: bool,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Established {
            return Err(ConnectionError::ConnectionBad);
        }

        let frame = encode_rdma_write_frame(pair_id, offset, data)?;
        let bytes = data.len() as u32;
        inner.queue_bytes(frame);
        inner.flush()?;

        if signalled {
            self.completion_sink.push(WorkCompletion {
                wr_id,
                op: Op::RdmaWrite,
                status: CompletionStatus::Ok,
                conn_qp_num: self.qp_num,
                bytes,
            });
        }
        Ok(())
    }

    fn send_now(
        &self,
        inner: &mut Inner,
        wr_id: WorkId,
        header: Header,
        payload: Vec<u8>,
        signalled: bool,
    ) -> Result<(), ConnectionError> {
        let bytes = payload.len() as u32;
        let frame = encode_credit_frame(&header, &payload)?;
        inner.queue_bytes(frame);
        inner.flush()?;

        if signalled {
            self.completion_sink.push(WorkCompletion {
                wr_id,
                op: Op::Send,
                status: CompletionStatus::Ok,
                conn_qp_num: self.qp_num,
                bytes,
            });
        }
        Ok(())
    }

    fn drain_backlog_locked(&self, inner: &mut Inner) -> Result<(), ConnectionError> {
        while inner.credits > 0 {
            let Some(pending) = inner.backlog.pop_front() else { break };
            inner.credits -= 1;
            self.send_now(inner, pending.wr_id, pending.header, pending.payload, pending.signalled)?;
        }
        Ok(())
    }

    /// Sends a dedicated NOOP carrying the accumulated credit grant. NOOPs bypass the
    /// outgoing credit ceiling entirely - otherwise a connection with zero remaining
    /// send credits could never tell its peer to grant more, and both sides would
    /// stall permanently.
    fn send_noop_grant_locked(&self, inner: &mut Inner) -> Result<(), ConnectionError> {
        let grant = inner.returning.min(u8::MAX as u32);
        inner.returning = 0;
        let header = Header { credits: grant as u8, msg_type: MessageType::Noop, tot_len: 0, src_req: 0 };
        let frame = encode_credit_frame(&header, &[])?;
        inner.queue_bytes(frame);
        inner.flush()?;
        Ok(())
    }

    /// Drains whatever is available on the socket, updates credit bookkeeping, and
    /// returns every application-level message uncovered in the process.
    pub fn on_readable(&self) -> Result<Vec<Delivered>, ConnectionError> {
        let mut inner = self.inner.lock().unwrap();
        let frames = {
            let Inner { reader, stream, .. } = &mut *inner;
            reader.read_available(stream)
        };

        let frames = match frames {
            Ok(frames) => frames,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                inner.state = ConnState::Bad;
                return Err(ConnectionError::ConnectionBad);
            }
            Err(e) => {
                inner.state = ConnState::Bad;
                return Err(ConnectionError::Io(e));
            }
        };

        let mut delivered = Vec::with_capacity(frames.len());
        for frame in frames {
            match frame {
                Frame::Credit { header, payload } => {
                    let ceiling = self.wqes_per_conn - 1;
                    let granted = inner.credits + header.credits as u32;
                    if granted > ceiling {
                        slog::error!(self.logger, "credit overflow, clamping";
                            "qp_num" => self.qp_num, "granted" => granted, "ceiling" => ceiling);
                    }
                    inner.credits = granted.min(ceiling);
                    if header.msg_type == MessageType::Rts {
                        self.received_counter.fetch_add(1, Ordering::SeqCst);
                        delivered.push(Delivered::Message { src_req: header.src_req, payload });
                    }
                    inner.returning += 1;
                    if inner.returning * 2 >= self.wqes_per_conn {
                        self.send_noop_grant_locked(&mut inner)?;
                    }
                }
                Frame::RdmaWrite { pair_id, offset, data } => {
                    delivered.push(Delivered::RdmaWrite { pair_id, offset, data });
                }
            }
        }

        self.drain_backlog_locked(&mut inner)?;
        Ok(delivered)
    }

    /// Flushes whatever is still queued in egress; called when the event loop reports
    /// the socket writable again after a partial write.
    pub fn on_writable(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush()?;
        Ok(())
    }
}
