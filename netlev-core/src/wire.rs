//! Wire codec (C8): fixed-layout message header plus ASCII colon-separated payloads,
//! manual byteorder-based (de)serialization rather than a generic serde codec - the
//! peer on the other end of this wire is not guaranteed to be a Rust process.

use crate::config::{NETLEV_FETCH_REQSIZE, NETLEV_MOF_PATH_MAX_SIZE};
use crate::error::WireError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Size in bytes of the fixed header that precedes every payload.
pub const HEADER_SIZE: usize = 1 + 1 + 2 + 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageType {
    Noop,
    Rts,
}

impl MessageType {
    fn to_wire(self) -> u8 {
        match self {
            MessageType::Noop => 0,
            MessageType::Rts => 1,
        }
    }

    fn from_wire(byte: u8) -> Result<MessageType, WireError> {
        match byte {
            0 => Ok(MessageType::Noop),
            1 => Ok(MessageType::Rts),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// The fixed prefix of every posted message (§3 "Message header (wire)").
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub credits: u8,
    pub msg_type: MessageType,
    pub tot_len: u16,
    pub src_req: u64,
}

impl Header {
    pub fn encode<W: io::Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u8(self.credits)?;
        w.write_u8(self.msg_type.to_wire())?;
        w.write_u16::<LittleEndian>(self.tot_len)?;
        w.write_u64::<LittleEndian>(self.src_req)?;
        Ok(())
    }

    pub fn decode<R: io::Read>(mut r: R) -> Result<Header, WireError> {
        let credits = r.read_u8().map_err(|_| WireError::MissingField { field: "credits" })?;
        let msg_type_byte = r.read_u8().map_err(|_| WireError::MissingField { field: "type" })?;
        let tot_len = r
            .read_u16::<LittleEndian>()
            .map_err(|_| WireError::MissingField { field: "tot_len" })?;
        let src_req = r
            .read_u64::<LittleEndian>()
            .map_err(|_| WireError::MissingField { field: "src_req" })?;

        Ok(Header {
            credits,
            msg_type: MessageType::from_wire(msg_type_byte)?,
            tot_len,
            src_req,
        })
    }
}

/// Client -> server fetch request payload (§3 "Fetch request").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub jobid: String,
    pub mapid: String,
    pub mop_offset: u64,
    pub reduceid: u32,
    pub remote_addr: u64,
    pub freq_handle: u64,
    pub chunk_size: u32,
    pub file_offset: u64,
    pub mof_path: String,
    pub total_uncompressed: u64,
    pub total_rdma: u64,
}

impl FetchRequest {
    /// Serializes into the colon-separated ASCII grammar, failing if the encoded form
    /// would exceed `NETLEV_FETCH_REQSIZE`.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.mof_path.len() > NETLEV_MOF_PATH_MAX_SIZE {
            return Err(WireError::PathTooLong);
        }

        let encoded = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.jobid,
            self.mapid,
            self.mop_offset,
            self.reduceid,
            self.remote_addr,
            self.freq_handle,
            self.chunk_size,
            self.file_offset,
            self.mof_path,
            self.total_uncompressed,
            self.total_rdma,
        );

        if encoded.len() > NETLEV_FETCH_REQSIZE {
            return Err(WireError::OversizeRequest);
        }

        Ok(encoded.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<FetchRequest, WireError> {
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidInteger { field: "payload" })?;
        let mut fields = text.splitn(11, ':');

        let jobid = next_field(&mut fields, "jobid")?.to_string();
        let mapid = next_field(&mut fields, "mapid")?.to_string();
        let mop_offset = parse_field(next_field(&mut fields, "mop_offset")?, "mop_offset")?;
        let reduceid = parse_field(next_field(&mut fields, "reduceid")?, "reduceid")?;
        let remote_addr = parse_field(next_field(&mut fields, "remote_addr")?, "remote_addr")?;
        let freq_handle = parse_field(next_field(&mut fields, "freq_handle")?, "freq_handle")?;
        let chunk_size = parse_field(next_field(&mut fields, "chunk_size")?, "chunk_size")?;
        let file_offset = parse_field(next_field(&mut fields, "file_offset")?, "file_offset")?;
        let mof_path = next_field(&mut fields, "mof_path")?.to_string();
        let total_uncompressed = parse_field(next_field(&mut fields, "total_uncompressed")?, "total_uncompressed")?;
        let total_rdma = parse_field(next_field(&mut fields, "total_rdma")?, "total_rdma")?;

        if mof_path.len() > NETLEV_MOF_PATH_MAX_SIZE {
            return Err(WireError::PathTooLong);
        }

        Ok(FetchRequest {
            jobid,
            mapid,
            mop_offset,
            reduceid,
            remote_addr,
            freq_handle,
            chunk_size,
            file_offset,
            mof_path,
            total_uncompressed,
            total_rdma,
        })
    }
}

/// Server -> client fetch ack payload (§3 "Fetch ack").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAck {
    pub raw_length: u64,
    pub part_length: u64,
    pub rdma_send_size: u32,
    pub file_offset: u64,
    pub mof_path: String,
}

impl FetchAck {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.mof_path.len() > NETLEV_MOF_PATH_MAX_SIZE {
            return Err(WireError::PathTooLong);
        }

        let encoded = format!(
            "{}:{}:{}:{}:{}:",
            self.raw_length, self.part_length, self.rdma_send_size, self.file_offset, self.mof_path,
        );

        if encoded.len() > NETLEV_FETCH_REQSIZE {
            return Err(WireError::OversizeRequest);
        }

        Ok(encoded.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<FetchAck, WireError> {
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidInteger { field: "payload" })?;
        let mut fields = text.splitn(5, ':');

        let raw_length = parse_field(next_field(&mut fields, "rawLength")?, "rawLength")?;
        let part_length = parse_field(next_field(&mut fields, "partLength")?, "partLength")?;
        let rdma_send_size = parse_field(next_field(&mut fields, "rdma_send_size")?, "rdma_send_size")?;
        let file_offset = parse_field(next_field(&mut fields, "file_offset")?, "file_offset")?;
        // The grammar places a trailing separator after the path; strip it rather than
        // requiring every caller to know the ack (unlike the request) ends in ':'.
        let mof_path = next_field(&mut fields, "mof_path")?.trim_end_matches(':').to_string();

        if mof_path.len() > NETLEV_MOF_PATH_MAX_SIZE {
            return Err(WireError::PathTooLong);
        }

        Ok(FetchAck {
            raw_length,
            part_length,
            rdma_send_size,
            file_offset,
            mof_path,
        })
    }
}

/// Outer stream framing (§4.10): every message on the socket is tagged so a
/// one-sided RDMA WRITE - which does not consume a receive credit and carries no
/// header - can share the same `TcpStream` as credit-protocol traffic.
const TAG_CREDIT: u8 = 0;
const TAG_RDMA_WRITE: u8 = 1;
const RDMA_WRITE_HEADER_SIZE: usize = 8 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A normal header-plus-payload message, consuming one receive credit at the peer.
    Credit { header: Header, payload: Vec<u8> },
    /// A simulated one-sided RDMA WRITE landing directly in a buffer pool pair, with no
    /// matching posted receive (§4.10).
    RdmaWrite { pair_id: u64, offset: u32, data: Vec<u8> },
}

pub fn encode_credit_frame(header: &Header, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1 + HEADER_SIZE + payload.len());
    out.write_u8(TAG_CREDIT)?;
    header.encode(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_rdma_write_frame(pair_id: u64, offset: u32, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(1 + RDMA_WRITE_HEADER_SIZE + data.len());
    out.write_u8(TAG_RDMA_WRITE)?;
    out.write_u64::<LittleEndian>(pair_id)?;
    out.write_u32::<LittleEndian>(offset)?;
    out.write_u32::<LittleEndian>(data.len() as u32)?;
    out.extend_from_slice(data);
    Ok(out)
}

/// Incremental frame assembler fed raw bytes off a non-blocking stream; bytes that
/// don't yet add up to a full frame are buffered until the next read (§4.10, C1).
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader { buf: Vec::new() }
    }

    /// Drains the stream until it would block, returning every frame completed in the
    /// process, in arrival order.
    pub fn read_available<R: io::Read>(&mut self, stream: &mut R) -> io::Result<Vec<Frame>> {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection")),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self.drain_frames())
    }

    fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            match self.buf[0] {
                TAG_CREDIT => {
                    if self.buf.len() < 1 + HEADER_SIZE {
                        break;
                    }
                    let header = match Header::decode(&self.buf[1..1 + HEADER_SIZE]) {
                        Ok(header) => header,
                        Err(_) => {
                            // Desynced stream: nothing recoverable to do but stop here and
                            // let the caller tear the connection down.
                            self.buf.clear();
                            break;
                        }
                    };
                    let total = 1 + HEADER_SIZE + header.tot_len as usize;
                    if self.buf.len() < total {
                        break;
                    }
                    let payload = self.buf[1 + HEADER_SIZE..total].to_vec();
                    frames.push(Frame::Credit { header, payload });
                    self.buf.drain(..total);
                }
                TAG_RDMA_WRITE => {
                    if self.buf.len() < 1 + RDMA_WRITE_HEADER_SIZE {
                        break;
                    }
                    let mut inner = &self.buf[1..1 + RDMA_WRITE_HEADER_SIZE];
                    let pair_id = inner.read_u64::<LittleEndian>().unwrap();
                    let offset = inner.read_u32::<LittleEndian>().unwrap();
                    let len = inner.read_u32::<LittleEndian>().unwrap() as usize;
                    let total = 1 + RDMA_WRITE_HEADER_SIZE + len;
                    if self.buf.len() < total {
                        break;
                    }
                    let data = self.buf[1 + RDMA_WRITE_HEADER_SIZE..total].to_vec();
                    frames.push(Frame::RdmaWrite { pair_id, offset, data });
                    self.buf.drain(..total);
                }
                _ => {
                    self.buf.clear();
                    break;
                }
            }
        }
        frames
    }
}

fn next_field<'a>(fields: &mut std::str::SplitN<'a, char>, name: &'static str) -> Result<&'a str, WireError> {
    let field = fields.next().ok_or(WireError::MissingField { field: name })?;
    if field.is_empty() {
        return Err(WireError::MissingField { field: name });
    }
    Ok(field)
}

fn parse_field<T: std::str::FromStr>(text: &str, name: &'static str) -> Result<T, WireError> {
    text.parse().map_err(|_| WireError::InvalidInteger { field: name })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> FetchRequest {
        FetchRequest {
            jobid: "job1".into(),
            mapid: "map7".into(),
            mop_offset: 128,
            reduceid: 3,
            remote_addr: 0x7fff_0000_1234,
            freq_handle: 0xdead_beef,
            chunk_size: 4096,
            file_offset: 0,
            mof_path: "/m/1".into(),
            total_uncompressed: 4096,
            total_rdma: 4096,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = Header {
            credits: 7,
            msg_type: MessageType::Rts,
            tot_len: 42,
            src_req: 0x1122_3344_5566_7788,
        };

        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = Header::decode(&buf[..]).unwrap();
        assert_eq!(decoded.credits, header.credits);
        assert_eq!(decoded.msg_type, header.msg_type);
        assert_eq!(decoded.tot_len, header.tot_len);
        assert_eq!(decoded.src_req, header.src_req);
    }

    #[test]
    fn fetch_request_round_trip_is_identity() {
        let req = sample_request();
        let encoded = req.encode().unwrap();
        let decoded = FetchRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn fetch_ack_round_trip_is_identity() {
        let ack = FetchAck {
            raw_length: 4096,
            part_length: 4096,
            rdma_send_size: 4096,
            file_offset: 0,
            mof_path: "/m/1".into(),
        };
        let encoded = ack.encode().unwrap();
        let decoded = FetchAck::decode(&encoded).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn malformed_request_is_rejected_not_partially_decoded() {
        assert!(FetchRequest::decode(b"a:b:").is_err());
    }

    #[test]
    fn fetch_request_with_empty_mof_path_is_rejected() {
        let line = "j:m:0:1:100:5:4096:0::10:20";
        assert_eq!(FetchRequest::decode(line.as_bytes()), Err(WireError::MissingField { field: "mof_path" }));
    }

    #[test]
    fn request_at_799_bytes_is_accepted() {
        // Pad the mof_path so the encoded payload lands at exactly 799 bytes.
        let mut req = sample_request();
        let base_len = req.encode().unwrap().len();
        let pad = 799usize.saturating_sub(base_len);
        req.mof_path.push_str(&"a".repeat(pad));
        let encoded = req.encode().unwrap();
        assert_eq!(encoded.len(), 799);
    }

    #[test]
    fn request_at_800_bytes_or_more_is_rejected() {
        let mut req = sample_request();
        let base_len = req.encode().unwrap().len();
        let pad = (NETLEV_FETCH_REQSIZE + 1).saturating_sub(base_len);
        req.mof_path.push_str(&"a".repeat(pad));
        assert_eq!(req.encode(), Err(WireError::OversizeRequest));
    }

    #[test]
    fn path_longer_than_max_is_rejected_before_size_check() {
        let mut req = sample_request();
        req.mof_path = "a".repeat(NETLEV_MOF_PATH_MAX_SIZE + 1);
        assert_eq!(req.encode(), Err(WireError::PathTooLong));
    }

    #[test]
    fn frame_reader_assembles_credit_frame_split_across_reads() {
        let header = Header { credits: 1, msg_type: MessageType::Rts, tot_len: 5, src_req: 9 };
        let whole = encode_credit_frame(&header, b"hello").unwrap();

        let mut reader = FrameReader::new();
        let (first, second) = whole.split_at(3);
        assert!(reader.read_available(&mut &*first).unwrap().is_empty());

        let frames = reader.read_available(&mut &*second).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Credit { header: decoded, payload } => {
                assert_eq!(decoded.src_req, 9);
                assert_eq!(payload, b"hello");
            }
            _ => panic!("expected a Credit frame"),
        }
    }

    #[test]
    fn frame_reader_assembles_rdma_write_frame() {
        let whole = encode_rdma_write_frame(3, 128, b"payload-bytes").unwrap();
        let mut reader = FrameReader::new();
        let frames = reader.read_available(&mut &*whole).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::RdmaWrite { pair_id, offset, data } => {
                assert_eq!(*pair_id, 3);
                assert_eq!(*offset, 128);
                assert_eq!(data, b"payload-bytes");
            }
            _ => panic!("expected an RdmaWrite frame"),
        }
    }

    #[test]
    fn frame_reader_assembles_two_queued_frames_from_one_read() {
        let header = Header { credits: 0, msg_type: MessageType::Noop, tot_len: 0, src_req: 1 };
        let mut whole = encode_credit_frame(&header, b"").unwrap();
        whole.extend(encode_credit_frame(&header, b"").unwrap());

        let mut reader = FrameReader::new();
        let frames = reader.read_available(&mut &*whole).unwrap();
        assert_eq!(frames.len(), 2);
    }
}
