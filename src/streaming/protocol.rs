//! Session message types for stream transfers.
//!
//! One connection carries one session. The initiator prepares, both sides
//! send their files in turn, then the initiator closes.

use crate::error::{Result, StreamError};
use crate::streaming::types::{PlanId, StreamSummary, TableId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current session protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

const SUMMARY_LEN: usize = 16 + 4 + 8;

/// Chunk payload bytes besides the data: longest name, offset, flags, data length.
pub const CHUNK_HEADER_MAX: usize = 2 + u16::MAX as usize + 8 + 1 + 4;

/// Largest raw chunk whose frame still fits after worst-case lz4 expansion.
pub const MAX_CHUNK_SIZE: usize = (MAX_FRAME_SIZE as usize - CHUNK_HEADER_MAX - 4 - 20) / 11 * 10;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Prepare = 0x01,
    PrepareAck = 0x02,
    FileHeader = 0x03,
    Chunk = 0x04,
    FileEnd = 0x05,
    Received = 0x06,
    SendDone = 0x07,
    Complete = 0x08,
    SessionFailed = 0x09,
    Abort = 0x0A,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Prepare),
            0x02 => Some(Self::PrepareAck),
            0x03 => Some(Self::FileHeader),
            0x04 => Some(Self::Chunk),
            0x05 => Some(Self::FileEnd),
            0x06 => Some(Self::Received),
            0x07 => Some(Self::SendDone),
            0x08 => Some(Self::Complete),
            0x09 => Some(Self::SessionFailed),
            0x0A => Some(Self::Abort),
            _ => None,
        }
    }
}

// =============================================================================
// Chunk Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        const COMPRESSED = 1 << 0;
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn frame(msg_type: MessageType, payload_len: usize) -> Result<BytesMut> {
    if payload_len > MAX_FRAME_SIZE as usize {
        return Err(StreamError::protocol(format!(
            "{:?} payload of {} bytes exceeds maximum frame size {}",
            msg_type, payload_len, MAX_FRAME_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    Ok(buf)
}

fn put_str(buf: &mut BytesMut, s: &str, what: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        StreamError::protocol(format!(
            "{} is {} bytes, longer than {}",
            what,
            s.len(),
            u16::MAX
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn str_len(s: &str) -> usize {
    2 + s.len()
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(StreamError::protocol(format!("{} length truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(StreamError::protocol(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| StreamError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn get_uuid_bytes(payload: &mut Bytes, what: &str) -> Result<[u8; 16]> {
    if payload.remaining() < 16 {
        return Err(StreamError::protocol(format!("{} truncated", what)));
    }
    let mut raw = [0u8; 16];
    payload.copy_to_slice(&mut raw);
    Ok(raw)
}

fn put_summaries(buf: &mut BytesMut, summaries: &[StreamSummary]) {
    buf.put_u32(summaries.len() as u32);
    for s in summaries {
        buf.put_slice(s.table_id.as_bytes());
        buf.put_u32(s.files);
        buf.put_u64(s.total_size);
    }
}

fn get_summaries(payload: &mut Bytes) -> Result<Vec<StreamSummary>> {
    if payload.remaining() < 4 {
        return Err(StreamError::protocol("summary count truncated"));
    }
    let count = payload.get_u32() as usize;
    let required = count.saturating_mul(SUMMARY_LEN);
    if payload.remaining() < required {
        return Err(StreamError::protocol(format!(
            "summaries truncated: expected {} summaries ({} bytes), got {} bytes",
            count,
            required,
            payload.remaining()
        )));
    }
    let mut summaries = Vec::with_capacity(count);
    for _ in 0..count {
        let table_id = TableId::from_bytes(get_uuid_bytes(payload, "summary table")?);
        summaries.push(StreamSummary {
            table_id,
            files: payload.get_u32(),
            total_size: payload.get_u64(),
        });
    }
    Ok(summaries)
}

// =============================================================================
// PREPARE (0x01)
// =============================================================================

/// Opens a session: who we are, what we will send, what we want back.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepare {
    pub version: u16,
    pub plan_id: PlanId,
    pub description: String,
    pub session_index: u32,
    pub summaries: Vec<StreamSummary>,
    pub requests: Vec<TableId>,
}

impl Prepare {
    pub fn encode(&self) -> Result<Bytes> {
        let payload_len = 2
            + 16
            + str_len(&self.description)
            + 4
            + 4
            + self.summaries.len() * SUMMARY_LEN
            + 4
            + self.requests.len() * 16;
        let mut buf = frame(MessageType::Prepare, payload_len)?;
        buf.put_u16(self.version);
        buf.put_slice(self.plan_id.as_bytes());
        put_str(&mut buf, &self.description, "Prepare description")?;
        buf.put_u32(self.session_index);
        put_summaries(&mut buf, &self.summaries);
        buf.put_u32(self.requests.len() as u32);
        for table in &self.requests {
            buf.put_slice(table.as_bytes());
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(StreamError::protocol("Prepare payload too short"));
        }
        let version = payload.get_u16();
        let plan_id = PlanId::from_bytes(get_uuid_bytes(&mut payload, "Prepare plan id")?);
        let description = get_str(&mut payload, "Prepare description")?;
        if payload.remaining() < 4 {
            return Err(StreamError::protocol("Prepare session index truncated"));
        }
        let session_index = payload.get_u32();
        let summaries = get_summaries(&mut payload)?;
        if payload.remaining() < 4 {
            return Err(StreamError::protocol("Prepare request count truncated"));
        }
        let count = payload.get_u32() as usize;
        if payload.remaining() < count.saturating_mul(16) {
            return Err(StreamError::protocol("Prepare requests truncated"));
        }
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(TableId::from_bytes(get_uuid_bytes(
                &mut payload,
                "Prepare request",
            )?));
        }

        Ok(Self {
            version,
            plan_id,
            description,
            session_index,
            summaries,
            requests,
        })
    }
}

// =============================================================================
// PREPARE_ACK (0x02)
// =============================================================================

/// Follower's answer to [`Prepare`]: the summaries it will send back.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareAck {
    pub summaries: Vec<StreamSummary>,
}

impl PrepareAck {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = frame(
            MessageType::PrepareAck,
            4 + self.summaries.len() * SUMMARY_LEN,
        )?;
        put_summaries(&mut buf, &self.summaries);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            summaries: get_summaries(&mut payload)?,
        })
    }
}

// =============================================================================
// FILE_HEADER (0x03)
// =============================================================================

/// Announces a file before any of its data flows.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    pub table_id: TableId,
    pub file_name: String,
    pub size: u64,
}

impl FileHeader {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = frame(MessageType::FileHeader, 16 + str_len(&self.file_name) + 8)?;
        buf.put_slice(self.table_id.as_bytes());
        put_str(&mut buf, &self.file_name, "file name")?;
        buf.put_u64(self.size);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let table_id = TableId::from_bytes(get_uuid_bytes(&mut payload, "FileHeader table")?);
        let file_name = get_str(&mut payload, "FileHeader name")?;
        if payload.remaining() < 8 {
            return Err(StreamError::protocol("FileHeader size truncated"));
        }
        Ok(Self {
            table_id,
            file_name,
            size: payload.get_u64(),
        })
    }
}

// =============================================================================
// CHUNK (0x04)
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub file_name: String,
    pub offset: u64,
    pub flags: ChunkFlags,
    pub data: Bytes,
}

impl Chunk {
    pub fn encode(&self) -> Result<Bytes> {
        let payload_len = str_len(&self.file_name) + 8 + 1 + 4 + self.data.len();
        let mut buf = frame(MessageType::Chunk, payload_len)?;
        put_str(&mut buf, &self.file_name, "file name")?;
        buf.put_u64(self.offset);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let file_name = get_str(&mut payload, "Chunk file name")?;
        if payload.remaining() < 13 {
            return Err(StreamError::protocol("Chunk header truncated"));
        }
        let offset = payload.get_u64();
        let flags = ChunkFlags::from_bits_truncate(payload.get_u8());
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            return Err(StreamError::protocol(format!(
                "Chunk data truncated: expected {} bytes, got {}",
                len,
                payload.remaining()
            )));
        }
        Ok(Self {
            file_name,
            offset,
            flags,
            data: payload.copy_to_bytes(len),
        })
    }
}

// =============================================================================
// FILE_END (0x05) / RECEIVED (0x06)
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FileEnd {
    pub file_name: String,
}

impl FileEnd {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = frame(MessageType::FileEnd, str_len(&self.file_name))?;
        put_str(&mut buf, &self.file_name, "file name")?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            file_name: get_str(&mut payload, "FileEnd name")?,
        })
    }
}

/// Receiver's acknowledgement that a file is durable on its side.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub file_name: String,
}

impl Received {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = frame(MessageType::Received, str_len(&self.file_name))?;
        put_str(&mut buf, &self.file_name, "file name")?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            file_name: get_str(&mut payload, "Received name")?,
        })
    }
}

// =============================================================================
// SEND_DONE (0x07)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendDone {
    pub files: u64,
}

impl SendDone {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = frame(MessageType::SendDone, 8)?;
        buf.put_u64(self.files);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            return Err(StreamError::protocol("SendDone payload too short"));
        }
        Ok(Self {
            files: payload.get_u64(),
        })
    }
}

// =============================================================================
// SESSION_FAILED (0x09)
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SessionFailed {
    pub reason: String,
}

impl SessionFailed {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = frame(MessageType::SessionFailed, str_len(&self.reason))?;
        put_str(&mut buf, &self.reason, "SessionFailed reason")?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            reason: get_str(&mut payload, "SessionFailed reason")?,
        })
    }
}

// =============================================================================
// Message
// =============================================================================

/// Any session message, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Prepare(Prepare),
    PrepareAck(PrepareAck),
    FileHeader(FileHeader),
    Chunk(Chunk),
    FileEnd(FileEnd),
    Received(Received),
    SendDone(SendDone),
    Complete,
    SessionFailed(SessionFailed),
    Abort,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Prepare(_) => MessageType::Prepare,
            Message::PrepareAck(_) => MessageType::PrepareAck,
            Message::FileHeader(_) => MessageType::FileHeader,
            Message::Chunk(_) => MessageType::Chunk,
            Message::FileEnd(_) => MessageType::FileEnd,
            Message::Received(_) => MessageType::Received,
            Message::SendDone(_) => MessageType::SendDone,
            Message::Complete => MessageType::Complete,
            Message::SessionFailed(_) => MessageType::SessionFailed,
            Message::Abort => MessageType::Abort,
        }
    }

    pub fn name(&self) -> String {
        format!("{:?}", self.message_type())
    }

    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Message::Prepare(m) => m.encode(),
            Message::PrepareAck(m) => m.encode(),
            Message::FileHeader(m) => m.encode(),
            Message::Chunk(m) => m.encode(),
            Message::FileEnd(m) => m.encode(),
            Message::Received(m) => m.encode(),
            Message::SendDone(m) => m.encode(),
            Message::Complete => Ok(frame(MessageType::Complete, 0)?.freeze()),
            Message::SessionFailed(m) => m.encode(),
            Message::Abort => Ok(frame(MessageType::Abort, 0)?.freeze()),
        }
    }

    /// Decode one complete frame (header included).
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.remaining() < FRAME_HEADER_LEN {
            return Err(StreamError::protocol("Frame shorter than header"));
        }
        let len = frame.get_u32() as usize;
        let raw_type = frame.get_u8();
        let msg_type = MessageType::from_u8(raw_type)
            .ok_or_else(|| StreamError::protocol(format!("Unknown message type {:#04x}", raw_type)))?;
        if frame.remaining() != len {
            return Err(StreamError::protocol(format!(
                "Frame length mismatch: header says {}, got {}",
                len,
                frame.remaining()
            )));
        }

        Ok(match msg_type {
            MessageType::Prepare => Message::Prepare(Prepare::decode(frame)?),
            MessageType::PrepareAck => Message::PrepareAck(PrepareAck::decode(frame)?),
            MessageType::FileHeader => Message::FileHeader(FileHeader::decode(frame)?),
            MessageType::Chunk => Message::Chunk(Chunk::decode(frame)?),
            MessageType::FileEnd => Message::FileEnd(FileEnd::decode(frame)?),
            MessageType::Received => Message::Received(Received::decode(frame)?),
            MessageType::SendDone => Message::SendDone(SendDone::decode(frame)?),
            MessageType::Complete => Message::Complete,
            MessageType::SessionFailed => Message::SessionFailed(SessionFailed::decode(frame)?),
            MessageType::Abort => Message::Abort,
        })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream, header included.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(StreamError::protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r.read_u8().await?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + len as usize);
    buf.put_u32(len);
    buf.put_u8(msg_type);
    buf.resize(FRAME_HEADER_LEN + len as usize, 0);
    r.read_exact(&mut buf[FRAME_HEADER_LEN..]).await?;

    Ok(buf.freeze())
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    Supported(u16),
    TooOld { peer: u16, min_supported: u16 },
    TooNew { peer: u16, max_supported: u16 },
}

/// Check if a peer's protocol version is supported.
pub fn negotiate_version(peer_version: u16) -> VersionNegotiationResult {
    if peer_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            peer: peer_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if peer_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            peer: peer_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(peer_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
