//! Spool wire format: the `Chunk` message and its protobuf encoding.
//!
//! These field numbers and wire types ARE the protocol. A chunk is a plain
//! protobuf message, so peers built on any protobuf runtime interoperate
//! with this hand-written codec. Changing a field number or wire type is a
//! breaking change.
//!
//! Encoding rules:
//!   - optional fields are emitted whenever they are `Some`, even when zero
//!   - non-optional scalars are omitted when zero, `data` when empty
//!   - fields are written in ascending field-number order
//!
//! Decoding skips unknown field numbers by wire type so that newer peers can
//! add fields without breaking older ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

// ── Field numbers ─────────────────────────────────────────────────────────────

mod field {
    pub const TRANSFER_ID: u32 = 1;
    pub const PENDING_BYTES: u32 = 2;
    pub const MAX_CHUNK_SIZE_BYTES: u32 = 3;
    pub const MIN_DELAY_MICROSECONDS: u32 = 4;
    pub const OFFSET: u32 = 5;
    pub const DATA: u32 = 6;
    pub const REMAINING_BYTES: u32 = 7;
    pub const STATUS: u32 = 8;
    pub const WINDOW_END_OFFSET: u32 = 9;
    pub const TYPE: u32 = 10;
    pub const RESOURCE_ID: u32 = 11;
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_GROUP_START: u8 = 3;
const WIRE_GROUP_END: u8 = 4;
const WIRE_FIXED32: u8 = 5;

/// Longest possible varint encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Largest `data` payload a chunk may carry, regardless of what a peer
/// advertises. Bounds the frame size accepted from the network.
pub const MAX_DATA_LEN: u32 = 1 << 20;

// ── Chunk type ────────────────────────────────────────────────────────────────

/// What a chunk asks of its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkType {
    /// Payload bytes, a final marker, or (when empty) a parameter nudge.
    Data = 0,
    /// Opens a transfer.
    Start = 1,
    /// Receiver asks the transmitter to rewind to `offset`.
    ParametersRetransmit = 2,
    /// Receiver extends the window without rewinding.
    ParametersContinue = 3,
}

impl TryFrom<u64> for ChunkType {
    type Error = u64;

    fn try_from(v: u64) -> Result<Self, u64> {
        match v {
            0 => Ok(ChunkType::Data),
            1 => Ok(ChunkType::Start),
            2 => Ok(ChunkType::ParametersRetransmit),
            3 => Ok(ChunkType::ParametersContinue),
            other => Err(other),
        }
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Terminal status carried by the last chunk a peer sends for a transfer.
///
/// Values follow the canonical RPC status codes. Codes this crate does not
/// name are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const OK: Status = Status(0);
    pub const CANCELLED: Status = Status(1);
    pub const UNKNOWN: Status = Status(2);
    pub const INVALID_ARGUMENT: Status = Status(3);
    pub const DEADLINE_EXCEEDED: Status = Status(4);
    pub const NOT_FOUND: Status = Status(5);
    pub const ALREADY_EXISTS: Status = Status(6);
    pub const PERMISSION_DENIED: Status = Status(7);
    pub const RESOURCE_EXHAUSTED: Status = Status(8);
    pub const FAILED_PRECONDITION: Status = Status(9);
    pub const ABORTED: Status = Status(10);
    pub const OUT_OF_RANGE: Status = Status(11);
    pub const UNIMPLEMENTED: Status = Status(12);
    pub const INTERNAL: Status = Status(13);
    pub const UNAVAILABLE: Status = Status(14);
    pub const DATA_LOSS: Status = Status(15);
    pub const UNAUTHENTICATED: Status = Status(16);

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    /// Canonical name, if this is a known code.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "OK",
            1 => "CANCELLED",
            2 => "UNKNOWN",
            3 => "INVALID_ARGUMENT",
            4 => "DEADLINE_EXCEEDED",
            5 => "NOT_FOUND",
            6 => "ALREADY_EXISTS",
            7 => "PERMISSION_DENIED",
            8 => "RESOURCE_EXHAUSTED",
            9 => "FAILED_PRECONDITION",
            10 => "ABORTED",
            11 => "OUT_OF_RANGE",
            12 => "UNIMPLEMENTED",
            13 => "INTERNAL",
            14 => "UNAVAILABLE",
            15 => "DATA_LOSS",
            16 => "UNAUTHENTICATED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "status {}", self.0),
        }
    }
}

// ── Method ────────────────────────────────────────────────────────────────────

/// The stream a chunk travels on. The client of a `Read` stream receives
/// bytes; the client of a `Write` stream sends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Read = 1,
    Write = 2,
}

impl TryFrom<u8> for Method {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(Method::Read),
            2 => Ok(Method::Write),
            other => Err(other),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Read => f.write_str("read"),
            Method::Write => f.write_str("write"),
        }
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// The wire unit of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Multiplexing key within one stream.
    pub transfer_id: u32,
    /// Receiver-advertised credit beyond `offset`.
    pub pending_bytes: Option<u32>,
    /// Receiver-advertised cap on `data.len()`.
    pub max_chunk_size_bytes: Option<u32>,
    /// Receiver pacing hint between successive data chunks.
    pub min_delay_microseconds: Option<u32>,
    /// Byte offset of `data` within the resource.
    pub offset: u64,
    pub data: Bytes,
    /// Bytes left after this chunk. `None` means the length is unknown;
    /// `Some(0)` marks the transmitter's final chunk.
    pub remaining_bytes: Option<u64>,
    /// Terminal status. Present only on the last chunk a peer sends.
    pub status: Option<Status>,
    /// Exclusive upper bound of the byte range the transmitter may send.
    /// Zero means the sender did not advertise one.
    pub window_end_offset: u64,
    /// `None` when absent on the wire or when the peer sent a type this
    /// codec does not know. Absent is read as [`ChunkType::Data`].
    pub chunk_type: Option<ChunkType>,
    /// Names the resource on the responding peer. Carried by `START` and
    /// resume chunks; when absent the responder resolves by `transfer_id`.
    pub resource_id: Option<u32>,
}

impl Chunk {
    /// The chunk's type, reading an absent type as `Data`.
    pub fn kind(&self) -> ChunkType {
        self.chunk_type.unwrap_or(ChunkType::Data)
    }

    /// True for the transmitter's last data chunk.
    pub fn is_final(&self) -> bool {
        self.remaining_bytes == Some(0)
    }

    /// An empty data chunk with no status and no length information. Asks
    /// the receiver to re-advertise its transfer parameters.
    pub fn is_nudge(&self) -> bool {
        self.kind() == ChunkType::Data
            && self.data.is_empty()
            && self.status.is_none()
            && self.remaining_bytes.is_none()
    }

    /// Offset one past the last byte carried.
    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.data.len() as u64)
    }

    /// Window end implied by this chunk. Falls back to
    /// `offset + pending_bytes` for peers that do not send
    /// `window_end_offset`.
    pub fn effective_window_end(&self) -> u64 {
        if self.window_end_offset != 0 {
            self.window_end_offset
        } else {
            self.offset
                .saturating_add(u64::from(self.pending_bytes.unwrap_or(0)))
        }
    }

    /// Check the structural invariants a well-behaved peer upholds.
    ///
    /// Status chunks are exempt: a peer aborting a transfer may not know
    /// its window.
    pub fn validate(&self, max_chunk_size: Option<u32>) -> Result<(), ChunkViolation> {
        if self.status.is_some() {
            return Ok(());
        }
        if self.window_end_offset != 0 && self.window_end_offset < self.offset {
            return Err(ChunkViolation::WindowBeforeOffset {
                offset: self.offset,
                window_end_offset: self.window_end_offset,
            });
        }
        let len = self.data.len();
        let max = max_chunk_size.unwrap_or(MAX_DATA_LEN).min(MAX_DATA_LEN);
        if len > max as usize {
            return Err(ChunkViolation::DataTooLarge { len, max });
        }
        // Every range the chunk describes must end inside u64.
        let overflow = |extent: u64| ChunkViolation::RangeOverflow {
            offset: self.offset,
            extent,
        };
        let end = self.offset.checked_add(len as u64).ok_or(overflow(len as u64))?;
        if self.window_end_offset == 0 {
            if let Some(pending) = self.pending_bytes {
                self.offset
                    .checked_add(u64::from(pending))
                    .ok_or(overflow(u64::from(pending)))?;
            }
        }
        if let Some(remaining) = self.remaining_bytes {
            end.checked_add(remaining).ok_or(overflow(remaining))?;
        }
        Ok(())
    }

    // ── Encoding ──────────────────────────────────────────────────────────────

    /// Serialize to the protobuf encoding. Never fails.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_raw(&mut buf);
        buf.freeze()
    }

    /// Serialize with a varint length prefix (protobuf delimited form).
    pub fn encode_length_delimited(&self, buf: &mut BytesMut) {
        let len = self.encoded_len();
        buf.reserve(varint_len(len as u64) + len);
        encode_varint(len as u64, buf);
        self.encode_raw(buf);
    }

    /// Exact size of [`Chunk::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.transfer_id != 0 {
            len += uint_field_len(self.transfer_id.into());
        }
        if let Some(v) = self.pending_bytes {
            len += uint_field_len(v.into());
        }
        if let Some(v) = self.max_chunk_size_bytes {
            len += uint_field_len(v.into());
        }
        if let Some(v) = self.min_delay_microseconds {
            len += uint_field_len(v.into());
        }
        if self.offset != 0 {
            len += uint_field_len(self.offset);
        }
        if !self.data.is_empty() {
            len += 1 + varint_len(self.data.len() as u64) + self.data.len();
        }
        if let Some(v) = self.remaining_bytes {
            len += uint_field_len(v);
        }
        if let Some(v) = self.status {
            len += uint_field_len(v.0.into());
        }
        if self.window_end_offset != 0 {
            len += uint_field_len(self.window_end_offset);
        }
        if let Some(t) = self.chunk_type {
            len += uint_field_len(t as u64);
        }
        if let Some(v) = self.resource_id {
            len += uint_field_len(v.into());
        }
        len
    }

    fn encode_raw(&self, buf: &mut impl BufMut) {
        if self.transfer_id != 0 {
            put_uint(buf, field::TRANSFER_ID, self.transfer_id.into());
        }
        if let Some(v) = self.pending_bytes {
            put_uint(buf, field::PENDING_BYTES, v.into());
        }
        if let Some(v) = self.max_chunk_size_bytes {
            put_uint(buf, field::MAX_CHUNK_SIZE_BYTES, v.into());
        }
        if let Some(v) = self.min_delay_microseconds {
            put_uint(buf, field::MIN_DELAY_MICROSECONDS, v.into());
        }
        if self.offset != 0 {
            put_uint(buf, field::OFFSET, self.offset);
        }
        if !self.data.is_empty() {
            put_key(buf, field::DATA, WIRE_LEN);
            encode_varint(self.data.len() as u64, buf);
            buf.put_slice(&self.data);
        }
        if let Some(v) = self.remaining_bytes {
            put_uint(buf, field::REMAINING_BYTES, v);
        }
        if let Some(v) = self.status {
            put_uint(buf, field::STATUS, v.0.into());
        }
        if self.window_end_offset != 0 {
            put_uint(buf, field::WINDOW_END_OFFSET, self.window_end_offset);
        }
        if let Some(t) = self.chunk_type {
            put_uint(buf, field::TYPE, t as u64);
        }
        if let Some(v) = self.resource_id {
            put_uint(buf, field::RESOURCE_ID, v.into());
        }
    }

    // ── Decoding ──────────────────────────────────────────────────────────────

    /// Parse one chunk occupying all of `buf`. `data` is a zero-copy slice
    /// of the input.
    pub fn decode(buf: Bytes) -> Result<Chunk, DecodeError> {
        let mut reader = Reader {
            buf,
            transfer_id: None,
        };
        let mut chunk = Chunk::default();
        let mut unknown_type = None;

        while reader.buf.has_remaining() {
            let key = reader.varint()?;
            let number = key >> 3;
            let wire_type = (key & 0x07) as u8;
            if number == 0 || number > u64::from(u32::MAX >> 3) {
                return Err(reader.malformed(format!("invalid field number {number}")));
            }
            let number = number as u32;

            match (number, wire_type) {
                (field::TRANSFER_ID, WIRE_VARINT) => {
                    let id = reader.uint32(number)?;
                    chunk.transfer_id = id;
                    reader.transfer_id = Some(id);
                }
                (field::PENDING_BYTES, WIRE_VARINT) => {
                    chunk.pending_bytes = Some(reader.uint32(number)?);
                }
                (field::MAX_CHUNK_SIZE_BYTES, WIRE_VARINT) => {
                    chunk.max_chunk_size_bytes = Some(reader.uint32(number)?);
                }
                (field::MIN_DELAY_MICROSECONDS, WIRE_VARINT) => {
                    chunk.min_delay_microseconds = Some(reader.uint32(number)?);
                }
                (field::OFFSET, WIRE_VARINT) => chunk.offset = reader.varint()?,
                (field::DATA, WIRE_LEN) => chunk.data = reader.length_delimited()?,
                (field::REMAINING_BYTES, WIRE_VARINT) => {
                    chunk.remaining_bytes = Some(reader.varint()?);
                }
                (field::STATUS, WIRE_VARINT) => {
                    chunk.status = Some(Status(reader.uint32(number)?));
                }
                (field::WINDOW_END_OFFSET, WIRE_VARINT) => {
                    chunk.window_end_offset = reader.varint()?;
                }
                (field::TYPE, WIRE_VARINT) => {
                    let value = reader.varint()?;
                    match ChunkType::try_from(value) {
                        Ok(t) => {
                            chunk.chunk_type = Some(t);
                            unknown_type = None;
                        }
                        Err(v) => {
                            chunk.chunk_type = None;
                            unknown_type = Some(v);
                        }
                    }
                }
                (field::RESOURCE_ID, WIRE_VARINT) => {
                    chunk.resource_id = Some(reader.uint32(number)?);
                }
                (field::TRANSFER_ID..=field::RESOURCE_ID, _) => {
                    return Err(reader.malformed(format!(
                        "field {number} has wire type {wire_type}"
                    )));
                }
                _ => reader.skip(number, wire_type)?,
            }
        }

        match unknown_type {
            Some(value) => Err(DecodeError::UnknownType {
                value,
                chunk: Box::new(chunk),
            }),
            None => Ok(chunk),
        }
    }

    /// Parse one length-prefixed chunk from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when `buf` does not yet
    /// hold a complete message.
    pub fn decode_length_delimited(buf: &mut Bytes) -> Result<Option<Chunk>, DecodeError> {
        let mut peek = &buf[..];
        let len = match decode_varint(&mut peek) {
            Ok(len) => len,
            Err(VarintError::Truncated) => return Ok(None),
            Err(VarintError::Overflow) => {
                return Err(DecodeError::Malformed {
                    transfer_id: None,
                    reason: "length prefix overflows u64".into(),
                })
            }
        };
        let prefix = buf.len() - peek.len();
        if (peek.len() as u64) < len {
            return Ok(None);
        }
        buf.advance(prefix);
        let message = buf.split_to(len as usize);
        Chunk::decode(message).map(Some)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are not a valid chunk. `transfer_id` is set when it was
    /// decoded before the failure, so the owning transfer can be failed.
    #[error("malformed chunk: {reason}")]
    Malformed {
        transfer_id: Option<u32>,
        reason: String,
    },
    /// Well-formed, but with a `type` this codec does not know. The decoded
    /// chunk has `chunk_type = None`.
    #[error("unknown chunk type {value}")]
    UnknownType { value: u64, chunk: Box<Chunk> },
}

impl DecodeError {
    pub fn transfer_id(&self) -> Option<u32> {
        match self {
            DecodeError::Malformed { transfer_id, .. } => *transfer_id,
            DecodeError::UnknownType { chunk, .. } => Some(chunk.transfer_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkViolation {
    #[error("window end {window_end_offset} precedes offset {offset}")]
    WindowBeforeOffset { offset: u64, window_end_offset: u64 },
    #[error("chunk carries {len} bytes, limit is {max}")]
    DataTooLarge { len: usize, max: u32 },
    #[error("range of {extent} bytes at offset {offset} overflows u64")]
    RangeOverflow { offset: u64, extent: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarintError {
    #[error("varint truncated")]
    Truncated,
    #[error("varint overflows u64")]
    Overflow,
}

// ── Varints ───────────────────────────────────────────────────────────────────

pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn decode_varint(buf: &mut impl Buf) -> Result<u64, VarintError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(VarintError::Truncated);
        }
        let byte = buf.get_u8();
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(VarintError::Overflow);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(VarintError::Overflow)
}

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

fn put_key(buf: &mut impl BufMut, number: u32, wire_type: u8) {
    encode_varint((u64::from(number) << 3) | u64::from(wire_type), buf);
}

fn put_uint(buf: &mut impl BufMut, number: u32, value: u64) {
    put_key(buf, number, WIRE_VARINT);
    encode_varint(value, buf);
}

// Every field number in use fits a one-byte key.
fn uint_field_len(value: u64) -> usize {
    1 + varint_len(value)
}

struct Reader {
    buf: Bytes,
    transfer_id: Option<u32>,
}

impl Reader {
    fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Malformed {
            transfer_id: self.transfer_id,
            reason: reason.into(),
        }
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        decode_varint(&mut self.buf).map_err(|e| self.malformed(e.to_string()))
    }

    fn uint32(&mut self, number: u32) -> Result<u32, DecodeError> {
        let value = self.varint()?;
        u32::try_from(value)
            .map_err(|_| self.malformed(format!("field {number} value {value} overflows u32")))
    }

    fn length_delimited(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.varint()?;
        if len > self.buf.remaining() as u64 {
            return Err(self.malformed(format!(
                "length {len} runs past the end of the buffer"
            )));
        }
        Ok(self.buf.split_to(len as usize))
    }

    fn advance(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(self.malformed("fixed-width field truncated"));
        }
        self.buf.advance(n);
        Ok(())
    }

    fn skip(&mut self, number: u32, wire_type: u8) -> Result<(), DecodeError> {
        match wire_type {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.advance(8),
            WIRE_LEN => self.length_delimited().map(|_| ()),
            WIRE_FIXED32 => self.advance(4),
            WIRE_GROUP_START | WIRE_GROUP_END => {
                Err(self.malformed(format!("field {number} uses deprecated group encoding")))
            }
            other => Err(self.malformed(format!("field {number} has invalid wire type {other}"))),
        }
    }
}
