//! NMP (newtmgr protocol) header and message codec
//!
//! Every management request and response starts with an 8-byte header:
//!
//! ```text
//! +--------+--------+-----------------+-----------------+--------+--------+
//! | op (1) | flags  | length (2, BE)  | group (2, BE)   | seq    | id     |
//! +--------+--------+-----------------+-----------------+--------+--------+
//! ```
//!
//! The length field counts only the body bytes that follow the header. The
//! body itself is opaque at this layer.

use crate::error::{NmxError, NmxResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU8, Ordering};

/// NMP header length
pub const NMP_HDR_SIZE: usize = 8;

/// NMP operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmpOp {
    Read = 0,
    ReadRsp = 1,
    Write = 2,
    WriteRsp = 3,
}

impl NmpOp {
    pub fn from_u8(value: u8) -> NmxResult<Self> {
        match value {
            0 => Ok(NmpOp::Read),
            1 => Ok(NmpOp::ReadRsp),
            2 => Ok(NmpOp::Write),
            3 => Ok(NmpOp::WriteRsp),
            other => Err(NmxError::InvalidData(format!(
                "Invalid NMP op code: {}",
                other
            ))),
        }
    }

    /// Check if this op code marks a response
    pub fn is_response(&self) -> bool {
        matches!(self, NmpOp::ReadRsp | NmpOp::WriteRsp)
    }

    /// The response op code matching this request op code
    pub fn response(&self) -> NmpOp {
        match self {
            NmpOp::Read | NmpOp::ReadRsp => NmpOp::ReadRsp,
            NmpOp::Write | NmpOp::WriteRsp => NmpOp::WriteRsp,
        }
    }
}

/// NMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmpHeader {
    pub op: NmpOp,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl NmpHeader {
    /// Create a new header; `len` is filled in when the message is encoded
    pub fn new(op: NmpOp, group: u16, id: u8, seq: u8) -> Self {
        Self {
            op,
            flags: 0,
            len: 0,
            group,
            seq,
            id,
        }
    }

    /// Encode header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op as u8);
        buf.put_u8(self.flags);
        buf.put_u16(self.len);
        buf.put_u16(self.group);
        buf.put_u8(self.seq);
        buf.put_u8(self.id);
    }

    /// Decode header from bytes
    pub fn decode(data: &[u8]) -> NmxResult<Self> {
        if data.len() < NMP_HDR_SIZE {
            return Err(NmxError::InvalidData(format!(
                "NMP header too short: expected {}, got {}",
                NMP_HDR_SIZE,
                data.len()
            )));
        }

        Ok(Self {
            op: NmpOp::from_u8(data[0])?,
            flags: data[1],
            len: u16::from_be_bytes([data[2], data[3]]),
            group: u16::from_be_bytes([data[4], data[5]]),
            seq: data[6],
            id: data[7],
        })
    }

    /// Total encoded size of the message this header describes
    pub fn frame_len(&self) -> usize {
        NMP_HDR_SIZE + self.len as usize
    }
}

/// NMP message: header plus opaque body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmpMessage {
    pub hdr: NmpHeader,
    pub body: Bytes,
}

impl NmpMessage {
    /// Create a new message
    ///
    /// `hdr.len` saturates at `u16::MAX` for a body the header cannot
    /// describe; [`encode`](NmpMessage::encode) refuses such a message.
    pub fn new(hdr: NmpHeader, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut hdr = hdr;
        hdr.len = u16::try_from(body.len()).unwrap_or(u16::MAX);
        Self { hdr, body }
    }

    /// Build the response to this request carrying `body`
    pub fn response(&self, body: impl Into<Bytes>) -> Self {
        let hdr = NmpHeader::new(self.hdr.op.response(), self.hdr.group, self.hdr.id, self.hdr.seq);
        Self::new(hdr, body)
    }

    /// Sequence number used to correlate the response
    pub fn seq(&self) -> u8 {
        self.hdr.seq
    }

    /// Encode header and body
    pub fn encode(&self) -> NmxResult<Bytes> {
        if self.body.len() > u16::MAX as usize {
            return Err(NmxError::EncodingTooLarge {
                size: self.body.len(),
                mtu: u16::MAX as usize,
            });
        }

        let mut hdr = self.hdr;
        hdr.len = self.body.len() as u16;

        let mut buf = BytesMut::with_capacity(NMP_HDR_SIZE + self.body.len());
        hdr.encode(&mut buf);
        buf.extend_from_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode a complete message; trailing bytes are an error
    pub fn decode(data: &[u8]) -> NmxResult<Self> {
        let hdr = NmpHeader::decode(data)?;
        if data.len() != hdr.frame_len() {
            return Err(NmxError::InvalidData(format!(
                "NMP length mismatch: header says {} body bytes, got {}",
                hdr.len,
                data.len() - NMP_HDR_SIZE
            )));
        }

        Ok(Self {
            hdr,
            body: Bytes::copy_from_slice(&data[NMP_HDR_SIZE..]),
        })
    }
}

/// Wrapping sequence number source
///
/// Starts at a random value so that two tools talking to the same device do
/// not collide on their first requests.
#[derive(Debug)]
pub struct SeqGenerator {
    next: AtomicU8,
}

impl SeqGenerator {
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(seq: u8) -> Self {
        Self {
            next: AtomicU8::new(seq),
        }
    }

    /// Take the next sequence number
    pub fn next_seq(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SeqGenerator {
    fn default() -> Self {
        Self::new()
    }
}
