//! Remote-console packet framing.
//!
//! Every packet is `size | id | type | body | 0x00 0x00` with little-endian
//! `i32` header fields, where `size` counts everything after itself.

use thiserror::Error;

pub const SERVERDATA_AUTH: i32 = 3;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// Id the server answers with when authentication is refused.
pub const AUTH_FAILED_ID: i32 = -1;

const HEADER_LEN: usize = 4;
const MIN_PAYLOAD_LEN: usize = 10;
/// Upper bound on a single packet; replies larger than this are split by the
/// server, so anything bigger indicates a corrupt stream.
pub const MAX_PACKET_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    pub fn auth(id: i32, password: &str) -> Self {
        Self::new(id, SERVERDATA_AUTH, password)
    }

    pub fn exec(id: i32, command: &str) -> Self {
        Self::new(id, SERVERDATA_EXECCOMMAND, command)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_packet(self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RconError {
    #[error("packet declares invalid size {0}")]
    InvalidSize(i32),
    #[error("packet body is not valid utf-8")]
    InvalidBody,
    #[error("packet is missing its terminator")]
    MissingTerminator,
}

pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let body = packet.body.as_bytes();
    let size = (body.len() + MIN_PAYLOAD_LEN) as i32;
    let mut frame = Vec::with_capacity(HEADER_LEN + size as usize);
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&packet.id.to_le_bytes());
    frame.extend_from_slice(&packet.kind.to_le_bytes());
    frame.extend_from_slice(body);
    frame.extend_from_slice(&[0, 0]);
    frame
}

/// Decode the first packet in `buf`. Returns `Ok(None)` while the buffer holds
/// only part of a packet, otherwise the packet and the number of bytes consumed.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>, RconError> {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let size = read_i32(header);
    if size < MIN_PAYLOAD_LEN as i32 || size as usize > MAX_PACKET_LEN {
        return Err(RconError::InvalidSize(size));
    }
    let total = HEADER_LEN + size as usize;
    let Some(frame) = buf.get(..total) else {
        return Ok(None);
    };

    let id = read_i32(&frame[4..8]);
    let kind = read_i32(&frame[8..12]);
    let body_end = total - 2;
    if frame[body_end..] != [0, 0] {
        return Err(RconError::MissingTerminator);
    }
    let body = std::str::from_utf8(&frame[12..body_end]).map_err(|_| RconError::InvalidBody)?;
    Ok(Some((Packet::new(id, kind, body), total)))
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_le_bytes(raw)
}
