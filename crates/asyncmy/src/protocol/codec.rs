//! Frame codec: length-prefixed, sequence-numbered frames to logical packets.
//!
//! A logical packet of `n` bytes travels as `n / MAX_PACKET_SIZE + 1`
//! frames. Every frame but the last carries exactly `MAX_PACKET_SIZE`
//! bytes, so a payload that is an exact multiple of the limit ends with an
//! empty frame. Sequence numbers increase by one per frame and wrap at 255.

use asyncmy_core::error::ProtocolError;
use asyncmy_core::{Error, Result};

use super::reader::PacketReader;
use super::{EofPacket, ErrPacket, MAX_PACKET_SIZE, OkPacket, PacketHeader};

/// One reassembled logical packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number of the first frame
    pub seq: u8,
    /// Sequence number the next packet must carry
    pub next_seq: u8,
    pub payload: Vec<u8>,
    /// Bytes of the input consumed, headers included
    pub consumed: usize,
}

/// A server packet classified by its leading tag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),
    /// The server asks the client to send a local file (LOAD DATA LOCAL)
    LocalInfile(String),
    /// A result set follows with this many columns
    ResultSetHeader { column_count: u64 },
}

pub(crate) fn protocol_error(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: None,
        source: None,
    })
}

fn malformed(what: &str, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("malformed {} packet", what),
        raw_data: Some(payload.to_vec()),
        source: None,
    })
}

/// Number of frames a payload of `len` bytes occupies.
pub fn frame_count(len: usize) -> usize {
    len / MAX_PACKET_SIZE + 1
}

/// Frame a logical payload starting at sequence number `seq`.
pub fn frame(payload: &[u8], seq: u8) -> Vec<u8> {
    let frames = frame_count(payload.len());
    let mut out = Vec::with_capacity(payload.len() + frames * PacketHeader::SIZE);
    let mut sequence_id = seq;
    for i in 0..frames {
        let start = i * MAX_PACKET_SIZE;
        let end = (start + MAX_PACKET_SIZE).min(payload.len());
        let header = PacketHeader {
            payload_length: (end - start) as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload[start..end]);
        sequence_id = sequence_id.wrapping_add(1);
    }
    out
}

/// Try to reassemble one logical packet from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold the whole packet. A frame
/// whose sequence number differs from the expected one is an error as soon as
/// its header is visible.
pub fn try_unframe(buf: &[u8], expected_seq: u8) -> Result<Option<Frame>> {
    let mut pos = 0;
    let mut seq = expected_seq;
    let mut payload = Vec::new();
    loop {
        let Some(header_bytes) = buf.get(pos..pos + PacketHeader::SIZE) else {
            return Ok(None);
        };
        let header = PacketHeader::from_bytes([
            header_bytes[0],
            header_bytes[1],
            header_bytes[2],
            header_bytes[3],
        ]);
        if header.sequence_id != seq {
            return Err(protocol_error(format!(
                "packet sequence mismatch: expected {}, got {}",
                seq, header.sequence_id
            )));
        }
        let len = header.payload_length as usize;
        let body_start = pos + PacketHeader::SIZE;
        let Some(body) = buf.get(body_start..body_start + len) else {
            return Ok(None);
        };
        payload.extend_from_slice(body);
        pos = body_start + len;
        seq = seq.wrapping_add(1);
        if len < MAX_PACKET_SIZE {
            return Ok(Some(Frame {
                seq: expected_seq,
                next_seq: seq,
                payload,
                consumed: pos,
            }));
        }
    }
}

/// Reassemble one logical packet from a complete byte stream.
///
/// Unlike [`try_unframe`], running out of input is a truncation error.
pub fn unframe(stream: &[u8], expected_seq: u8) -> Result<Frame> {
    try_unframe(stream, expected_seq)?.ok_or_else(|| {
        Error::Protocol(ProtocolError {
            message: format!(
                "truncated packet stream ({} bytes available)",
                stream.len()
            ),
            raw_data: Some(stream.to_vec()),
            source: None,
        })
    })
}

/// Classify the first packet of a command response.
pub fn decode_packet(payload: &[u8]) -> Result<Packet> {
    let Some(&tag) = payload.first() else {
        return Err(protocol_error("empty response packet"));
    };
    let mut reader = PacketReader::new(payload);
    match tag {
        0x00 => reader
            .parse_ok_packet()
            .map(Packet::Ok)
            .ok_or_else(|| malformed("OK", payload)),
        0xFF => reader
            .parse_err_packet()
            .map(Packet::Err)
            .ok_or_else(|| malformed("ERR", payload)),
        0xFE if payload.len() < 9 => reader
            .parse_eof_packet()
            .map(Packet::Eof)
            .ok_or_else(|| malformed("EOF", payload)),
        0xFB => {
            reader.skip(1);
            Ok(Packet::LocalInfile(reader.read_rest_string()))
        }
        _ => {
            let column_count = reader
                .read_lenenc_int()
                .ok_or_else(|| malformed("result set header", payload))?;
            if column_count == 0 || !reader.is_empty() {
                return Err(malformed("result set header", payload));
            }
            Ok(Packet::ResultSetHeader { column_count })
        }
    }
}

/// Does this packet end a run of rows (or of column definitions)?
///
/// With CLIENT_DEPRECATE_EOF the terminator is an OK packet with a 0xFE tag,
/// which can only be told apart from a row by being shorter than a full
/// frame. Without it the classic EOF packet is at most 5 bytes.
pub fn is_row_terminator(payload: &[u8], deprecate_eof: bool) -> bool {
    match payload.first() {
        Some(0xFE) if deprecate_eof => payload.len() < MAX_PACKET_SIZE,
        Some(0xFE) => payload.len() < 9,
        _ => false,
    }
}

/// Parse a row terminator into the OK metadata it carries.
pub fn decode_row_terminator(payload: &[u8], deprecate_eof: bool) -> Result<OkPacket> {
    let mut reader = PacketReader::new(payload);
    if deprecate_eof {
        reader
            .parse_ok_packet()
            .ok_or_else(|| malformed("result set OK", payload))
    } else {
        reader
            .parse_eof_packet()
            .map(OkPacket::from)
            .ok_or_else(|| malformed("EOF", payload))
    }
}
