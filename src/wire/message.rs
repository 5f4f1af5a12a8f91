//! The length-prefixed message frame that follows the handshake.
//!
//! Grounded on the id table in `examples/original_source/src/messages.h`
//! and the enum/serialization shape of
//! `jsondevers-bobby-bit/src/peer/message.rs`, the closest pack
//! implementation of the same wire ids. The parser is a pure function
//! `(buffer) -> (consumed, message)`: it never owns or blocks on a
//! socket, so callers can feed it partial reads and retry.
use crate::hash::{pack_u32, unpack_u32};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer does not yet contain a full frame")]
    Incomplete,

    #[error("not the BitTorrent protocol")]
    InvalidProtocol,

    #[error("handshake info hash does not match this torrent")]
    InfoHashMismatch,

    #[error("declared frame length {0} is implausibly large")]
    LengthImplausible(u32),

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}

/// The largest plausible payload: one PIECE message carrying a full
/// 16 KiB block plus its 8-byte index/begin header, with slack for
/// oversized blocks some peers send.
const MAX_PLAUSIBLE_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    /// An id the parser doesn't recognize; the frame was still consumed
    /// correctly (`4 + length` bytes) so the stream stays in sync — see
    /// spec §9's open question about not discarding the whole buffer.
    Unknown(u8),
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port(_) => Some(9),
            Message::Unknown(id) => Some(*id),
        }
    }

    /// Serializes this message into its length-prefixed wire form.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => pack_u32(0).to_vec(),
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                let mut buf = pack_u32(1).to_vec();
                buf.push(self.id().expect("fixed ids above always have an id"));
                buf
            }
            Message::Have(index) => {
                let mut buf = pack_u32(5).to_vec();
                buf.push(4);
                buf.extend_from_slice(&pack_u32(*index));
                buf
            }
            Message::Bitfield(bits) => {
                let mut buf = pack_u32(1 + bits.len() as u32).to_vec();
                buf.push(5);
                buf.extend_from_slice(bits);
                buf
            }
            Message::Request { index, begin, length } => {
                let mut buf = pack_u32(13).to_vec();
                buf.push(6);
                buf.extend_from_slice(&pack_u32(*index));
                buf.extend_from_slice(&pack_u32(*begin));
                buf.extend_from_slice(&pack_u32(*length));
                buf
            }
            Message::Piece { index, begin, block } => {
                let mut buf = pack_u32(9 + block.len() as u32).to_vec();
                buf.push(7);
                buf.extend_from_slice(&pack_u32(*index));
                buf.extend_from_slice(&pack_u32(*begin));
                buf.extend_from_slice(block);
                buf
            }
            Message::Cancel { index, begin, length } => {
                let mut buf = pack_u32(13).to_vec();
                buf.push(8);
                buf.extend_from_slice(&pack_u32(*index));
                buf.extend_from_slice(&pack_u32(*begin));
                buf.extend_from_slice(&pack_u32(*length));
                buf
            }
            Message::Port(port) => {
                let mut buf = pack_u32(3).to_vec();
                buf.push(9);
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Message::Unknown(id) => {
                // We never originate Unknown frames; this only exists so
                // a parsed Unknown can round-trip in tests.
                let mut buf = pack_u32(1).to_vec();
                buf.push(*id);
                buf
            }
        }
    }

    /// Parses one frame from the front of `buf`.
    ///
    /// Returns `(0, None)` when `buf` does not yet contain a full frame —
    /// the caller must retain `buf` and retry once more bytes arrive.
    /// Otherwise returns the number of bytes consumed and the parsed
    /// message (`None` only for the zero-length keep-alive, which still
    /// consumes its 4-byte prefix as the "message").
    pub fn parse(buf: &[u8]) -> Result<(usize, Message), WireError> {
        if buf.len() < 4 {
            return Err(WireError::Incomplete);
        }
        let len = unpack_u32(buf, 0).expect("bounds checked above") as usize;
        if len == 0 {
            return Ok((4, Message::KeepAlive));
        }
        if len as u32 > MAX_PLAUSIBLE_LEN {
            return Err(WireError::LengthImplausible(len as u32));
        }
        if buf.len() < 4 + len {
            return Err(WireError::Incomplete);
        }
        let frame = &buf[4..4 + len];
        let id = frame[0];
        let payload = &frame[1..];
        let consumed = 4 + len;

        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    return Err(WireError::MalformedPayload("have"));
                }
                Message::Have(unpack_u32(payload, 0).unwrap())
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                if payload.len() != 12 {
                    return Err(WireError::MalformedPayload("request"));
                }
                Message::Request {
                    index: unpack_u32(payload, 0).unwrap(),
                    begin: unpack_u32(payload, 4).unwrap(),
                    length: unpack_u32(payload, 8).unwrap(),
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(WireError::MalformedPayload("piece"));
                }
                Message::Piece {
                    index: unpack_u32(payload, 0).unwrap(),
                    begin: unpack_u32(payload, 4).unwrap(),
                    block: payload[8..].to_vec(),
                }
            }
            8 => {
                if payload.len() != 12 {
                    return Err(WireError::MalformedPayload("cancel"));
                }
                Message::Cancel {
                    index: unpack_u32(payload, 0).unwrap(),
                    begin: unpack_u32(payload, 4).unwrap(),
                    length: unpack_u32(payload, 8).unwrap(),
                }
            }
            9 => {
                if payload.len() != 2 {
                    return Err(WireError::MalformedPayload("port"));
                }
                let mut p = [0u8; 2];
                p.copy_from_slice(payload);
                Message::Port(u16::from_be_bytes(p))
            }
            other => {
                tracing::warn!(id = other, "unknown wire message id");
                Message::Unknown(other)
            }
        };
        Ok((consumed, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.serialize();
        let (consumed, parsed) = Message::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn round_trips_fixed_messages() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0xFF, 0x00]));
        round_trip(Message::Request { index: 1, begin: 2, length: 3 });
        round_trip(Message::Piece { index: 1, begin: 0, block: vec![9; 16] });
        round_trip(Message::Cancel { index: 1, begin: 2, length: 3 });
        round_trip(Message::Port(6881));
    }

    #[test]
    fn reports_incomplete_on_partial_length_prefix() {
        assert_eq!(Message::parse(&[0, 0]), Err(WireError::Incomplete));
    }

    #[test]
    fn reports_incomplete_on_partial_frame_body() {
        let full = Message::Have(7).serialize();
        assert_eq!(Message::parse(&full[..full.len() - 1]), Err(WireError::Incomplete));
    }

    #[test]
    fn unknown_id_consumes_exactly_its_frame_and_continues() {
        let mut buf = pack_u32(2).to_vec();
        buf.push(200); // unknown id
        buf.push(0xAA);
        buf.extend_from_slice(&Message::Unchoke.serialize());
        let (consumed, msg) = Message::parse(&buf).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(msg, Message::Unknown(200));
        let (consumed2, msg2) = Message::parse(&buf[consumed..]).unwrap();
        assert_eq!(consumed2, 5);
        assert_eq!(msg2, Message::Unchoke);
    }

    #[test]
    fn rejects_implausibly_large_length() {
        let buf = pack_u32(MAX_PLAUSIBLE_LEN + 1).to_vec();
        assert!(matches!(
            Message::parse(&buf),
            Err(WireError::LengthImplausible(_))
        ));
    }
}
