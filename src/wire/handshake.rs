//! The fixed 68-byte handshake that opens every peer connection.
//!
//! Grounded on the teacher's `peer/handshake.rs` (byte layout, constants)
//! but split into pure `serialize`/`parse` functions per spec §4.5 so the
//! peer session can decide when to read/write rather than the codec
//! owning the socket.
use super::message::WireError;

pub const HANDSHAKE_LEN: usize = 68;
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes to the fixed 68-byte wire form. Reserved bits are always
    /// zero on send, per spec §6.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a handshake from the first 68 bytes of `buf`. Any reserved
    /// byte value is accepted on receive, per spec §6.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(WireError::Incomplete);
        }
        if buf[0] != 19 {
            return Err(WireError::InvalidProtocol);
        }
        if &buf[1..20] != PROTOCOL {
            return Err(WireError::InvalidProtocol);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Drops the connection unless the handshake's info hash matches our
    /// torrent's, per the testable invariant in spec §8.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<(), WireError> {
        if &self.info_hash != expected_info_hash {
            return Err(WireError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_serialize_parse() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(WireError::InvalidProtocol)
        ));
    }

    #[test]
    fn validate_rejects_mismatched_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate(&[9u8; 20]).is_err());
        assert!(hs.validate(&[1u8; 20]).is_ok());
    }

    #[test]
    fn accepts_any_reserved_byte_value_on_receive() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[20] = 0xFF;
        assert!(Handshake::parse(&bytes).is_ok());
    }
}
