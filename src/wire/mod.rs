//! The BitTorrent peer wire protocol: handshake plus length-prefixed
//! messages.
pub mod handshake;
pub mod message;

pub use handshake::Handshake;
pub use message::{Message, WireError};
