//! Library root for zit-rs.
//!
//! Re-exports the peer/piece engine: bencode codec, hashing, bitfields,
//! piece bookkeeping, the wire protocol, peer sessions, the acceptor, the
//! tracker client, the torrent session, the file writer, and the network
//! runtime abstraction, for use by the binary and by tests.
pub mod acceptor;
pub mod bencode;
pub mod bitfield;
pub mod cli;
pub mod config;
pub mod file_writer;
pub mod hash;
pub mod peer;
pub mod piece;
pub mod runtime;
pub mod torrent;
pub mod tracker;
pub mod wire;
