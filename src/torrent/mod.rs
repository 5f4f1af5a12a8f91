//! Torrent metadata, on-disk state, and the torrent session state machine.
//!
//! Submodules: `file` (bencode -> `TorrentFile`/`InfoDict`), `info_hash`
//! (the canonical re-encode-and-hash), and `session` (the mutable
//! `Torrent`: peer bootstrap, run loop, retry cadence, completion).
use thiserror::Error;

pub mod file;
pub mod info_hash;
pub mod session;

pub use file::{FileDict, InfoDict, TorrentFile};
pub use session::{Torrent, TrackerEvent};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("torrent declares both 'length' and 'files' (dual mode)")]
    DualMode,

    #[error("torrent declares neither 'length' nor 'files'")]
    NoMode,

    #[error("date parse error")]
    DateParseError,
}
