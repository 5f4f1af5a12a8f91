//! The mutable torrent session: construction-time on-disk verification,
//! peer bootstrap, the retry-driven run loop, and completion.
//!
//! Grounded on `examples/original_source/src/torrent.cpp` (the
//! construction/verify/start/run/stop sequence and the two retry
//! cadences) translated from its cooperative single-threaded poll loop
//! plus a shared mutex into one task per peer (see `peer::session`) with
//! a torrent-owned mutex guarding only the piece map, `client_pieces`,
//! and peer list — the same "short critical sections" boundary the
//! original draws, per spec §4.9/§5.
use crate::bitfield::Bitfield;
use crate::file_writer;
use crate::hash;
use crate::peer::session::{connect_outbound, PeerHandle};
use crate::piece::Piece;
use crate::runtime::Clock;
use crate::torrent::file::TorrentFile;
use crate::tracker;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

/// How often `retry_pieces` runs, per spec §4.9/§5.
const PIECE_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
/// How many piece-retry ticks make up one peer-retry tick (2 min / 30 s).
const PEER_RETRY_TICKS: u64 = 4;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tracker error: {0}")]
    Tracker(#[from] tracker::TrackerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece error: {0}")]
    Piece(#[from] crate::piece::PieceError),

    #[error("file writer error: {0}")]
    FileWriter(#[from] file_writer::FileWriterError),

    #[error("requested piece {0} is out of range for this torrent")]
    UnknownPiece(u32),

    #[error(
        "final-name file exists on disk but does not match all expected piece hashes"
    )]
    ExistingFileMismatch,
}

/// One of the four announce events from spec §3; `Unspecified` is the
/// periodic refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
    Unspecified,
}

impl TrackerEvent {
    /// The `event` query parameter value, or `None` to omit it — the
    /// periodic refresh carries no `event` key at all, per spec §4.8.
    pub fn query_value(&self) -> Option<&'static str> {
        match self {
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Stopped => Some("stopped"),
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::Unspecified => None,
        }
    }
}

/// Per-torrent config snapshot (spec §3's "per-torrent config snapshot"),
/// populated from the KEY=VALUE config file by the ambient config layer.
#[derive(Debug, Clone, Copy)]
pub struct TorrentConfig {
    pub initiate_peer_connections: bool,
    /// Gates the HAVE-before-BITFIELD fallback documented in spec §9.
    pub assume_have_before_bitfield: bool,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            initiate_peer_connections: true,
            assume_have_before_bitfield: true,
        }
    }
}

/// A running torrent: metadata, disk state, peer list, and the tracker
/// client, per spec §3/§4.9.
pub struct Torrent {
    pub metadata: Arc<TorrentFile>,
    pub local_peer_id: [u8; 20],
    listening_port: u16,
    base_dir: PathBuf,
    client_pieces: Mutex<Bitfield>,
    active_pieces: Mutex<HashMap<u32, Arc<Piece>>>,
    peers: Mutex<Vec<PeerHandle>>,
    stopping: Mutex<bool>,
    pub config: TorrentConfig,
    tracker: tracker::Client,
    file_writer: file_writer::Handle,
    clock: Arc<dyn Clock>,
}

impl Torrent {
    /// Constructs a torrent session and, if any destination bytes already
    /// exist on disk, verifies them (in parallel) before returning, per
    /// spec §4.9's "on-disk verify". Fails if a single-file torrent's
    /// final-name file exists but doesn't match every expected piece
    /// hash.
    pub async fn open(
        metadata: TorrentFile,
        base_dir: PathBuf,
        listening_port: u16,
        config: TorrentConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, SessionError> {
        let metadata = Arc::new(metadata);
        let tracker = tracker::Client::new(listening_port)?;

        let torrent = Arc::new_cyclic(|weak: &Weak<Torrent>| {
            let weak = weak.clone();
            let file_writer = file_writer::spawn(
                metadata.clone(),
                base_dir.clone(),
                Arc::new(move |piece_id| {
                    if let Some(torrent) = weak.upgrade() {
                        torrent.on_piece_written(piece_id);
                    }
                }),
            );
            Torrent {
                local_peer_id: tracker.peer_id(),
                listening_port,
                client_pieces: Mutex::new(Bitfield::with_bit_capacity(metadata.num_pieces())),
                active_pieces: Mutex::new(HashMap::new()),
                peers: Mutex::new(Vec::new()),
                stopping: Mutex::new(false),
                config,
                base_dir,
                tracker,
                file_writer,
                clock,
                metadata: metadata.clone(),
            }
        });

        torrent.verify_existing().await?;
        Ok(torrent)
    }

    pub fn num_pieces(&self) -> usize {
        self.metadata.num_pieces()
    }

    /// Exposes the injected clock to `peer::session`, so each peer's
    /// inactivity timer shares the same clock as the torrent's retry
    /// cadence (real in production, virtual in tests).
    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        self.metadata.piece_size(index as usize).max(0) as u32
    }

    pub fn client_pieces_snapshot(&self) -> Bitfield {
        self.client_pieces.lock().expect("torrent mutex poisoned").clone()
    }

    pub fn done(&self) -> bool {
        self.client_pieces.lock().expect("torrent mutex poisoned").count() >= self.num_pieces()
    }

    /// Gets or creates the active piece tracker for `index`.
    pub fn active_piece(&self, index: u32, piece_size: u32) -> Arc<Piece> {
        self.active_pieces
            .lock()
            .expect("torrent mutex poisoned")
            .entry(index)
            .or_insert_with(|| Arc::new(Piece::new(index, piece_size, self.clock.clone())))
            .clone()
    }

    /// Stores an incoming block and, once its piece is complete, hands it
    /// to the file writer for verification and persistence.
    pub fn set_block(&self, index: u32, begin: u32, data: &[u8]) -> Result<(), SessionError> {
        let piece_size = self.piece_size(index);
        if piece_size == 0 {
            return Err(SessionError::UnknownPiece(index));
        }
        let piece = self.active_piece(index, piece_size);
        let complete = piece.set_block(begin, data)?;
        if complete {
            self.file_writer.enqueue_write(index, piece);
        }
        Ok(())
    }

    /// Reads a block for serving a peer's request: from the in-memory
    /// buffer if still resident, otherwise from disk.
    pub async fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>, SessionError> {
        let piece_size = self.piece_size(index);
        if piece_size == 0 {
            return Err(SessionError::UnknownPiece(index));
        }
        let piece = self.active_piece(index, piece_size);
        if let Some(bytes) = piece.get_block_from_memory(begin, length) {
            return Ok(bytes);
        }
        Ok(self.file_writer.read_block(index, begin, length).await?)
    }

    /// Callback invoked by the file writer once a piece has been
    /// verified and persisted: marks it done and, if that was the last
    /// one, kicks off completion.
    fn on_piece_written(self: &Arc<Self>, piece_id: u32) {
        let now_done = {
            let mut client_pieces = self.client_pieces.lock().expect("torrent mutex poisoned");
            client_pieces.set(piece_id as usize, true);
            client_pieces.count() >= self.num_pieces()
        };
        if now_done {
            self.spawn_completion();
        }
    }

    /// Renames/cleans up the on-disk temp state, clears `am_interested`
    /// on every peer, and sends the `completed` announce, per spec
    /// §4.9's `piece_done`.
    fn spawn_completion(self: &Arc<Self>) {
        let torrent = self.clone();
        tokio::spawn(async move {
            if let Err(e) = file_writer::finalize_completed_torrent(&torrent.metadata, &torrent.base_dir) {
                tracing::error!(error = %e, "failed to finalize completed torrent");
            }
            for peer in torrent.peers.lock().expect("torrent mutex poisoned").iter() {
                peer.clear_interested();
            }
            let total = torrent.metadata.total_length();
            if let Err(e) = torrent
                .tracker
                .announce(&torrent.metadata, TrackerEvent::Completed, 0, total, 0)
                .await
            {
                tracing::warn!(error = %e, "completed announce failed");
            }
            tracing::info!(info_hash = %hash::to_hex_upper(&torrent.metadata.info_hash), "torrent complete");
        });
    }

    /// Sum of the sizes of pieces already marked done, for the tracker's
    /// `downloaded`/`left` fields.
    fn downloaded_bytes(&self) -> i64 {
        let client_pieces = self.client_pieces.lock().expect("torrent mutex poisoned");
        (0..self.num_pieces())
            .filter(|&i| client_pieces.get(i))
            .map(|i| self.metadata.piece_size(i))
            .sum()
    }

    /// Verifies any existing destination bytes against the expected
    /// piece hashes, in parallel across pieces, per spec §4.9.
    async fn verify_existing(self: &Arc<Self>) -> Result<(), SessionError> {
        let exists = if !self.metadata.info.is_directory {
            self.base_dir.join(self.metadata.final_name()).exists()
                || self.base_dir.join(self.metadata.downloading_name()).exists()
        } else {
            self.base_dir.join(self.metadata.final_name()).exists()
        };
        if !exists {
            return Ok(());
        }

        let num_pieces = self.num_pieces();
        let mut handles = Vec::with_capacity(num_pieces);
        for id in 0..num_pieces {
            let metadata = self.metadata.clone();
            let base_dir = self.base_dir.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                verify_piece_on_disk(&metadata, &base_dir, id as u32)
            }));
        }

        let mut all_verified = true;
        for (id, handle) in handles.into_iter().enumerate() {
            let verified = handle.await.expect("verify task panicked")?;
            if verified {
                let piece = Arc::new(Piece::new(id as u32, self.piece_size(id as u32), self.clock.clone()));
                piece.set_piece_written(true);
                self.active_pieces
                    .lock()
                    .expect("torrent mutex poisoned")
                    .insert(id as u32, piece);
                self.client_pieces.lock().expect("torrent mutex poisoned").set(id, true);
            } else {
                all_verified = false;
            }
        }

        if !self.metadata.info.is_directory && !all_verified {
            return Err(SessionError::ExistingFileMismatch);
        }
        Ok(())
    }

    /// Announces `started`, registers this torrent with the acceptor,
    /// and begins handshaking with the tracker's returned peers.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        crate::acceptor::register(self.clone());
        let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.listening_port);
        self.peers
            .lock()
            .expect("torrent mutex poisoned")
            .push(PeerHandle::listening(listen_addr, self.clock.clone()));

        let downloaded = self.downloaded_bytes();
        let left = self.metadata.total_length() - downloaded;
        let response = self
            .tracker
            .announce(&self.metadata, TrackerEvent::Started, 0, downloaded, left)
            .await?;
        self.connect_to_peers(response.peers);
        Ok(())
    }

    fn connect_to_peers(self: &Arc<Self>, peers: Vec<tracker::Peer>) {
        if !self.config.initiate_peer_connections {
            return;
        }
        let mut guard = self.peers.lock().expect("torrent mutex poisoned");
        for p in peers {
            let addr = SocketAddr::new(p.ip, p.port);
            if guard.iter().any(|h| h.addr == addr) {
                continue;
            }
            guard.push(connect_outbound(addr, self.clone()));
        }
    }

    /// Drives the two retry cadences on `clock` until [`Self::stop`] is
    /// called. Peer I/O itself runs in each peer's own task (see
    /// `peer::session`); this loop only owns the periodic bookkeeping.
    pub async fn run(self: &Arc<Self>) {
        let mut tick: u64 = 0;
        loop {
            self.clock.sleep(PIECE_RETRY_INTERVAL).await;
            if *self.stopping.lock().expect("torrent mutex poisoned") {
                break;
            }
            self.retry_pieces();
            tick += 1;
            if tick % PEER_RETRY_TICKS == 0 {
                self.retry_peers().await;
            }
        }
    }

    /// Clears inactivity timers on stalled pieces and redispatches their
    /// blocks to a shuffled pass over the peer list, per spec §4.9.
    fn retry_pieces(self: &Arc<Self>) {
        let pieces: Vec<Arc<Piece>> = self
            .active_pieces
            .lock()
            .expect("torrent mutex poisoned")
            .values()
            .cloned()
            .collect();
        let mut retry_count: usize = pieces.iter().map(|p| p.retry_blocks()).sum();
        if retry_count == 0 {
            return;
        }

        let mut handles: Vec<PeerHandle> = self
            .peers
            .lock()
            .expect("torrent mutex poisoned")
            .iter()
            .filter(|p| !p.listening_marker)
            .cloned()
            .collect();
        handles.shuffle(&mut rand::rng());

        // A single shuffled pass dispatching one block request per peer;
        // requests are asynchronous (queued on each peer's channel), so
        // unlike the original there is no synchronous "peer declined"
        // signal to loop on.
        for handle in &handles {
            if retry_count == 0 {
                break;
            }
            handle.request_blocks(1);
            retry_count -= 1;
        }
    }

    /// Prunes inactive/closed peers and refreshes the peer list from an
    /// unspecified tracker announce, per spec §4.9.
    async fn retry_peers(self: &Arc<Self>) {
        let (inactive, active): (Vec<PeerHandle>, Vec<PeerHandle>) = {
            let peers = self.peers.lock().expect("torrent mutex poisoned");
            peers
                .iter()
                .filter(|p| !p.listening_marker)
                .cloned()
                .partition(|p| p.is_inactive() || p.is_closed())
        };
        for peer in &inactive {
            peer.close();
        }
        if !inactive.is_empty() {
            let mut peers = self.peers.lock().expect("torrent mutex poisoned");
            peers.retain(|p| p.listening_marker || !inactive.iter().any(|i| i.addr == p.addr));
        }

        let downloaded = self.downloaded_bytes();
        let left = self.metadata.total_length() - downloaded;
        match self
            .tracker
            .announce(&self.metadata, TrackerEvent::Unspecified, 0, downloaded, left)
            .await
        {
            Ok(response) => {
                let known: Vec<SocketAddr> = active.iter().map(|p| p.addr).collect();
                let fresh: Vec<tracker::Peer> = response
                    .peers
                    .into_iter()
                    .filter(|p| !known.contains(&SocketAddr::new(p.ip, p.port)))
                    .collect();
                self.connect_to_peers(fresh);
            }
            Err(e) => tracing::warn!(error = %e, "periodic tracker refresh failed"),
        }
    }

    /// Signals [`Self::run`] to exit, closes every peer and waits for each
    /// one's task to finish before unregistering from the acceptor and
    /// sending the `stopped` announce, so sockets are fully closed before
    /// this torrent is torn down.
    pub async fn stop(self: &Arc<Self>) {
        *self.stopping.lock().expect("torrent mutex poisoned") = true;
        let peers: Vec<PeerHandle> = self
            .peers
            .lock()
            .expect("torrent mutex poisoned")
            .iter()
            .filter(|p| !p.listening_marker)
            .cloned()
            .collect();
        for peer in &peers {
            peer.close();
        }
        const PEER_JOIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
        for peer in &peers {
            if tokio::time::timeout(PEER_JOIN_TIMEOUT, peer.join()).await.is_err() {
                tracing::warn!(addr = %peer.addr, "peer task did not close in time");
            }
        }
        crate::acceptor::unregister(&self.metadata.info_hash);

        let downloaded = self.downloaded_bytes();
        let left = self.metadata.total_length() - downloaded;
        if let Err(e) = self
            .tracker
            .announce(&self.metadata, TrackerEvent::Stopped, 0, downloaded, left)
            .await
        {
            tracing::warn!(error = %e, "stopped announce failed");
        }
    }
}

/// Reads and hashes a piece's bytes from whatever destination file(s)
/// already exist, for the construction-time verify pass.
fn verify_piece_on_disk(metadata: &TorrentFile, base_dir: &Path, id: u32) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let size = metadata.piece_size(id as usize);
    if size <= 0 {
        return Ok(false);
    }
    let mut pos = id as i64 * metadata.info.piece_length;
    let mut remaining = size as usize;
    let mut buf = Vec::with_capacity(size as usize);

    while remaining > 0 {
        let full_path = if !metadata.info.is_directory {
            let name = if base_dir.join(metadata.final_name()).exists() {
                metadata.final_name()
            } else {
                metadata.downloading_name()
            };
            base_dir.join(name)
        } else {
            let (rel, _, _) = metadata
                .file_at_pos(pos)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            base_dir.join(metadata.final_name()).join(rel)
        };
        let (file_offset, space_in_file) = if !metadata.info.is_directory {
            (pos, metadata.total_length() - pos)
        } else {
            let (_, off, sp) = metadata
                .file_at_pos(pos)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            (off, sp)
        };

        if !full_path.exists() {
            return Ok(false);
        }
        let want = remaining.min(space_in_file.max(0) as usize).max(1).min(remaining);
        let mut file = std::fs::File::open(&full_path)?;
        file.seek(SeekFrom::Start(file_offset as u64))?;
        let mut chunk = vec![0u8; want];
        file.read_exact(&mut chunk)?;
        buf.extend_from_slice(&chunk);

        remaining -= want;
        pos += want as i64;
    }

    let expected = metadata.pieces_hash.get(id as usize).copied().unwrap_or([0u8; 20]);
    Ok(hash::sha1(&buf) == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, BencodeValue};
    use crate::runtime::{SystemClock, VirtualClock};
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn single_file_torrent_bytes(piece_length: i64, total_length: i64, name: &str) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        let num_pieces = total_length.div_ceil(piece_length) as usize;
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20 * num_pieces]));
        info.insert(b"name".to_vec(), BencodeValue::String(name.as_bytes().to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_length));
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://t.example/a".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        bencode::encode(&BencodeValue::Dict(root)).unwrap()
    }

    #[tokio::test]
    async fn open_with_no_existing_disk_state_starts_with_empty_client_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = single_file_torrent_bytes(16384, 32768, "out.bin");
        let metadata = TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap();
        let torrent = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        assert!(!torrent.done());
        assert_eq!(torrent.client_pieces_snapshot().count(), 0);
    }

    #[tokio::test]
    async fn open_verifies_a_correct_pre_existing_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 16384];
        let bytes = single_file_torrent_bytes(16384, 16384, "done.bin");
        let mut metadata = TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap();
        metadata.pieces_hash[0] = hash::sha1(&payload);
        std::fs::write(dir.path().join("done.bin"), &payload).unwrap();

        let torrent = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        assert!(torrent.done());
    }

    #[tokio::test]
    async fn open_rejects_a_mismatched_pre_existing_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = single_file_torrent_bytes(16384, 16384, "bad.bin");
        let metadata = TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap();
        std::fs::write(dir.path().join("bad.bin"), vec![0u8; 16384]).unwrap();

        let err = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::ExistingFileMismatch));
    }

    #[tokio::test]
    async fn set_block_enqueues_a_write_once_the_piece_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![3u8; 16384];
        let bytes = single_file_torrent_bytes(16384, 16384, "x.bin");
        let mut metadata = TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap();
        metadata.pieces_hash[0] = hash::sha1(&payload);

        let torrent = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        torrent.set_block(0, 0, &payload).unwrap();

        // The write is asynchronous (file writer task); poll briefly.
        for _ in 0..200 {
            if torrent.done() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(torrent.done());
    }

    /// A 1 MiB file in 64 16-KiB pieces, fed block-by-block as if a single
    /// canned peer served every piece in order: the on-disk temp file
    /// should grow to the full length, then get renamed to its final
    /// name once every piece verifies.
    #[tokio::test]
    async fn single_file_1mib_64_pieces_completes_and_renames_from_sentinel() {
        const PIECE_LEN: usize = 16 * 1024;
        const NUM_PIECES: usize = 64;
        let dir = tempfile::tempdir().unwrap();

        let source: Vec<u8> = (0..(PIECE_LEN * NUM_PIECES))
            .map(|i| (i % 256) as u8)
            .collect();
        let bytes = single_file_torrent_bytes(PIECE_LEN as i64, source.len() as i64, "1MiB.dat");
        let mut metadata = TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap();
        for (id, chunk) in source.chunks(PIECE_LEN).enumerate() {
            metadata.pieces_hash[id] = hash::sha1(chunk);
        }

        let torrent = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        let temp_path = dir.path().join("1MiB.dat.zit_downloading");
        for (id, chunk) in source.chunks(PIECE_LEN).enumerate() {
            torrent.set_block(id as u32, 0, chunk).unwrap();
        }

        for _ in 0..500 {
            if torrent.done() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(torrent.done());

        // Completion is finalized on a spawned task; poll for the rename.
        let final_path = dir.path().join("1MiB.dat");
        for _ in 0..500 {
            if final_path.exists() && !temp_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!temp_path.exists(), "temp file should have been renamed away");
        let written = std::fs::read(&final_path).unwrap();
        assert_eq!(written.len(), source.len());
        assert_eq!(hash::sha1(&written), hash::sha1(&source));
    }

    /// Exercises spec §4.9's two retry cadences directly against a
    /// [`VirtualClock`]: `retry_pieces` only clears a stalled piece's
    /// requested bits once `PIECE_RETRY_INTERVAL` (30s) has passed since
    /// the last request, and `retry_peers` only prunes a peer once it's
    /// been inactive for `INACTIVITY_THRESHOLD` (120s).
    #[tokio::test]
    async fn retry_pieces_and_retry_peers_respect_the_virtual_clock_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = single_file_torrent_bytes(16384, 16384, "retry.bin");
        let metadata = TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap();
        let clock = Arc::new(VirtualClock::new());
        let torrent = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            clock.clone(),
        )
        .await
        .unwrap();

        // Piece retry: claim the only block, then confirm it stays
        // claimed until the clock actually crosses the inactivity window.
        let piece = torrent.active_piece(0, 16384);
        assert_eq!(piece.next_offset(true), Some(0));
        assert_eq!(piece.next_offset(true), None);

        torrent.retry_pieces();
        assert_eq!(
            piece.next_offset(true),
            None,
            "retry_pieces must not clear a request before the inactivity window elapses"
        );

        clock.advance(PIECE_RETRY_INTERVAL + Duration::from_secs(1));
        torrent.retry_pieces();
        assert_eq!(
            piece.next_offset(true),
            Some(0),
            "retry_pieces must clear a request once its inactivity window has elapsed"
        );

        // Peer retry: a peer planted at this clock's current time isn't
        // inactive yet; only once the clock crosses the 120s threshold
        // does retry_peers prune it from the peer list.
        let peer_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        torrent
            .peers
            .lock()
            .expect("torrent mutex poisoned")
            .push(crate::peer::session::test_handle(peer_addr, clock.clone()));

        torrent.retry_peers().await;
        assert!(
            torrent
                .peers
                .lock()
                .expect("torrent mutex poisoned")
                .iter()
                .any(|p| p.addr == peer_addr),
            "retry_peers must not prune a peer before its inactivity window elapses"
        );

        clock.advance(crate::peer::session::INACTIVITY_THRESHOLD + Duration::from_secs(1));
        torrent.retry_peers().await;
        assert!(
            !torrent
                .peers
                .lock()
                .expect("torrent mutex poisoned")
                .iter()
                .any(|p| p.addr == peer_addr),
            "retry_peers must prune a peer once its inactivity window has elapsed"
        );
    }
}
