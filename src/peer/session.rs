//! One state machine per peer connection: handshake, choke/interest,
//! request pipeline, serving, inactivity.
//!
//! Grounded on the teacher's `peer/handshake.rs` (tokio `TcpStream`
//! read/write shape for the handshake) and
//! `jsondevers-bobby-bit/src/peer/connection.rs` /
//! `peer/manager.rs` for the broader per-peer-task plus shared-status
//! split. Each peer is one tokio task pumped by the runtime rather than an
//! OS thread; a peer's outgoing writes are necessarily serialized because
//! exactly one task ever holds the write half of the socket, which stands
//! in for a dedicated per-peer send queue with at most one in-flight
//! write.
use crate::bitfield::Bitfield;
use crate::runtime::Clock;
use crate::torrent::session::Torrent;
use crate::wire::handshake::HANDSHAKE_LEN;
use crate::wire::{Handshake, Message, WireError};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// BitTorrent-standard inactivity threshold: a peer that sends nothing
/// for this long is treated as dead.
pub const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(120);

/// Upper bound on new block requests issued per request-pipeline
/// opportunity.
const MAX_PIPELINE_BATCH: usize = 5;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Resolving,
    Connecting,
    HandshakeSent,
    Established,
    Closing,
    Closed,
}

/// The mutable per-connection state, shared between the peer's task and
/// whoever holds its [`PeerHandle`] (the torrent's run loop and retry
/// passes).
#[derive(Debug)]
pub struct PeerStatus {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub remote_pieces: Bitfield,
    /// Whether a BITFIELD has been seen from this peer yet; gates the
    /// HAVE-before-BITFIELD fallback.
    pub seen_bitfield: bool,
    pub last_activity: Instant,
    pub state: ConnectionState,
    clock: Arc<dyn Clock>,
}

impl PeerStatus {
    fn new(num_pieces: usize, clock: Arc<dyn Clock>) -> Self {
        let last_activity = clock.now();
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_pieces: Bitfield::with_bit_capacity(num_pieces),
            seen_bitfield: false,
            last_activity,
            state: ConnectionState::Resolving,
            clock,
        }
    }
}

enum PeerCommand {
    RequestBlocks(usize),
    ClearInterested,
    Close,
}

/// A handle to a running peer session: the public side the torrent
/// session holds in its peer list.
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    /// True for the synthetic entry representing this torrent's listening
    /// acceptor registration. Excluded from inactivity pruning in
    /// `retry_peers`.
    pub listening_marker: bool,
    status: Arc<Mutex<PeerStatus>>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    /// The spawned session task, so `Torrent::stop` can wait for the
    /// socket to actually close instead of firing `Close` and returning.
    /// `None` for the synthetic listening marker, which has no task.
    task: Option<Arc<Mutex<Option<JoinHandle<()>>>>>,
}

impl PeerHandle {
    fn new(addr: SocketAddr, num_pieces: usize, clock: Arc<dyn Clock>) -> (Self, Arc<Mutex<PeerStatus>>, mpsc::UnboundedReceiver<PeerCommand>) {
        let status = Arc::new(Mutex::new(PeerStatus::new(num_pieces, clock)));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                addr,
                listening_marker: false,
                status: status.clone(),
                commands: tx,
                task: Some(Arc::new(Mutex::new(None))),
            },
            status,
            rx,
        )
    }

    /// A handle for the synthetic "listening" peer added in
    /// [`Torrent::start`] to represent the acceptor's registration.
    pub fn listening(addr: SocketAddr, clock: Arc<dyn Clock>) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            addr,
            listening_marker: true,
            status: Arc::new(Mutex::new(PeerStatus::new(0, clock))),
            commands: tx,
            task: None,
        }
    }

    pub fn is_inactive(&self) -> bool {
        let status = self.status.lock().expect("peer status mutex poisoned");
        status.clock.now().duration_since(status.last_activity) >= INACTIVITY_THRESHOLD
    }

    pub fn is_closed(&self) -> bool {
        self.status.lock().expect("peer status mutex poisoned").state == ConnectionState::Closed
    }

    pub fn remote_pieces(&self) -> Bitfield {
        self.status.lock().expect("peer status mutex poisoned").remote_pieces.clone()
    }

    /// Asks this peer's task to top off its outgoing request pipeline by
    /// up to `n` blocks, used by `Torrent::retry_pieces`'s round-robin
    /// redispatch.
    pub fn request_blocks(&self, n: usize) {
        let _ = self.commands.send(PeerCommand::RequestBlocks(n));
    }

    /// Clears `am_interested` and tells the peer, once the torrent is
    /// fully downloaded.
    pub fn clear_interested(&self) {
        let _ = self.commands.send(PeerCommand::ClearInterested);
    }

    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        if let Some(slot) = &self.task {
            *slot.lock().expect("peer task mutex poisoned") = Some(handle);
        }
    }

    /// Waits for this peer's session task to finish closing its socket.
    /// A no-op for the synthetic listening marker, which has no task.
    pub async fn join(&self) {
        let Some(slot) = &self.task else { return };
        let handle = slot.lock().expect("peer task mutex poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(addr = %self.addr, error = %e, "peer task panicked while joining");
            }
        }
    }
}

/// A handle with no backing task, for tests in `torrent::session` that
/// need to plant a peer at a known address/clock without a real socket.
#[cfg(test)]
pub(crate) fn test_handle(addr: SocketAddr, clock: Arc<dyn Clock>) -> PeerHandle {
    let (handle, _status, _rx) = PeerHandle::new(addr, 0, clock);
    handle
}

/// Connects outbound to `addr` and drives its session to completion in a
/// spawned task. Returns immediately with a handle whose status starts in
/// `Resolving`/`Connecting`.
pub fn connect_outbound(addr: SocketAddr, torrent: Arc<Torrent>) -> PeerHandle {
    let (handle, status, rx) = PeerHandle::new(addr, torrent.num_pieces(), torrent.clock());
    let jh = tokio::spawn(run_outbound(addr, torrent, status, rx));
    handle.set_task(jh);
    handle
}

async fn run_outbound(
    addr: SocketAddr,
    torrent: Arc<Torrent>,
    status: Arc<Mutex<PeerStatus>>,
    rx: mpsc::UnboundedReceiver<PeerCommand>,
) {
    status.lock().expect("peer status mutex poisoned").state = ConnectionState::Connecting;
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            if let Err(e) = run_session(stream, Role::Initiated, torrent, status.clone(), rx, BytesMut::new()).await {
                tracing::warn!(%addr, error = %e, "peer session ended");
            }
        }
        Err(e) => {
            tracing::warn!(%addr, error = %e, "failed to connect to peer");
        }
    }
    status.lock().expect("peer status mutex poisoned").state = ConnectionState::Closed;
}

/// Hands an already-accepted socket (whose handshake the acceptor has
/// already read and routed by info hash) to a new peer session.
pub fn accept_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    remote_handshake: Handshake,
    leftover: BytesMut,
    torrent: Arc<Torrent>,
) -> PeerHandle {
    let (handle, status, rx) = PeerHandle::new(addr, torrent.num_pieces(), torrent.clock());
    let jh = tokio::spawn(async move {
        if let Err(e) = run_session(
            stream,
            Role::Accepted(remote_handshake),
            torrent,
            status.clone(),
            rx,
            leftover,
        )
        .await
        {
            tracing::warn!(%addr, error = %e, "peer session ended");
        }
        status.lock().expect("peer status mutex poisoned").state = ConnectionState::Closed;
    });
    handle.set_task(jh);
    handle
}

enum Role {
    Initiated,
    Accepted(Handshake),
}

async fn read_handshake(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Handshake, PeerError> {
    let mut tmp = [0u8; 4096];
    while buf.len() < HANDSHAKE_LEN {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let hs = Handshake::parse(&buf[..HANDSHAKE_LEN])?;
    buf.advance(HANDSHAKE_LEN);
    Ok(hs)
}

async fn send(stream: &mut TcpStream, msg: Message) -> Result<(), PeerError> {
    stream.write_all(&msg.serialize()).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut stream: TcpStream,
    role: Role,
    torrent: Arc<Torrent>,
    status: Arc<Mutex<PeerStatus>>,
    mut rx: mpsc::UnboundedReceiver<PeerCommand>,
    mut buf: BytesMut,
) -> Result<(), PeerError> {
    match role {
        Role::Initiated => {
            status.lock().expect("peer status mutex poisoned").state = ConnectionState::HandshakeSent;
            let hs = Handshake::new(torrent.metadata.info_hash, torrent.local_peer_id);
            stream.write_all(&hs.serialize()).await?;
            let remote_hs = read_handshake(&mut stream, &mut buf).await?;
            remote_hs.validate(&torrent.metadata.info_hash)?;
        }
        Role::Accepted(remote_hs) => {
            remote_hs.validate(&torrent.metadata.info_hash)?;
            let hs = Handshake::new(torrent.metadata.info_hash, torrent.local_peer_id);
            stream.write_all(&hs.serialize()).await?;
        }
    }

    {
        let mut s = status.lock().expect("peer status mutex poisoned");
        s.state = ConnectionState::Established;
        s.last_activity = s.clock.now();
    }

    let client_pieces = torrent.client_pieces_snapshot();
    if !client_pieces.is_empty() {
        send(&mut stream, Message::Bitfield(client_pieces.as_bytes().to_vec())).await?;
    }
    if !torrent.done() {
        send(&mut stream, Message::Interested).await?;
        status.lock().expect("peer status mutex poisoned").am_interested = true;
    }

    let mut read_buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(PeerCommand::RequestBlocks(n)) => {
                        request_more_blocks(&mut stream, &status, &torrent, n).await?;
                    }
                    Some(PeerCommand::ClearInterested) => {
                        status.lock().expect("peer status mutex poisoned").am_interested = false;
                        send(&mut stream, Message::NotInterested).await?;
                    }
                    Some(PeerCommand::Close) | None => {
                        status.lock().expect("peer status mutex poisoned").state = ConnectionState::Closing;
                        return Ok(());
                    }
                }
            }
            result = stream.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    status.lock().expect("peer status mutex poisoned").state = ConnectionState::Closing;
                    return Ok(());
                }
                buf.extend_from_slice(&read_buf[..n]);
                loop {
                    match Message::parse(&buf) {
                        Ok((consumed, msg)) => {
                            buf.advance(consumed);
                            handle_message(&mut stream, &status, &torrent, msg).await?;
                        }
                        Err(WireError::Incomplete) => break,
                        Err(e) => return Err(PeerError::Wire(e)),
                    }
                }
            }
        }
    }
}

async fn handle_message(
    stream: &mut TcpStream,
    status: &Arc<Mutex<PeerStatus>>,
    torrent: &Arc<Torrent>,
    msg: Message,
) -> Result<(), PeerError> {
    {
        let mut s = status.lock().expect("peer status mutex poisoned");
        s.last_activity = s.clock.now();
    }

    match msg {
        Message::KeepAlive => {}
        Message::Choke => {
            status.lock().expect("peer status mutex poisoned").peer_choking = true;
        }
        Message::Unchoke => {
            status.lock().expect("peer status mutex poisoned").peer_choking = false;
            request_more_blocks(stream, status, torrent, MAX_PIPELINE_BATCH).await?;
        }
        Message::Interested => {
            status.lock().expect("peer status mutex poisoned").peer_interested = true;
        }
        Message::NotInterested => {
            status.lock().expect("peer status mutex poisoned").peer_interested = false;
        }
        Message::Have(index) => {
            apply_have(status, torrent, index);
            request_more_blocks(stream, status, torrent, MAX_PIPELINE_BATCH).await?;
        }
        Message::Bitfield(bits) => {
            let mut s = status.lock().expect("peer status mutex poisoned");
            s.remote_pieces = Bitfield::from_bytes(bits);
            s.seen_bitfield = true;
        }
        Message::Request { index, begin, length } => {
            serve_request(stream, status, torrent, index, begin, length).await?;
        }
        Message::Piece { index, begin, block } => {
            if let Err(e) = torrent.set_block(index, begin, &block) {
                tracing::warn!(index, begin, error = %e, "rejected incoming block");
            }
            request_more_blocks(stream, status, torrent, MAX_PIPELINE_BATCH).await?;
        }
        Message::Cancel { .. } => {}
        Message::Port(_) => {}
        Message::Unknown(_) => {}
    }
    Ok(())
}

/// Implements the HAVE-before-BITFIELD fallback: if we've never received
/// a BITFIELD from this peer, assume it has every piece before applying
/// the single HAVE bit, per spec §4.6/§9 (behind
/// `Config::assume_have_before_bitfield`, carried through
/// `Torrent::config`).
fn apply_have(status: &Arc<Mutex<PeerStatus>>, torrent: &Arc<Torrent>, index: u32) {
    let mut s = status.lock().expect("peer status mutex poisoned");
    if !s.seen_bitfield && torrent.config.assume_have_before_bitfield {
        for i in 0..torrent.num_pieces() {
            s.remote_pieces.set(i, true);
        }
    }
    s.remote_pieces.set(index as usize, true);
}

/// Requests up to `n` new blocks from pieces this peer has that we don't,
/// per spec §4.6's request pipeline: lowest relevant piece index first,
/// walking forward, using `Piece::next_offset(mark=true)` to claim each
/// block.
async fn request_more_blocks(
    stream: &mut TcpStream,
    status: &Arc<Mutex<PeerStatus>>,
    torrent: &Arc<Torrent>,
    n: usize,
) -> Result<(), PeerError> {
    let (peer_choking, relevant) = {
        let s = status.lock().expect("peer status mutex poisoned");
        (s.peer_choking, s.remote_pieces.difference(&torrent.client_pieces_snapshot()))
    };
    if peer_choking {
        return Ok(());
    }

    let mut requests = Vec::new();
    let mut bit = 0usize;
    while requests.len() < n {
        let Some(index) = relevant.next(true, bit) else {
            break;
        };
        bit = index + 1;
        let piece_size = torrent.piece_size(index as u32);
        if piece_size == 0 {
            continue;
        }
        let piece = torrent.active_piece(index as u32, piece_size as u32);
        while requests.len() < n {
            let Some(offset) = piece.next_offset(true) else {
                break;
            };
            let length = piece.block_len_at(offset);
            requests.push(Message::Request { index: index as u32, begin: offset, length });
        }
    }

    if requests.is_empty() {
        return Ok(());
    }
    let mut batch = Vec::new();
    for req in &requests {
        batch.extend_from_slice(&req.serialize());
    }
    stream.write_all(&batch).await?;
    Ok(())
}

/// Serves an incoming block request, per spec §4.6: silently refused if
/// we're choking this peer or it hasn't declared interest.
async fn serve_request(
    stream: &mut TcpStream,
    status: &Arc<Mutex<PeerStatus>>,
    torrent: &Arc<Torrent>,
    index: u32,
    begin: u32,
    length: u32,
) -> Result<(), PeerError> {
    let (am_choking, peer_interested) = {
        let s = status.lock().expect("peer status mutex poisoned");
        (s.am_choking, s.peer_interested)
    };
    if am_choking || !peer_interested {
        return Ok(());
    }
    match torrent.read_block(index, begin, length).await {
        Ok(block) => send(stream, Message::Piece { index, begin, block }).await,
        Err(e) => {
            tracing::warn!(index, begin, length, error = %e, "failed to serve requested block");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VirtualClock;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)
    }

    #[test]
    fn is_inactive_only_once_the_clock_passes_the_threshold() {
        let clock = Arc::new(VirtualClock::new());
        let handle = test_handle(addr(), clock.clone());
        assert!(!handle.is_inactive());

        clock.advance(INACTIVITY_THRESHOLD - Duration::from_secs(1));
        assert!(!handle.is_inactive());

        clock.advance(Duration::from_secs(2));
        assert!(handle.is_inactive());
    }

    #[test]
    fn join_on_a_handle_with_no_backing_task_returns_immediately() {
        let clock = Arc::new(VirtualClock::new());
        let handle = test_handle(addr(), clock);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(handle.join());
    }
}
