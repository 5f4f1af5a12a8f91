//! Binds one port, accepts incoming peers, and routes each by the info
//! hash in its handshake to the right torrent, per spec §4.7.
//!
//! Grounded on the teacher's (now-superseded) `peer/handshake.rs`, which
//! read a handshake directly off an accepted `TcpStream`; generalized
//! here into its own listener plus a dependency-injected routing
//! function, per spec §9's note to avoid baking in a single global
//! mutable map. [`listen`] takes the routing function explicitly (the
//! DI form); [`listen_registered`]/[`register`]/[`unregister`] are the
//! process-wide-registry realization the same note allows, used by
//! `main.rs` for the common single-process case.
use crate::peer::session::accept_inbound;
use crate::torrent::session::Torrent;
use crate::wire::handshake::HANDSHAKE_LEN;
use crate::wire::Handshake;
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

type Registry = Mutex<HashMap<[u8; 20], Weak<Torrent>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `torrent` so incoming connections whose handshake carries
/// its info hash get routed to it by [`listen_registered`].
pub fn register(torrent: Arc<Torrent>) {
    registry()
        .lock()
        .expect("acceptor registry mutex poisoned")
        .insert(torrent.metadata.info_hash, Arc::downgrade(&torrent));
}

pub fn unregister(info_hash: &[u8; 20]) {
    registry().lock().expect("acceptor registry mutex poisoned").remove(info_hash);
}

/// Looks up a registered torrent by info hash, dropping the entry if its
/// torrent has already been deallocated.
pub fn route(info_hash: &[u8; 20]) -> Option<Arc<Torrent>> {
    registry()
        .lock()
        .expect("acceptor registry mutex poisoned")
        .get(info_hash)
        .and_then(Weak::upgrade)
}

/// Binds `addr` and accepts indefinitely, handing each connection to
/// `route` to find its torrent. Returns only on a bind/accept I/O error.
pub async fn listen<R>(addr: SocketAddr, route: R) -> std::io::Result<()>
where
    R: Fn(&[u8; 20]) -> Option<Arc<Torrent>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let route = Arc::new(route);
    tracing::info!(%addr, "acceptor listening");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let route = route.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_incoming(stream, peer_addr, route.as_ref()).await {
                tracing::warn!(%peer_addr, error = %e, "failed to accept incoming peer");
            }
        });
    }
}

/// Convenience entry point using the process-wide registry populated by
/// [`register`]/[`unregister`].
pub async fn listen_registered(addr: SocketAddr) -> std::io::Result<()> {
    listen(addr, route).await
}

async fn handle_incoming(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    route: &(dyn Fn(&[u8; 20]) -> Option<Arc<Torrent>> + Send + Sync),
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
    let mut tmp = [0u8; 4096];
    while buf.len() < HANDSHAKE_LEN {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
    }

    let handshake = match Handshake::parse(&buf[..HANDSHAKE_LEN]) {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!(%peer_addr, error = %e, "rejected malformed handshake");
            return Ok(());
        }
    };
    let leftover = BytesMut::from(&buf[HANDSHAKE_LEN..]);

    let Some(torrent) = route(&handshake.info_hash) else {
        tracing::debug!(%peer_addr, "no torrent registered for this info hash, closing");
        return Ok(());
    };

    accept_inbound(stream, peer_addr, handshake, leftover, torrent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, BencodeValue};
    use crate::runtime::SystemClock;
    use crate::torrent::file::TorrentFile;
    use crate::torrent::session::TorrentConfig;
    use std::collections::BTreeMap;
    use tokio::io::AsyncWriteExt;

    fn single_file_torrent() -> TorrentFile {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(16384));
        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://t.example/a".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = bencode::encode(&BencodeValue::Dict(root)).unwrap();
        TorrentFile::parse(bencode::decode(&bytes).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn register_then_route_finds_the_torrent_by_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = single_file_torrent();
        let info_hash = metadata.info_hash;
        let torrent = Torrent::open(
            metadata,
            dir.path().to_path_buf(),
            0,
            TorrentConfig::default(),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();

        register(torrent.clone());
        assert!(route(&info_hash).is_some());
        unregister(&info_hash);
        assert!(route(&info_hash).is_none());
    }

    #[tokio::test]
    async fn unregistered_info_hash_gets_the_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let _ = handle_incoming(stream, peer_addr, &|_| None).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let hs = Handshake::new([0xAAu8; 20], [0xBBu8; 20]);
        client.write_all(&hs.serialize()).await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should close without replying");
    }
}
