//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - HTTP(S) announce requests and responses, relying on `reqwest`'s native
//!   redirect-following and chunked-transfer decoding rather than hand-rolled
//!   HTTP framing (the teacher already depends on `reqwest` for the request
//!   side; this generalizes that choice to the reply side too).
//! - Multi-tracker tier shuffling (BEP 12), grounded on
//!   `examples/original_source/src/torrent.cpp`'s `m_trackers` tier loop.
//! - A UDP announce transport contract (send/await-reply/timeout only, per
//!   spec §4.8 and §9 — not a full BEP 15 state machine).
//! - Peer parsing (compact and non-compact), peer ID generation, and URL
//!   percent-encoding, all kept from the teacher's original shape.
use crate::bencode::{self, BencodeValue};
use crate::torrent::file::TorrentFile;
use crate::torrent::session::TrackerEvent;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub mod udp;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker URL is invalid: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("tracker response is not valid bencode: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("tracker response is not a dictionary")]
    ResponseNotDict,

    #[error("tracker response is missing or has a malformed 'peers' field")]
    MissingPeers,

    #[error("UDP tracker reply timed out")]
    UdpTimeout,

    #[error("I/O error talking to the UDP tracker: {0}")]
    UdpIo(#[from] std::io::Error),

    #[error("every tracker in every tier failed; last error: {0}")]
    AllTrackersFailed(Box<TrackerError>),

    #[error("torrent declares no trackers")]
    NoTrackers,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Parameters for a single tracker announce request, per spec §4.8.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub left: i64,
    pub event: TrackerEvent,
}

/// A peer as received from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed response from a tracker.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

/// Host prefix of Docker's default bridge network. Announce responses and
/// URLs starting with this are rewritten to `localhost`, a pragmatic
/// integration-test hack carried from `torrent.cpp` and kept behind
/// [`Client::docker_rewrite`] per spec §9's note that it is "not
/// correctness-preserving in production".
const DOCKER_BRIDGE_PREFIX: &str = "172.17.";

/// A client communicating with a torrent's trackers.
///
/// Holds the one peer id and listening port used for every announce this
/// process makes, plus a small sticky memory of the last tracker that
/// succeeded for each torrent's tier list (BEP 12: "remember successful
/// tracker for next request (optional)").
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    listening_port: u16,
    http: reqwest::Client,
    pub docker_rewrite: bool,
    sticky: Mutex<Option<String>>,
}

impl Client {
    pub fn new(listening_port: u16) -> TrackerResult<Self> {
        let http = reqwest::Client::builder()
            // No connection-pool reuse: spec §6 calls for `Connection:
            // close` semantics, not HTTP/1.1 keep-alive.
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            peer_id: generate_peer_id(),
            listening_port,
            http,
            docker_rewrite: true,
            sticky: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces to the torrent's trackers, trying tiers in order (BEP 12):
    /// within a tier the trackers are shuffled, and the first to answer
    /// with any response wins. Only once every tracker in every tier has
    /// failed is the last error propagated.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(
        &self,
        torrent: &TorrentFile,
        event: TrackerEvent,
        uploaded: i64,
        downloaded: i64,
        left: i64,
    ) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.listening_port,
            uploaded,
            downloaded,
            left,
            event,
        };

        let mut tiers = self.tiers(torrent);
        if tiers.is_empty() {
            return Err(TrackerError::NoTrackers);
        }

        // Try the previously-successful tracker first, ahead of its tier's
        // shuffle, as BEP 12 allows.
        if let Some(sticky) = self.sticky.lock().expect("sticky mutex poisoned").clone() {
            for tier in &mut tiers {
                if let Some(pos) = tier.iter().position(|t| t == &sticky) {
                    tier.swap(0, pos);
                }
            }
        }

        let mut last_error = None;
        for tier in &mut tiers {
            if tier.is_empty() {
                continue;
            }
            let (first, rest) = tier.split_at_mut(1);
            rest.shuffle(&mut rand::rng());
            let mut ordered = first.to_vec();
            ordered.extend_from_slice(rest);

            for url in &ordered {
                match self.announce_one(url, &request).await {
                    Ok(response) => {
                        *self.sticky.lock().expect("sticky mutex poisoned") =
                            Some(url.clone());
                        return Ok(response);
                    }
                    Err(e) => {
                        tracing::warn!(url, error = %e, "tracker announce failed");
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(TrackerError::AllTrackersFailed(Box::new(
            last_error.expect("at least one tracker was tried"),
        )))
    }

    /// Tiers to try, per BEP 12: `announce-list` if present, else a single
    /// tier containing just `announce`.
    fn tiers(&self, torrent: &TorrentFile) -> Vec<Vec<String>> {
        if !torrent.announce_list.is_empty() {
            torrent.announce_list.clone()
        } else {
            vec![vec![torrent.announce.clone()]]
        }
    }

    async fn announce_one(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> TrackerResult<AnnounceResponse> {
        let mut url = url::Url::parse(tracker_url)?;
        if self.docker_rewrite {
            rewrite_docker_bridge(&mut url);
        }

        let params: Vec<(&str, String)> = {
            let mut p = vec![
                ("info_hash", url_encode(&request.info_hash)),
                ("peer_id", url_encode(&request.peer_id)),
                ("port", request.port.to_string()),
                ("uploaded", request.uploaded.to_string()),
                ("downloaded", request.downloaded.to_string()),
                ("left", request.left.to_string()),
                ("compact", "1".to_string()),
            ];
            if let Some(event) = request.event.query_value() {
                p.push(("event", event.to_string()));
            }
            p
        };
        url.query_pairs_mut().extend_pairs(&params).finish();

        tracing::debug!(%url, "making announce request to tracker");
        let response = self
            .http
            .get(url)
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await?;
        let body = response.bytes().await?;
        let mut response = Self::parse_announce_response(&body)?;
        response.peers.retain(|p| !self.is_self(p));
        Ok(response)
    }

    /// True if `peer` is this process's own listening endpoint, reachable
    /// on the loopback address — skipped per spec §4.8.
    fn is_self(&self, peer: &Peer) -> bool {
        peer.port == self.listening_port && peer.ip.is_loopback()
    }

    /// Parses a bencoded tracker announce reply using this crate's own
    /// bencode codec (the teacher additionally pulled in `serde_bencode`
    /// for this; one codec covers both torrent metadata and tracker
    /// replies per spec §4.1, so `serde_bencode` is dropped — see
    /// DESIGN.md).
    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let value = bencode::decode(bytes)?;
        let dict = match value {
            BencodeValue::Dict(d) => d,
            _ => return Err(TrackerError::ResponseNotDict),
        };

        let interval = match dict.get(&b"interval".to_vec()) {
            Some(BencodeValue::Integer(i)) => *i,
            _ => 0,
        };

        let peers = match dict.get(&b"peers".to_vec()) {
            Some(BencodeValue::String(bytes)) => parse_compact_peers(bytes)?,
            Some(BencodeValue::List(list)) => parse_dict_peers(list)?,
            _ => return Err(TrackerError::MissingPeers),
        };

        Ok(AnnounceResponse { interval, peers })
    }

    /// Sends a raw payload to a UDP tracker and waits for its reply,
    /// per spec §4.8's transport-only contract.
    pub async fn udp_round_trip(
        &self,
        addr: std::net::SocketAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> TrackerResult<Vec<u8>> {
        udp::round_trip(addr, payload, timeout).await
    }
}

/// Decodes the compact peer format: 6 bytes per peer (4-byte IPv4 address,
/// 2-byte port in network byte order).
fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<Peer>> {
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect())
}

/// Decodes the non-compact peer format: a list of `{ip, port}` dicts.
fn parse_dict_peers(list: &[BencodeValue]) -> TrackerResult<Vec<Peer>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let BencodeValue::Dict(dict) = entry else {
            continue;
        };
        let ip = match dict.get(&b"ip".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8_lossy(s).parse::<IpAddr>().ok(),
            _ => None,
        };
        let port = match dict.get(&b"port".to_vec()) {
            Some(BencodeValue::Integer(i)) => Some(*i as u16),
            _ => None,
        };
        if let (Some(ip), Some(port)) = (ip, port) {
            peers.push(Peer { ip, port });
        }
    }
    Ok(peers)
}

/// Rewrites a Docker default-bridge host (`172.17.x.x`) to `localhost`.
fn rewrite_docker_bridge(url: &mut url::Url) {
    if let Some(host) = url.host_str() {
        if host.starts_with(DOCKER_BRIDGE_PREFIX) {
            let _ = url.set_host(Some("localhost"));
        }
    }
}

/// Generates this process's 20-byte peer id: an 8-byte client prefix
/// followed by 12 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice per RFC 3986: unreserved characters
/// (`a-z A-Z 0-9 - . _ ~`) pass through, everything else becomes `%XX`.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_passes_unreserved_chars_through() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
        assert_eq!(url_encode(b" !"), "%20%21");
    }

    #[test]
    fn generate_peer_id_has_the_expected_prefix_and_length() {
        let id = generate_peer_id();
        assert_eq!(id.len(), 20);
        assert_eq!(&id[..8], b"-RT0001-");
    }

    #[test]
    fn parses_compact_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 5, 0x00, 0x50];
        let peers = parse_compact_peers(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn parses_non_compact_dict_peer_list() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"ip".to_vec(),
            BencodeValue::String(b"10.0.0.5".to_vec()),
        );
        dict.insert(b"port".to_vec(), BencodeValue::Integer(6881));
        let peers = parse_dict_peers(&[BencodeValue::Dict(dict)]).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 6881);
    }

    #[test]
    fn parse_announce_response_rejects_missing_peers_field() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        let bytes = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let err = Client::parse_announce_response(&bytes).unwrap_err();
        assert!(matches!(err, TrackerError::MissingPeers));
    }

    #[test]
    fn rewrites_docker_bridge_host_but_leaves_others_alone() {
        let mut url = url::Url::parse("http://172.17.0.1:6969/announce").unwrap();
        rewrite_docker_bridge(&mut url);
        assert_eq!(url.host_str(), Some("localhost"));

        let mut url = url::Url::parse("http://tracker.example:6969/announce").unwrap();
        rewrite_docker_bridge(&mut url);
        assert_eq!(url.host_str(), Some("tracker.example"));
    }
}
