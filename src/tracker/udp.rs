//! UDP tracker transport: send a payload, wait for a reply, time out.
//!
//! Spec §4.8/§9 scope this to a transport contract only — a full BEP 15
//! connect/announce/scrape transaction state machine (connection ids,
//! retry backoff, action codes) is explicitly out of scope; a
//! `jsondevers-bobby-bit`-style `UdpTracker` that encodes those frames
//! would be the natural next layer on top of this.
use super::TrackerError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// The largest UDP tracker reply we expect to receive. Oversized datagrams
/// are truncated by the kernel before we ever see them; a single read of
/// this much is plenty for connect/announce/scrape replies and their
/// error bodies.
const MAX_REPLY_LEN: usize = 2048;

/// Sends `payload` to `addr` over UDP and waits up to `timeout` for a
/// reply, returning its raw bytes.
pub async fn round_trip(
    addr: SocketAddr,
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, TrackerError> {
    let bind_addr: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(payload, addr).await?;

    let mut buf = vec![0u8; MAX_REPLY_LEN];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::UdpTimeout)??;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_echoes_between_two_local_sockets() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(&buf[..n], from).await.unwrap();
        });

        let reply = round_trip(responder_addr, b"hello", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"hello");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn round_trip_times_out_when_nothing_answers() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let err = round_trip(dead_addr, b"ping", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::UdpTimeout) || matches!(err, TrackerError::UdpIo(_)));
    }
}
