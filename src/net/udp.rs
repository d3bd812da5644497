use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio::net::UdpSocket;

use super::MAX_PACKET;
use crate::message;

/// One UDP query/response exchange. Datagrams that do not match the query's
/// id and question are ignored and the wait continues; the deadline covers
/// the whole exchange.
pub async fn exchange(
    server: SocketAddr,
    query: &[u8],
    deadline: Duration,
) -> std::io::Result<Vec<u8>> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_PACKET];
    tokio::time::timeout(deadline, async {
        loop {
            let n = socket.recv(&mut buf).await?;
            if message::response_matches(query, &buf[..n]) {
                return Ok(buf[..n].to_vec());
            }
            debug!("ignoring mismatched datagram from {}", server);
        }
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "udp query timed out"))?
}
