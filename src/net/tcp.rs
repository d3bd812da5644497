use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::MAX_PACKET;
use crate::message;

/// One TCP query/response exchange with 2-byte length framing, used when a
/// datagram answer came back truncated.
pub async fn exchange(
    server: SocketAddr,
    query: &[u8],
    deadline: Duration,
) -> std::io::Result<Vec<u8>> {
    tokio::time::timeout(deadline, async {
        let mut stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true).ok();

        let len = u16::try_from(query.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large for tcp")
        })?;
        let mut frame = Vec::with_capacity(query.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(query);
        stream.write_all(&frame).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let response_len = u16::from_be_bytes(len_buf) as usize;
        if response_len == 0 || response_len > MAX_PACKET {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unreasonable response length {}", response_len),
            ));
        }
        let mut response = vec![0u8; response_len];
        stream.read_exact(&mut response).await?;

        if !message::response_matches(query, &response) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response does not match query",
            ));
        }
        Ok(response)
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tcp query timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, MessageType};
    use hickory_proto::rr::{DNSClass, Name, RecordType};
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn build_query(id: u16) -> Vec<u8> {
        message::build_query(
            &Name::from_str("example.com.").unwrap(),
            DNSClass::IN,
            RecordType::A,
            id,
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_framed_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await.unwrap();

            let mut message = Message::from_vec(&query).unwrap();
            message.set_message_type(MessageType::Response);
            let response = message.to_vec().unwrap();
            let mut frame = (response.len() as u16).to_be_bytes().to_vec();
            frame.extend_from_slice(&response);
            stream.write_all(&frame).await.unwrap();
        });

        let query = build_query(42);
        let response = exchange(addr, &query, Duration::from_secs(5)).await.unwrap();
        assert!(message::response_matches(&query, &response));
    }

    #[tokio::test]
    async fn test_connection_refused_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let query = build_query(42);
        assert!(exchange(addr, &query, Duration::from_secs(5)).await.is_err());
    }
}
