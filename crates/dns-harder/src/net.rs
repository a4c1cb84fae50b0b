use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

/// The fixed DNS header size; anything shorter is not a message.
const HEADER_SIZE: usize = 12;

/// The largest response that fits in a plain UDP datagram.
const MAX_UDP_PAYLOAD: usize = 512;

/// Read a DNS message from a TCP-style stream.
///
/// A DNS TCP message differs from a UDP one only in its big-endian u16
/// length prefix, which lets the entire message be read before parsing
/// begins.  The stream is generic so the same framing works over TLS.
pub async fn read_tcp_bytes<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BytesMut, TcpError> {
    match stream.read_u16().await {
        Ok(size) => {
            let expected = size as usize;
            let mut bytes = BytesMut::with_capacity(expected);
            while bytes.len() < expected {
                match stream.read_buf(&mut bytes).await {
                    Ok(0) if bytes.len() < expected => {
                        return Err(TcpError::TooShort {
                            id: message_id(&bytes),
                            expected,
                            actual: bytes.len(),
                        });
                    }
                    Err(error) => {
                        return Err(TcpError::Io {
                            id: message_id(&bytes),
                            error,
                        });
                    }
                    _ => (),
                }
            }
            Ok(bytes)
        }
        Err(error) => Err(TcpError::Io { id: None, error }),
    }
}

fn message_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() >= 2 {
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

/// An error that can occur when reading a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    Io {
        id: Option<u16>,
        error: io::Error,
    },
}

impl TcpError {
    /// The message id, when enough of the header arrived to read it.
    pub fn id(&self) -> Option<u16> {
        match self {
            TcpError::TooShort { id, .. } | TcpError::Io { id, .. } => *id,
        }
    }
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpError::TooShort {
                expected, actual, ..
            } => write!(f, "connection closed after {actual} of {expected} bytes"),
            TcpError::Io { error, .. } => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for TcpError {}

impl From<TcpError> for io::Error {
    fn from(error: TcpError) -> Self {
        match error {
            TcpError::TooShort { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, error.to_string()),
            TcpError::Io { error, .. } => error,
        }
    }
}

/// Write a serialised message to a TCP-style stream: a two-byte length
/// prefix (big-endian u16), then the message with the TC flag cleared.  A
/// message too large for the prefix is truncated and flagged instead.
pub async fn send_tcp_bytes<S: AsyncWrite + Unpin>(
    stream: &mut S,
    bytes: &mut [u8],
) -> Result<(), io::Error> {
    if bytes.len() < HEADER_SIZE {
        return Err(too_short(bytes.len()));
    }

    let len = if let Ok(len) = u16::try_from(bytes.len()) {
        bytes[2] &= 0b1111_1101;
        len
    } else {
        bytes[2] |= 0b0000_0010;
        u16::MAX
    };

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes[..(len as usize)]).await?;

    Ok(())
}

/// Write a serialised message to a UDP socket, truncating to 512 bytes and
/// setting the TC flag when it does not fit.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
) -> Result<(), io::Error> {
    if bytes.len() < HEADER_SIZE {
        return Err(too_short(bytes.len()));
    }

    if bytes.len() > MAX_UDP_PAYLOAD {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..MAX_UDP_PAYLOAD], target).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target).await?;
    }

    Ok(())
}

fn too_short(length: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message of {length} bytes is shorter than a DNS header"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_bytes_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut message = vec![0u8; 64];
        message[0] = 0xab;
        message[1] = 0xcd;
        send_tcp_bytes(&mut client, &mut message).await.unwrap();

        let received = read_tcp_bytes(&mut server).await.unwrap();
        assert_eq!(message, received.as_ref());
    }

    #[tokio::test]
    async fn send_tcp_bytes_rejects_short_messages() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut message = vec![0u8; HEADER_SIZE - 1];

        let error = send_tcp_bytes(&mut client, &mut message).await.unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, error.kind());
    }

    #[tokio::test]
    async fn read_tcp_bytes_reports_a_closed_stream_with_the_id() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // announce 100 bytes, deliver 4, then close
        client.write_all(&100u16.to_be_bytes()).await.unwrap();
        client.write_all(&[0x12, 0x34, 0x00, 0x00]).await.unwrap();
        drop(client);

        match read_tcp_bytes(&mut server).await {
            Err(TcpError::TooShort {
                id,
                expected,
                actual,
            }) => {
                assert_eq!(Some(0x1234), id);
                assert_eq!(100, expected);
                assert_eq!(4, actual);
            }
            other => panic!("expected TooShort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn udp_responses_over_the_datagram_limit_are_truncated() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client_addr = client.local_addr().unwrap();

        let mut oversized = vec![0u8; 700];
        send_udp_bytes_to(&server, client_addr, &mut oversized)
            .await
            .unwrap();
        assert_eq!(0b0000_0010, oversized[2] & 0b0000_0010);

        let mut buf = vec![0u8; 4096];
        let (received, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(server_addr, from);
        assert_eq!(MAX_UDP_PAYLOAD, received);
        assert_eq!(0b0000_0010, buf[2] & 0b0000_0010);
    }
}
