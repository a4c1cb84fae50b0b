use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use rand::Rng;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::{Config, Transport};
use crate::net::{read_tcp_bytes, send_tcp_bytes};

/// Responses can be larger than the classic 512 bytes when EDNS is in play,
/// so always leave room.
const MIN_RECV_BUFFER: usize = 4096;

/// One synchronous question/answer exchange with a single upstream.
///
/// The per-upstream probes are written against this trait so their retry and
/// escalation behaviour can be exercised without a network.
#[async_trait]
pub trait Exchanger {
    async fn exchange(
        &self,
        upstream: &str,
        question: &Query,
        recursion_desired: bool,
        transport: Transport,
    ) -> Result<Reply, ExchangeError>;
}

/// A successful exchange: the upstream's message and how long it took.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message: Message,
    pub rtt: Duration,
}

/// A failed exchange, with however much time was spent on it.
#[derive(Debug)]
pub struct ExchangeError {
    pub kind: ExchangeErrorKind,
    pub rtt: Duration,
}

#[derive(Debug)]
pub enum ExchangeErrorKind {
    /// A dial, read, or write ran out the corresponding timeout.
    Timeout { stage: &'static str },
    Io { stage: &'static str, error: io::Error },
    /// The query could not be serialised, or the reply not deserialised.
    Codec { error: ProtoError },
    /// The reply's id did not match the query's.
    IdMismatch { sent: u16, got: u16 },
    /// The reply did not have the response bit set.
    NotAResponse,
    /// The upstream string has no usable host part for TLS verification.
    BadServerName { upstream: String },
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ExchangeErrorKind::Timeout { stage } => write!(f, "{stage} timed out"),
            ExchangeErrorKind::Io { stage, error } => write!(f, "{stage}: {error}"),
            ExchangeErrorKind::Codec { error } => write!(f, "codec: {error}"),
            ExchangeErrorKind::IdMismatch { sent, got } => {
                write!(f, "id mismatch: sent {sent}, got {got}")
            }
            ExchangeErrorKind::NotAResponse => write!(f, "reply is not a response"),
            ExchangeErrorKind::BadServerName { upstream } => {
                write!(f, "no usable TLS server name in '{upstream}'")
            }
        }
    }
}

impl std::error::Error for ExchangeError {}

fn fail(started: Instant, kind: ExchangeErrorKind) -> ExchangeError {
    ExchangeError {
        kind,
        rtt: started.elapsed(),
    }
}

/// Build a query for one question: fresh random id, recursion-desired as
/// asked, and an EDNS(0) OPT advertising the payload size when configured.
pub(crate) fn build_query(question: &Query, recursion_desired: bool, edns0: Option<u16>) -> Message {
    let mut query = Message::new();
    query
        .set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(recursion_desired);
    query.add_query(question.clone());

    if let Some(payload_size) = edns0 {
        let mut edns = Edns::new();
        edns.set_max_payload(payload_size);
        edns.set_version(0);
        query.set_edns(edns);
    }

    query
}

/// The real exchanger: UDP, TCP, or TCP-TLS to an upstream `host:port`, with
/// separate dial, read, and write timeouts.
pub struct DnsClient {
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    edns0: Option<u16>,
    tls: TlsConnector,
}

impl DnsClient {
    pub fn new(config: &Config) -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        DnsClient {
            dial_timeout: config.dial_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            edns0: config.edns0,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    async fn exchange_udp(
        &self,
        upstream: &str,
        bytes: &[u8],
        started: Instant,
    ) -> Result<Vec<u8>, ExchangeError> {
        let socket = timeout(self.dial_timeout, async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(upstream).await?;
            Ok::<UdpSocket, io::Error>(socket)
        })
        .await
        .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "dial" }))?
        .map_err(|error| fail(started, ExchangeErrorKind::Io { stage: "dial", error }))?;

        timeout(self.write_timeout, socket.send(bytes))
            .await
            .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "write" }))?
            .map_err(|error| fail(started, ExchangeErrorKind::Io { stage: "write", error }))?;

        let mut buf = vec![0u8; usize::max(MIN_RECV_BUFFER, self.edns0.map_or(0, usize::from))];
        let received = timeout(self.read_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "read" }))?
            .map_err(|error| fail(started, ExchangeErrorKind::Io { stage: "read", error }))?;
        buf.truncate(received);

        Ok(buf)
    }

    async fn exchange_tcp(
        &self,
        upstream: &str,
        bytes: &[u8],
        started: Instant,
    ) -> Result<Vec<u8>, ExchangeError> {
        let mut stream = timeout(self.dial_timeout, TcpStream::connect(upstream))
            .await
            .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "dial" }))?
            .map_err(|error| fail(started, ExchangeErrorKind::Io { stage: "dial", error }))?;

        self.tcp_roundtrip(&mut stream, bytes, started).await
    }

    async fn exchange_tcp_tls(
        &self,
        upstream: &str,
        bytes: &[u8],
        started: Instant,
    ) -> Result<Vec<u8>, ExchangeError> {
        let host = upstream.rsplit_once(':').map_or(upstream, |(host, _)| host);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            fail(
                started,
                ExchangeErrorKind::BadServerName {
                    upstream: upstream.to_string(),
                },
            )
        })?;

        let mut stream = timeout(self.dial_timeout, async {
            let tcp = TcpStream::connect(upstream).await?;
            self.tls.connect(server_name, tcp).await
        })
        .await
        .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "dial" }))?
        .map_err(|error| fail(started, ExchangeErrorKind::Io { stage: "dial", error }))?;

        self.tcp_roundtrip(&mut stream, bytes, started).await
    }

    async fn tcp_roundtrip<S>(
        &self,
        stream: &mut S,
        bytes: &[u8],
        started: Instant,
    ) -> Result<Vec<u8>, ExchangeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut out = bytes.to_vec();
        timeout(self.write_timeout, send_tcp_bytes(stream, &mut out))
            .await
            .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "write" }))?
            .map_err(|error| fail(started, ExchangeErrorKind::Io { stage: "write", error }))?;

        let received = timeout(self.read_timeout, read_tcp_bytes(stream))
            .await
            .map_err(|_| fail(started, ExchangeErrorKind::Timeout { stage: "read" }))?
            .map_err(|error| {
                fail(
                    started,
                    ExchangeErrorKind::Io {
                        stage: "read",
                        error: error.into(),
                    },
                )
            })?;

        Ok(received.to_vec())
    }
}

#[async_trait]
impl Exchanger for DnsClient {
    async fn exchange(
        &self,
        upstream: &str,
        question: &Query,
        recursion_desired: bool,
        transport: Transport,
    ) -> Result<Reply, ExchangeError> {
        let started = Instant::now();

        let query = build_query(question, recursion_desired, self.edns0);
        let bytes = query
            .to_vec()
            .map_err(|error| fail(started, ExchangeErrorKind::Codec { error }))?;

        let raw = match transport {
            Transport::Udp => self.exchange_udp(upstream, &bytes, started).await?,
            Transport::Tcp => self.exchange_tcp(upstream, &bytes, started).await?,
            Transport::TcpTls => self.exchange_tcp_tls(upstream, &bytes, started).await?,
        };

        let message = Message::from_vec(&raw)
            .map_err(|error| fail(started, ExchangeErrorKind::Codec { error }))?;

        if message.id() != query.id() {
            return Err(fail(
                started,
                ExchangeErrorKind::IdMismatch {
                    sent: query.id(),
                    got: message.id(),
                },
            ));
        }
        if message.message_type() != MessageType::Response {
            return Err(fail(started, ExchangeErrorKind::NotAResponse));
        }

        Ok(Reply {
            message,
            rtt: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use hickory_proto::rr::{Name, RecordType};

    use super::*;

    fn question() -> Query {
        Query::query(Name::from_str("www.example.com.").unwrap(), RecordType::A)
    }

    #[test]
    fn queries_carry_the_question_and_recursion_bit() {
        let query = build_query(&question(), true, None);

        assert_eq!(MessageType::Query, query.message_type());
        assert_eq!(OpCode::Query, query.op_code());
        assert!(query.recursion_desired());
        assert_eq!(&[question()][..], query.queries());
        assert!(query.edns().is_none());
    }

    #[test]
    fn recursion_bit_follows_the_caller() {
        assert!(!build_query(&question(), false, None).recursion_desired());
    }

    #[test]
    fn edns_advertises_the_configured_payload_size() {
        let query = build_query(&question(), true, Some(1232));

        let edns = query.edns().expect("EDNS should be attached");
        assert_eq!(1232, edns.max_payload());
        assert_eq!(0, edns.version());
    }

    #[test]
    fn query_ids_vary() {
        let ids: std::collections::HashSet<u16> = (0..32)
            .map(|_| build_query(&question(), true, None).id())
            .collect();
        assert!(ids.len() > 1);
    }
}
