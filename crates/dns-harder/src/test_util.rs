//! Builders and a scripted exchanger shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, NS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};

pub(crate) use crate::client::{ExchangeError, ExchangeErrorKind, Exchanger, Reply};
pub(crate) use crate::config::{Config, Transport};
pub(crate) use crate::events::EventCounter;
pub(crate) use crate::hosts::HostsOverrides;
pub(crate) use crate::qlog::QueryLog;
pub(crate) use crate::Forwarder;

pub(crate) fn domain(name: &str) -> Name {
    Name::from_str(name).unwrap()
}

pub(crate) fn question(name: &str, qtype: RecordType) -> Query {
    Query::query(domain(name), qtype)
}

pub(crate) fn a_record(name: &str, address: Ipv4Addr) -> Record {
    Record::from_rdata(domain(name), 300, RData::A(A::from(address)))
}

/// A client request: standard query, recursion desired, fixed id.
pub(crate) fn request(name: &str, qtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(0x1234)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(question(name, qtype));
    message
}

fn response_skeleton() -> Message {
    let mut message = Message::new();
    message
        .set_id(0x4242)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_available(true);
    message
}

pub(crate) fn answer_message(name: &str, address: Ipv4Addr) -> Message {
    let mut message = response_skeleton();
    message.add_answer(a_record(name, address));
    message
}

pub(crate) fn empty_message() -> Message {
    response_skeleton()
}

pub(crate) fn emptyns_message(name: &str) -> Message {
    let mut message = response_skeleton();
    message.add_name_server(Record::from_rdata(
        domain(name),
        300,
        RData::NS(NS(domain("ns1.example.com."))),
    ));
    message
}

pub(crate) fn truncated_message() -> Message {
    let mut message = response_skeleton();
    message.set_truncated(true);
    message
}

pub(crate) fn discard_log() -> Arc<QueryLog> {
    Arc::new(QueryLog::with_sink(Box::new(io::sink())))
}

/// A query log writing into a shared buffer, plus a handle to read it back.
pub(crate) fn capture_log() -> (Arc<QueryLog>, CapturedLog) {
    let buffer = CapturedLog::default();
    let log = Arc::new(QueryLog::with_sink(Box::new(buffer.clone())));
    (log, buffer)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One scripted exchange outcome.
pub(crate) struct MockOutcome {
    delay: Duration,
    result: Result<Message, ()>,
}

impl MockOutcome {
    pub fn reply(message: Message) -> Self {
        MockOutcome {
            delay: Duration::ZERO,
            result: Ok(message),
        }
    }

    pub fn fail() -> Self {
        MockOutcome {
            delay: Duration::ZERO,
            result: Err(()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockCall {
    pub upstream: String,
    pub transport: Transport,
    pub qname: String,
    pub at: Instant,
}

/// An exchanger that replays a per-upstream script and records every call.
/// Upstreams with an exhausted (or missing) script fail their exchanges.
#[derive(Default)]
pub(crate) struct MockExchanger {
    scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockExchanger {
    pub fn new() -> Self {
        MockExchanger::default()
    }

    pub fn script(self, upstream: &str, outcomes: Vec<MockOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(upstream.to_string(), outcomes.into());
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, upstream: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.upstream == upstream)
            .count()
    }

    pub fn transports_used(&self, upstream: &str) -> Vec<Transport> {
        self.calls()
            .iter()
            .filter(|call| call.upstream == upstream)
            .map(|call| call.transport)
            .collect()
    }

    pub fn questions_asked(&self, upstream: &str) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|call| call.upstream == upstream)
            .map(|call| call.qname.clone())
            .collect()
    }
}

#[async_trait]
impl Exchanger for MockExchanger {
    async fn exchange(
        &self,
        upstream: &str,
        question: &Query,
        _recursion_desired: bool,
        transport: Transport,
    ) -> Result<Reply, ExchangeError> {
        self.calls.lock().unwrap().push(MockCall {
            upstream: upstream.to_string(),
            transport,
            qname: question.name().to_string(),
            at: Instant::now(),
        });

        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(upstream)
            .and_then(VecDeque::pop_front);

        let Some(outcome) = outcome else {
            return Err(ExchangeError {
                kind: ExchangeErrorKind::Timeout { stage: "read" },
                rtt: Duration::ZERO,
            });
        };

        if !outcome.delay.is_zero() {
            sleep(outcome.delay).await;
        }

        match outcome.result {
            Ok(message) => Ok(Reply {
                message,
                rtt: outcome.delay,
            }),
            Err(()) => Err(ExchangeError {
                kind: ExchangeErrorKind::Timeout { stage: "read" },
                rtt: outcome.delay,
            }),
        }
    }
}

/// A forwarder over the mock exchanger with no hosts overrides and the given
/// primary pool.
pub(crate) fn forwarder(
    client: MockExchanger,
    config: Config,
    upstreams: &[&str],
) -> Forwarder<MockExchanger> {
    Forwarder {
        config: Arc::new(config),
        client: Arc::new(client),
        upstreams: Arc::new(upstreams.iter().map(ToString::to_string).collect()),
        search_upstreams: Arc::new(Vec::new()),
        search_suffix: None,
        hosts: Arc::new(RwLock::new(Arc::new(HostsOverrides::default()))),
        events: Arc::new(EventCounter::new(upstreams.iter().copied())),
        log: discard_log(),
    }
}
