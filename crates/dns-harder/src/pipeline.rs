use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use uuid::Uuid;

use crate::client::Exchanger;
use crate::harder::harder;
use crate::qlog::Kind;
use crate::{Forwarder, OVERRIDE_TTL};

impl<E: Exchanger + Send + Sync + 'static> Forwarder<E> {
    /// Answer one client request.
    ///
    /// Classification order: unknown opcodes get an empty reply, then the
    /// `localhost.` shortcut, then the hosts overrides, then the upstream
    /// fan-out - with single-label names expanded by the search suffix and
    /// sent to the search pool instead of the primary one.  Whatever
    /// happens, the client gets exactly one well-formed response whose id
    /// and question echo the request.
    pub async fn handle_request(&self, request: &Message) -> Message {
        let id: Arc<str> = Uuid::new_v4().to_string().into();

        let Some(first_question) = request.queries().first() else {
            return finalize(empty_answer(), request);
        };
        if request.queries().len() > 1 {
            // resolvers do not send these in practice; answer the first
            tracing::debug!(
                count = request.queries().len(),
                "multi-question request, processing only the first"
            );
        }
        let mut question = first_question.clone();

        let answer = self.answer_question(&id, &mut question, request).await;

        self.log.log(
            &id,
            Kind::Answer,
            &question,
            &[
                &format!("{:?}", answer.response_code()),
                &format!(
                    "{},{},{}",
                    answer.answers().len(),
                    answer.name_servers().len(),
                    answer.additionals().len()
                ),
            ],
        );

        finalize(answer, request)
    }

    async fn answer_question(
        &self,
        id: &Arc<str>,
        question: &mut Query,
        request: &Message,
    ) -> Message {
        if request.op_code() != OpCode::Query {
            self.log.log(
                id,
                Kind::Unknown,
                question,
                &[&format!("{:?}", request.op_code())],
            );
            return empty_answer();
        }

        let qname = question.name().to_string();

        if qname.eq_ignore_ascii_case("localhost.") {
            self.log.log(id, Kind::Local, question, &[]);
            return localhost_answer(question);
        }

        if matches!(question.query_type(), RecordType::A | RecordType::AAAA) {
            let hosts = { self.hosts.read().await.clone() };
            if let Some(values) = hosts.lookup(question.query_type(), &qname) {
                self.log.log(id, Kind::Hosts, question, &[]);
                return override_answer(question, values);
            }
        }

        // a single-label name has exactly one dot in its dotted form; those
        // get the search suffix and the search pool
        let pool = if qname.matches('.').count() == 1 {
            if let Some(suffix) = &self.search_suffix {
                match question.name().clone().append_domain(suffix) {
                    Ok(expanded) => {
                        question.set_name(expanded);
                    }
                    Err(error) => {
                        tracing::warn!(%qname, %error, "could not append the search suffix");
                    }
                }
            }
            &self.search_upstreams
        } else {
            &self.upstreams
        };

        let recursion_desired = request.recursion_desired();
        self.log.log(
            id,
            Kind::Query,
            question,
            &["recursion", &recursion_desired.to_string()],
        );

        match harder(self, id, question, recursion_desired, pool).await {
            Some(reply) => reply,
            None => {
                let mut answer = empty_answer();
                answer.set_response_code(ResponseCode::ServFail);
                answer
            }
        }
    }
}

/// An answer with no records.  Recursion is what this server does, so it is
/// always available.
fn empty_answer() -> Message {
    let mut message = Message::new();
    message.set_recursion_available(true);
    message
}

/// `localhost.` never goes upstream: A is `127.0.0.1`, AAAA is `::1`, and
/// any other record type has no answer.
fn localhost_answer(question: &Query) -> Message {
    let mut answer = empty_answer();
    match question.query_type() {
        RecordType::A => {
            answer.add_answer(Record::from_rdata(
                question.name().clone(),
                OVERRIDE_TTL,
                RData::A(A::from(Ipv4Addr::LOCALHOST)),
            ));
        }
        RecordType::AAAA => {
            answer.add_answer(Record::from_rdata(
                question.name().clone(),
                OVERRIDE_TTL,
                RData::AAAA(AAAA::from(Ipv6Addr::LOCALHOST)),
            ));
        }
        _ => {}
    }
    answer
}

/// One record per configured value, in file order, at the override TTL.
/// Values that do not parse as an address of the queried type are skipped.
fn override_answer(question: &Query, values: &[String]) -> Message {
    let mut answer = empty_answer();
    for value in values {
        match override_rdata(question.query_type(), value) {
            Some(rdata) => {
                answer.add_answer(Record::from_rdata(
                    question.name().clone(),
                    OVERRIDE_TTL,
                    rdata,
                ));
            }
            None => {
                tracing::warn!(
                    qtype = %question.query_type(),
                    %value,
                    "skipping unparseable hosts override value"
                );
            }
        }
    }
    answer
}

fn override_rdata(qtype: RecordType, value: &str) -> Option<RData> {
    match qtype {
        RecordType::A => value.parse::<Ipv4Addr>().ok().map(|ip| RData::A(A::from(ip))),
        RecordType::AAAA => value
            .parse::<Ipv6Addr>()
            .ok()
            .map(|ip| RData::AAAA(AAAA::from(ip))),
        _ => None,
    }
}

/// Turn an answer into the response for a request: the request's id, opcode,
/// recursion-desired bit, and question section, with the answer's records,
/// rcode, and flags.  An upstream reply may carry a rewritten question; the
/// client always gets its own back.
fn finalize(answer: Message, request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(answer.recursion_available())
        .set_authoritative(answer.authoritative())
        .set_response_code(answer.response_code());

    if let Some(question) = request.queries().first() {
        response.add_query(question.clone());
    }
    for rr in answer.answers() {
        response.add_answer(rr.clone());
    }
    for rr in answer.name_servers() {
        response.add_name_server(rr.clone());
    }
    for rr in answer.additionals() {
        response.add_additional(rr.clone());
    }

    response
}
