use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::client::Exchanger;
use crate::config::{Config, Transport};
use crate::events::{Event, EventCounter};
use crate::qlog::{Kind, QueryLog};

/// One upstream's retry loop for one request.
///
/// A probe makes at most `tries` exchanges.  Replies with answers, and
/// negative replies carrying authority records, are published as they are;
/// everything else is retried:
///
/// - a truncated reply means the answer was real but did not fit the
///   datagram, so the retry goes out over TCP immediately (RFC 1123
///   §6.1.3.2) and the escalation sticks;
/// - an error waits out the inter-try delay first, smoothing transient
///   loss, and escalates UDP to TCP for the next try;
/// - a reply with no answers and no authority is treated like an error.
///
/// A probe publishes exactly once - `Some` reply or, on giving up, `None` -
/// unless it observes cancellation, in which case it publishes nothing.
pub(crate) struct Probe<E> {
    pub client: Arc<E>,
    pub config: Arc<Config>,
    pub events: Arc<EventCounter>,
    pub log: Arc<QueryLog>,
    pub id: Arc<str>,
    pub question: Query,
    pub recursion_desired: bool,
    pub upstream: String,
}

impl<E: Exchanger + Send + Sync + 'static> Probe<E> {
    pub(crate) async fn run(
        self,
        start_delay: Duration,
        cancel: CancellationToken,
        results: mpsc::Sender<Option<Message>>,
    ) {
        if !start_delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep(start_delay) => {}
            }
        }

        let mut transport = self.config.net_mode;
        let mut tried: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let outcome = self
                .client
                .exchange(&self.upstream, &self.question, self.recursion_desired, transport)
                .await;

            // the exchange ran to completion, but a sibling may have won in
            // the meantime - never publish after cancellation
            if cancel.is_cancelled() {
                return;
            }

            match outcome {
                Ok(reply) if reply.message.truncated() => {
                    self.events.increment(&self.upstream, Event::Trunc);
                    self.emit(
                        Kind::Trunc,
                        &[&self.upstream, &format!("{:?}", reply.rtt), &tried.to_string()],
                    );

                    transport = Transport::Tcp;
                    tried += 1;
                    if tried >= self.config.tries {
                        let _ = results.send(None).await;
                        return;
                    }
                    self.emit(Kind::Retry, &[&transport.to_string(), &tried.to_string()]);
                }
                Ok(reply) if reply.message.answers().is_empty() => {
                    if reply.message.name_servers().is_empty() {
                        // nothing in it at all: unhelpful, retry
                        self.emit(
                            Kind::Empty,
                            &[&self.upstream, &format!("{:?}", reply.rtt), &tried.to_string()],
                        );
                        if !self.next_try(&mut transport, &mut tried, &cancel, &results).await {
                            return;
                        }
                    } else {
                        // a negative answer with authority (NXDOMAIN/NODATA
                        // delegation) is an answer - pass it through
                        self.emit(
                            Kind::EmptyNs,
                            &[&self.upstream, &format!("{:?}", reply.rtt), &tried.to_string()],
                        );
                        let _ = results.send(Some(reply.message)).await;
                        return;
                    }
                }
                Ok(reply) => {
                    self.events.increment(&self.upstream, Event::Got);
                    self.emit(
                        Kind::Got,
                        &[&self.upstream, &format!("{:?}", reply.rtt), &tried.to_string()],
                    );
                    let _ = results.send(Some(reply.message)).await;
                    return;
                }
                Err(error) => {
                    self.events.increment(&self.upstream, Event::Error);
                    self.emit(
                        Kind::Error,
                        &[&self.upstream, &format!("{error} {:?}", error.rtt)],
                    );
                    if !self.next_try(&mut transport, &mut tried, &cancel, &results).await {
                        return;
                    }
                }
            }
        }
    }

    /// The delayed path between tries: count the try, sleep, escalate UDP to
    /// TCP.  Returns false when the probe is done, either because it
    /// exhausted its tries (after publishing `None`) or because it was
    /// cancelled mid-sleep (publishing nothing).
    async fn next_try(
        &self,
        transport: &mut Transport,
        tried: &mut u32,
        cancel: &CancellationToken,
        results: &mpsc::Sender<Option<Message>>,
    ) -> bool {
        *tried += 1;
        if *tried >= self.config.tries {
            let _ = results.send(None).await;
            return false;
        }

        tokio::select! {
            () = cancel.cancelled() => return false,
            () = sleep(self.config.delay) => {}
        }

        if *transport == Transport::Udp {
            *transport = Transport::Tcp;
        }
        self.emit(Kind::Retry, &[&transport.to_string(), &tried.to_string()]);
        true
    }

    fn emit(&self, kind: Kind, parts: &[&str]) {
        self.log.log(&self.id, kind, &self.question, parts);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use hickory_proto::op::Message;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::test_util::*;

    async fn run_probe(
        mock: MockExchanger,
        config: Config,
        upstream: &str,
    ) -> (Arc<MockExchanger>, Arc<EventCounter>, Option<Option<Message>>) {
        let client = Arc::new(mock);
        let events = Arc::new(EventCounter::new([upstream]));
        let probe = Probe {
            client: Arc::clone(&client),
            config: Arc::new(config),
            events: Arc::clone(&events),
            log: discard_log(),
            id: Arc::from("test-request"),
            question: question("www.example.com.", hickory_proto::rr::RecordType::A),
            recursion_desired: true,
            upstream: upstream.to_string(),
        };

        let (results, mut rx) = mpsc::channel(1);
        probe
            .run(Duration::ZERO, CancellationToken::new(), results)
            .await;

        (client, events, rx.try_recv().ok())
    }

    #[tokio::test(start_paused = true)]
    async fn truncation_retries_over_tcp_without_sleeping() {
        let upstream = "10.0.0.1:53";
        let mock = MockExchanger::new().script(
            upstream,
            vec![
                MockOutcome::reply(truncated_message()),
                MockOutcome::reply(truncated_message()),
                MockOutcome::reply(answer_message("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))),
            ],
        );
        let config = Config {
            // a sleep would stall the paused clock by ten minutes
            delay: Duration::from_secs(600),
            ..Config::default()
        };

        let started = Instant::now();
        let (client, events, published) = run_probe(mock, config, upstream).await;

        assert_eq!(Duration::ZERO, started.elapsed());
        assert_eq!(
            vec![Transport::Udp, Transport::Tcp, Transport::Tcp],
            client.transports_used(upstream)
        );
        assert_eq!(2, events.tally(upstream).trunc);
        assert_eq!(1, events.tally(upstream).got);
        assert!(matches!(published, Some(Some(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_sleep_out_the_delay_then_escalate() {
        let upstream = "10.0.0.1:53";
        let mock = MockExchanger::new().script(
            upstream,
            vec![
                MockOutcome::fail(),
                MockOutcome::reply(answer_message("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))),
            ],
        );
        let config = Config {
            delay: Duration::from_millis(250),
            ..Config::default()
        };

        let started = Instant::now();
        let (client, events, published) = run_probe(mock, config, upstream).await;

        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(
            vec![Transport::Udp, Transport::Tcp],
            client.transports_used(upstream)
        );
        assert_eq!(1, events.tally(upstream).error);
        assert!(matches!(published, Some(Some(_))));
    }

    #[tokio::test]
    async fn negative_answers_with_authority_are_final() {
        let upstream = "10.0.0.1:53";
        let mock = MockExchanger::new().script(
            upstream,
            vec![MockOutcome::reply(emptyns_message("www.example.com."))],
        );

        let (client, events, published) = run_probe(mock, Config::default(), upstream).await;

        assert_eq!(1, client.calls_to(upstream));
        assert_eq!(0, events.tally(upstream).got);
        match published {
            Some(Some(message)) => assert_eq!(1, message.name_servers().len()),
            other => panic!("expected a published reply, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_answers_without_authority_are_retried() {
        let upstream = "10.0.0.1:53";
        let mock = MockExchanger::new().script(
            upstream,
            vec![
                MockOutcome::reply(empty_message()),
                MockOutcome::reply(answer_message("www.example.com.", Ipv4Addr::new(1, 2, 3, 4))),
            ],
        );

        let (client, _, published) = run_probe(mock, Config::default(), upstream).await;

        assert_eq!(2, client.calls_to(upstream));
        assert!(matches!(published, Some(Some(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_probes_publish_none() {
        let upstream = "10.0.0.1:53";
        let mock = MockExchanger::new().script(
            upstream,
            vec![MockOutcome::fail(), MockOutcome::fail(), MockOutcome::fail()],
        );

        let (client, events, published) = run_probe(mock, Config::default(), upstream).await;

        assert_eq!(3, client.calls_to(upstream));
        assert_eq!(3, events.tally(upstream).error);
        assert_eq!(Some(None), published);
    }

    #[tokio::test]
    async fn a_single_try_means_no_retry() {
        let upstream = "10.0.0.1:53";
        let mock = MockExchanger::new().script(upstream, vec![MockOutcome::fail()]);
        let config = Config {
            tries: 1,
            ..Config::default()
        };

        let (client, _, published) = run_probe(mock, config, upstream).await;

        assert_eq!(1, client.calls_to(upstream));
        assert_eq!(Some(None), published);
    }

    #[tokio::test]
    async fn cancellation_during_the_start_delay_prevents_any_exchange() {
        let upstream = "10.0.0.1:53";
        let client = Arc::new(MockExchanger::new().script(
            upstream,
            vec![MockOutcome::reply(answer_message("www.example.com.", Ipv4Addr::new(1, 2, 3, 4)))],
        ));
        let probe = Probe {
            client: Arc::clone(&client),
            config: Arc::new(Config::default()),
            events: Arc::new(EventCounter::new([upstream])),
            log: discard_log(),
            id: Arc::from("test-request"),
            question: question("www.example.com.", hickory_proto::rr::RecordType::A),
            recursion_desired: true,
            upstream: upstream.to_string(),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (results, mut rx) = mpsc::channel(1);
        probe.run(Duration::from_millis(50), cancel, results).await;

        assert_eq!(0, client.calls_to(upstream));
        assert!(rx.try_recv().is_err());
    }
}
