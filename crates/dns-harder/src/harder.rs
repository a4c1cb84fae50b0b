use std::sync::Arc;

use hickory_proto::op::{Message, Query};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::Exchanger;
use crate::probe::Probe;
use crate::Forwarder;

/// Ask every upstream in the pool at once and take the first usable answer.
///
/// The pool is shuffled uniformly per call, one probe is spawned per
/// upstream, and results come back over a channel sized to hold one
/// publication from each probe so no probe ever blocks on it.  With a
/// non-zero `concurrency_delay` the probe at shuffle index `i` holds its
/// first exchange back by `i * concurrency_delay`, trading tail latency for
/// less redundant upstream traffic.
///
/// The first `Some` off the channel wins and the siblings are cancelled;
/// cancellation is cooperative, so a sibling already blocked on an exchange
/// finishes it (bounded by the exchange timeouts) and then exits without
/// publishing.  If every probe publishes `None` there is no answer.
pub async fn harder<E: Exchanger + Send + Sync + 'static>(
    forwarder: &Forwarder<E>,
    id: &Arc<str>,
    question: &Query,
    recursion_desired: bool,
    upstreams: &[String],
) -> Option<Message> {
    if upstreams.is_empty() {
        return None;
    }

    let mut shuffled = upstreams.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());

    let cancel = CancellationToken::new();
    let (results, mut rx) = mpsc::channel(shuffled.len());

    let expected = shuffled.len();
    for (index, upstream) in shuffled.into_iter().enumerate() {
        let probe = Probe {
            client: Arc::clone(&forwarder.client),
            config: Arc::clone(&forwarder.config),
            events: Arc::clone(&forwarder.events),
            log: Arc::clone(&forwarder.log),
            id: Arc::clone(id),
            question: question.clone(),
            recursion_desired,
            upstream,
        };
        let start_delay = forwarder.config.concurrency_delay * index as u32;
        tokio::spawn(probe.run(start_delay, cancel.clone(), results.clone()));
    }
    drop(results);

    let mut received = 0;
    let mut winner = None;
    while let Some(result) = rx.recv().await {
        received += 1;
        if let Some(reply) = result {
            winner = Some(reply);
            break;
        }
        if received == expected {
            break;
        }
    }

    cancel.cancel();
    winner
}
