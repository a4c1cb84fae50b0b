use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

use hickory_proto::op::Query;

use crate::events::Tally;

/// What happened to a request, probe try, or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Answered from the built-in `localhost.` shortcut.
    Local,
    /// Answered from the hosts overrides.
    Hosts,
    /// Dispatched to the upstream fan-out.
    Query,
    /// An upstream produced a usable answer.
    Got,
    /// An upstream produced a reply with no answers and no authority.
    Empty,
    /// An upstream produced a negative answer carrying authority records.
    EmptyNs,
    /// An upstream reply came back truncated.
    Trunc,
    /// An exchange failed.
    Error,
    /// A probe is about to try again.
    Retry,
    /// The request had an opcode this server does not handle.
    Unknown,
    /// The response handed back to the client.
    Answer,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Local => "LOCAL",
            Kind::Hosts => "HOSTS",
            Kind::Query => "QUERY",
            Kind::Got => "GOT",
            Kind::Empty => "EMPTY",
            Kind::EmptyNs => "EMPTYNS",
            Kind::Trunc => "TRUNC",
            Kind::Error => "ERROR",
            Kind::Retry => "RETRY",
            Kind::Unknown => "UNKNOWN",
            Kind::Answer => "ANSWER",
        }
    }
}

/// The query log: one tab-separated line per event, keyed by request id.
///
/// Every line is written under one lock so concurrent requests never
/// interleave within a line, and the stats reporter shares the same lock so
/// its report is not interleaved with event lines either.  This is a
/// machine-readable record of what the server did, distinct from the
/// `tracing` diagnostics.
pub struct QueryLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl QueryLog {
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(io::stdout()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        QueryLog {
            sink: Mutex::new(sink),
        }
    }

    /// Write one event line: `id`, kind, qtype, qname, then any extra parts,
    /// all tab-separated.
    pub fn log(&self, id: &str, kind: Kind, question: &Query, parts: &[&str]) {
        let mut line = format!(
            "{id}\t{}\t{}\t{}",
            kind.as_str(),
            question.query_type(),
            question.name(),
        );
        for part in parts {
            line.push('\t');
            line.push_str(part);
        }
        line.push('\n');

        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        let _ = sink.write_all(line.as_bytes());
    }

    /// Write one line per upstream with its outcome counts, in the given
    /// order, without releasing the lock in between.
    pub fn report<'a, I>(&self, upstreams: I, tallies: &HashMap<String, Tally>)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        for upstream in upstreams {
            let tally = tallies.get(upstream).copied().unwrap_or_default();
            let _ = writeln!(
                sink,
                "upstream\t{upstream}\tgot\t{}\terror\t{}\ttrunc\t{}",
                tally.got, tally.error, tally.trunc,
            );
        }
    }
}
