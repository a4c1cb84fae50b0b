use std::collections::HashMap;
use std::sync::Mutex;

/// An outcome worth counting against an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A reply with answers arrived.
    Got,
    /// The exchange failed: timeout, transport error, or garbage.
    Error,
    /// A reply arrived with the TC bit set.
    Trunc,
}

/// Per-upstream outcome counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub got: u64,
    pub error: u64,
    pub trunc: u64,
}

/// Process-wide tally of probe outcomes, keyed by upstream.
///
/// Probes increment it from every request concurrently; the stats reporter
/// reads it.  One mutex is enough, the critical sections are tiny.
#[derive(Debug, Default)]
pub struct EventCounter {
    tallies: Mutex<HashMap<String, Tally>>,
}

impl EventCounter {
    /// Creates a counter with a zeroed tally for every known upstream, so the
    /// reporter lists each upstream even before its first event.
    pub fn new<I, S>(upstreams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tallies = upstreams
            .into_iter()
            .map(|upstream| (upstream.into(), Tally::default()))
            .collect();
        EventCounter {
            tallies: Mutex::new(tallies),
        }
    }

    pub fn increment(&self, upstream: &str, event: Event) {
        let Ok(mut tallies) = self.tallies.lock() else {
            return;
        };
        if !tallies.contains_key(upstream) {
            tallies.insert(upstream.to_string(), Tally::default());
        }
        if let Some(tally) = tallies.get_mut(upstream) {
            match event {
                Event::Got => tally.got += 1,
                Event::Error => tally.error += 1,
                Event::Trunc => tally.trunc += 1,
            }
        }
    }

    /// A copy of the current tallies, reflecting every increment that
    /// happened before the call.
    pub fn snapshot(&self) -> HashMap<String, Tally> {
        match self.tallies.lock() {
            Ok(tallies) => tallies.clone(),
            Err(_) => HashMap::new(),
        }
    }

    pub fn tally(&self, upstream: &str) -> Tally {
        self.snapshot().get(upstream).copied().unwrap_or_default()
    }
}
