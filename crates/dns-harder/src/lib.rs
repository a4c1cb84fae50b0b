#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]

pub mod client;
pub mod config;
pub mod events;
pub mod harder;
pub mod hosts;
pub mod net;
pub mod pipeline;
mod probe;
pub mod qlog;
pub mod resolv;

#[cfg(test)]
pub(crate) mod test_util;

use std::sync::Arc;

use hickory_proto::rr::Name;
use tokio::sync::RwLock;

use self::config::Config;
use self::events::EventCounter;
use self::hosts::HostsOverrides;
use self::qlog::QueryLog;

/// TTL attached to localhost and hosts-override answers.
pub const OVERRIDE_TTL: u32 = 3600;

/// Everything a request needs to be answered: the exchange tunables, the
/// upstream pools, the reloadable hosts overrides, and the two process-wide
/// sinks (event counter and query log).
///
/// Constructed once at startup and shared by reference between the listeners.
/// The hosts overrides are the only part that changes afterwards, and a
/// reload replaces the inner pointer wholesale so that in-flight requests
/// keep the snapshot they started with.
pub struct Forwarder<E> {
    pub config: Arc<Config>,
    pub client: Arc<E>,
    /// Primary upstream pool, from the command line.
    pub upstreams: Arc<Vec<String>>,
    /// Pool used for single-label names, captured from the system resolver
    /// file during the takeover.
    pub search_upstreams: Arc<Vec<String>>,
    /// Suffix appended to single-label names before resolution.
    pub search_suffix: Option<Name>,
    pub hosts: Arc<RwLock<Arc<HostsOverrides>>>,
    pub events: Arc<EventCounter>,
    pub log: Arc<QueryLog>,
}

impl<E> Clone for Forwarder<E> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            client: Arc::clone(&self.client),
            upstreams: Arc::clone(&self.upstreams),
            search_upstreams: Arc::clone(&self.search_upstreams),
            search_suffix: self.search_suffix.clone(),
            hosts: Arc::clone(&self.hosts),
            events: Arc::clone(&self.events),
            log: Arc::clone(&self.log),
        }
    }
}
