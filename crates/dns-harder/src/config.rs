use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const CANNOT_PARSE_TRANSPORT: &str = "expected one of 'udp', 'tcp', 'tcp-tls'";

/// How to reach an upstream resolver.
///
/// A probe starts with the configured transport and escalates to TCP when a
/// reply comes back truncated or a try fails, so `Udp` is only ever the
/// starting point.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    TcpTls,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpTls => write!(f, "tcp-tls"),
        }
    }
}

impl FromStr for Transport {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tcp-tls" => Ok(Transport::TcpTls),
            _ => Err(CANNOT_PARSE_TRANSPORT),
        }
    }
}

/// Exchange and retry tunables.  Read-only after bootstrap: every probe of
/// every request sees the same values.
#[derive(Debug, Clone)]
pub struct Config {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Pause between a failed try and the next one.  Truncated replies skip
    /// it and retry at once.
    pub delay: Duration,
    /// Stagger between sibling probes of one fan-out: the probe at shuffle
    /// index `i` waits `i * concurrency_delay` before its first exchange.
    /// Zero starts every probe simultaneously.
    pub concurrency_delay: Duration,
    /// Exchanges attempted per upstream before the probe gives up.
    pub tries: u32,
    /// Transport for the first try against each upstream.
    pub net_mode: Transport,
    /// Advertised EDNS(0) UDP payload size.  `None` leaves EDNS off.
    pub edns0: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dial_timeout: Duration::from_millis(101),
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            delay: Duration::from_millis(10),
            concurrency_delay: Duration::ZERO,
            tries: 3,
            net_mode: Transport::Udp,
            edns0: None,
        }
    }
}
