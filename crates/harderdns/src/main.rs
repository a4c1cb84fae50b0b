use bytes::BytesMut;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::EnvFilter;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Name;

use dns_harder::client::DnsClient;
use dns_harder::config::{Config, Transport};
use dns_harder::events::EventCounter;
use dns_harder::hosts::HostsOverrides;
use dns_harder::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to};
use dns_harder::qlog::QueryLog;
use dns_harder::resolv;
use dns_harder::Forwarder;

mod metrics;
use metrics::*;

type Server = Arc<Forwarder<DnsClient>>;

async fn handle_raw_message(server: Server, buf: &[u8]) -> Option<Message> {
    match Message::from_vec(buf) {
        Ok(msg) => {
            if msg.message_type() == MessageType::Response {
                // Do not respond to response messages: an inbound message
                // could spoof its source address / port to match ours, and
                // so make the server respond to itself, which triggers
                // another response, etc
                None
            } else {
                Some(server.handle_request(&msg).await)
            }
        }
        // If enough of the header arrived to read the id, send a FORMERR
        // carrying it; an attacker spoofing our own address gets at most one
        // reply to a valid-looking query, never a response to a response.
        Err(_) => message_id(buf).map(format_error_response),
    }
}

fn message_id(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

fn format_error_response(id: u16) -> Message {
    let mut response = Message::new();
    response
        .set_id(id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_response_code(ResponseCode::FormErr);
    response
}

async fn listen_tcp_task(server: Server, socket: TcpListener) {
    loop {
        match socket.accept().await {
            Ok((mut stream, peer)) => {
                tracing::debug!(?peer, "TCP request");
                DNS_REQUESTS_TOTAL.with_label_values(&["tcp"]).inc();
                let server = server.clone();
                tokio::spawn(async move {
                    let response_timer = DNS_RESPONSE_TIME_SECONDS
                        .with_label_values(&["tcp"])
                        .start_timer();
                    let response = match read_tcp_bytes(&mut stream).await {
                        Ok(bytes) => handle_raw_message(server, bytes.as_ref()).await,
                        Err(error) => {
                            tracing::debug!(?peer, %error, "TCP read error");
                            error.id().map(format_error_response)
                        }
                    };
                    if let Some(message) = response {
                        match message.to_vec() {
                            Ok(mut serialised) => {
                                DNS_RESPONSES_TOTAL
                                    .with_label_values(&[&format!(
                                        "{:?}",
                                        message.response_code()
                                    )])
                                    .inc();
                                if let Err(error) =
                                    send_tcp_bytes(&mut stream, &mut serialised).await
                                {
                                    tracing::debug!(?peer, %error, "TCP send error");
                                }
                            }
                            Err(error) => {
                                tracing::warn!(?peer, %error, "could not serialise response");
                            }
                        }
                    }
                    response_timer.observe_duration();
                });
            }
            Err(error) => tracing::debug!(%error, "TCP accept error"),
        }
    }
}

async fn listen_udp_task(server: Server, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel(32);
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::debug!(?peer, "UDP request");
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let server = server.clone();
                tokio::spawn(async move {
                    let response_timer = DNS_RESPONSE_TIME_SECONDS
                        .with_label_values(&["udp"])
                        .start_timer();
                    if let Some(response) = handle_raw_message(server, bytes.as_ref()).await {
                        if let Err(error) = reply.send((response, peer, response_timer)).await {
                            tracing::debug!(?peer, %error, "UDP reply channel error");
                        }
                    }
                });
            }

            Some((message, peer, response_timer)) = rx.recv() => {
                match message.to_vec() {
                    Ok(mut serialised) => {
                        DNS_RESPONSES_TOTAL
                            .with_label_values(&[&format!("{:?}", message.response_code())])
                            .inc();
                        if let Err(error) = send_udp_bytes_to(&socket, peer, &mut serialised).await {
                            tracing::debug!(?peer, %error, "UDP send error");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(?peer, %error, "could not serialise response");
                    }
                }
                response_timer.observe_duration();
            }
        }
    }
}

/// Reload the hosts overrides on SIGHUP.  The upstream pools are never
/// re-read; a failed reload keeps the previous overrides.
async fn reload_task(server: Server, hosts_path: PathBuf) {
    let mut stream = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(%error, "could not subscribe to SIGHUP");
            process::exit(1);
        }
    };

    loop {
        stream.recv().await;

        let start = Instant::now();
        match HostsOverrides::from_file(&hosts_path).await {
            Ok(hosts) => {
                let mut lock = server.hosts.write().await;
                *lock = Arc::new(hosts);
                tracing::info!(
                    duration_seconds = %start.elapsed().as_secs_f64(),
                    "SIGHUP hosts reload - success"
                );
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    duration_seconds = %start.elapsed().as_secs_f64(),
                    "SIGHUP hosts reload - failure, keeping previous overrides"
                );
            }
        }
    }
}

/// Periodically write per-upstream outcome counts to the query log, primary
/// pool first, then the search pool.
async fn stats_task(server: Server, interval: Duration) {
    loop {
        sleep(interval).await;
        let tallies = server.events.snapshot();
        server.log.report(
            server.upstreams.iter().chain(server.search_upstreams.iter()),
            &tallies,
        );
    }
}

/// Poll the system resolver for an IPv4 address of `name` every 100ms until
/// it resolves.  Meant as a liveness probe for the server itself.
async fn test_probe(name: &str) {
    let interval = Duration::from_millis(100);
    loop {
        let started = Instant::now();
        match timeout(interval, tokio::net::lookup_host((name, 0u16))).await {
            Ok(Ok(addresses)) => {
                let v4: Vec<_> = addresses
                    .filter(SocketAddr::is_ipv4)
                    .map(|address| address.ip())
                    .collect();
                if v4.is_empty() {
                    tracing::info!(%name, "no IPv4 addresses yet");
                } else {
                    tracing::info!(%name, addresses = ?v4, "resolves");
                    return;
                }
            }
            Ok(Err(error)) => tracing::info!(%name, %error, "lookup failed"),
            Err(_) => tracing::info!(%name, "lookup timed out"),
        }

        let elapsed = started.elapsed();
        if elapsed < interval {
            sleep(interval - elapsed).await;
        }
    }
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        var.split(',').map(ToString::to_string).collect()
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(!log_format.contains("no-ansi"));

    match (
        log_format.contains("json"),
        log_format.contains("no-time"),
    ) {
        (true, true) => logger.json().without_time().init(),
        (true, false) => logger.json().init(),
        (false, true) => logger.compact().without_time().init(),
        (false, false) => logger.compact().init(),
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// A local DNS forwarder that races its upstreams.
///
/// Every query is dispatched to all upstreams in parallel, each with its own
/// retry loop and UDP-to-TCP escalation on truncation, and the first usable
/// answer wins.  This trades redundant upstream traffic for tail latency and
/// robustness against flaky resolvers.
///
/// Short (single-label) names are resolved against the nameservers inherited
/// from the system resolver file, optionally with a search suffix appended.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}/metrics"
#[clap(args_conflicts_with_subcommands = true)]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,

    /// Interface to listen on (in `ip:port` form)
    #[clap(short, long, value_parser, default_value_t = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 53)), env = "HARDERDNS_INTERFACE")]
    interface: SocketAddr,

    /// Interface to listen on (in `ip:port` form) to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, 9420)), env = "HARDERDNS_METRICS_INTERFACE")]
    metrics_interface: SocketAddr,

    /// Upstream connection establishment timeout, in milliseconds
    #[clap(long, value_parser, default_value_t = 101, env = "HARDERDNS_DIAL_TIMEOUT")]
    dial_timeout: u64,

    /// Upstream read timeout, in milliseconds
    #[clap(long, value_parser, default_value_t = 500, env = "HARDERDNS_READ_TIMEOUT")]
    read_timeout: u64,

    /// Upstream write timeout, in milliseconds
    #[clap(long, value_parser, default_value_t = 500, env = "HARDERDNS_WRITE_TIMEOUT")]
    write_timeout: u64,

    /// Pause between retries against one upstream, in milliseconds
    #[clap(long, value_parser, default_value_t = 10, env = "HARDERDNS_DELAY")]
    delay: u64,

    /// Stagger between parallel probes, in milliseconds: the first upstream
    /// is asked immediately, each further one this much later (0 asks all at
    /// once)
    #[clap(long, value_parser, default_value_t = 0, env = "HARDERDNS_CONCURRENCY_DELAY")]
    concurrency_delay: u64,

    /// Exchanges attempted per upstream before its probe gives up
    #[clap(long, value_parser, default_value_t = 3, env = "HARDERDNS_TRIES")]
    tries: u32,

    /// Reserved; parsed but not consulted
    #[clap(long, action(clap::ArgAction::SetTrue))]
    retry: bool,

    /// Transport for the first try against each upstream: one of 'udp',
    /// 'tcp', 'tcp-tls'
    #[clap(long, default_value_t = Transport::Udp, value_parser, env = "HARDERDNS_NET_MODE")]
    net_mode: Transport,

    /// EDNS(0) UDP payload size to advertise; -1 leaves EDNS off
    #[clap(long, value_parser, default_value_t = -1, allow_hyphen_values = true, env = "HARDERDNS_EDNS0")]
    edns0: i64,

    /// Write per-upstream outcome counts to the query log every this many
    /// seconds; -1 disables the report
    #[clap(long, value_parser, default_value_t = -1, allow_hyphen_values = true, env = "HARDERDNS_STATS")]
    stats: i64,

    /// Capture the system resolver file's nameservers as the pool for short
    /// names, then rewrite the file to point at this process
    #[clap(long, action(clap::ArgAction::SetTrue), env = "HARDERDNS_RESOLV")]
    resolv: bool,

    /// Search suffix appended to single-label names before resolution
    #[clap(long, value_parser, default_value = "", env = "HARDERDNS_RESOLV_SEARCH")]
    resolv_search: String,

    /// Use /tmp/resolv.conf (seeded with a placeholder) instead of the real
    /// resolver file
    #[clap(long, action(clap::ArgAction::SetTrue))]
    dev_mode: bool,

    /// Path to a JSON hosts overrides file, reloaded on SIGHUP
    #[clap(long, value_parser, env = "HARDERDNS_HOSTS")]
    hosts: Option<PathBuf>,

    /// Upstream resolvers, in `host:port` form
    #[clap(value_parser)]
    upstreams: Vec<String>,
}

#[derive(Debug, Subcommand, Clone)]
enum Command {
    /// Poll the system resolver until <NAME> resolves to an IPv4 address,
    /// then exit 0
    Test {
        /// Domain name to resolve
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    if let Some(Command::Test { name }) = args.command {
        test_probe(&name).await;
        return;
    }

    if args.upstreams.is_empty() {
        tracing::error!("no upstreams");
        process::exit(1);
    }

    let config = Arc::new(Config {
        dial_timeout: Duration::from_millis(args.dial_timeout),
        read_timeout: Duration::from_millis(args.read_timeout),
        write_timeout: Duration::from_millis(args.write_timeout),
        delay: Duration::from_millis(args.delay),
        concurrency_delay: Duration::from_millis(args.concurrency_delay),
        tries: args.tries,
        net_mode: args.net_mode,
        edns0: u16::try_from(args.edns0).ok(),
    });

    let mut search_upstreams = Vec::new();
    if args.resolv {
        let path = if args.dev_mode {
            let path = PathBuf::from(resolv::DEV_RESOLV_CONF);
            if let Err(error) = resolv::seed_dev_file(&path).await {
                tracing::error!(%error, "could not seed the dev-mode resolver file");
                process::exit(1);
            }
            path
        } else {
            PathBuf::from(resolv::SYSTEM_RESOLV_CONF)
        };

        match resolv::take_over(&path).await {
            Ok(pool) => {
                tracing::info!(?path, upstreams = ?pool, "took over the resolver file");
                search_upstreams = pool;
            }
            Err(error) => {
                tracing::error!(?path, %error, "resolver file takeover failed");
                process::exit(1);
            }
        }
    }

    let search_suffix = if args.resolv_search.is_empty() {
        None
    } else {
        match Name::from_str(&args.resolv_search) {
            Ok(name) => Some(name),
            Err(error) => {
                tracing::error!(suffix = %args.resolv_search, %error, "invalid search suffix");
                process::exit(1);
            }
        }
    };

    let hosts = match &args.hosts {
        Some(path) => match HostsOverrides::from_file(path).await {
            Ok(hosts) => hosts,
            Err(error) => {
                tracing::error!(?path, %error, "could not load hosts overrides");
                process::exit(1);
            }
        },
        None => HostsOverrides::default(),
    };

    let events = Arc::new(EventCounter::new(
        args.upstreams.iter().chain(search_upstreams.iter()).cloned(),
    ));

    let server: Server = Arc::new(Forwarder {
        client: Arc::new(DnsClient::new(&config)),
        config,
        upstreams: Arc::new(args.upstreams.clone()),
        search_upstreams: Arc::new(search_upstreams),
        search_suffix,
        hosts: Arc::new(RwLock::new(Arc::new(hosts))),
        events,
        log: Arc::new(QueryLog::stdout()),
    });

    tracing::info!(interface = %args.interface, "binding DNS UDP socket");
    let udp = match UdpSocket::bind(args.interface).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(%error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.interface, "binding DNS TCP socket");
    let tcp = match TcpListener::bind(args.interface).await {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(%error, "could not bind DNS TCP socket");
            process::exit(1);
        }
    };

    tokio::spawn(listen_udp_task(server.clone(), udp));
    tokio::spawn(listen_tcp_task(server.clone(), tcp));

    if let Some(hosts_path) = args.hosts.clone() {
        tokio::spawn(reload_task(server.clone(), hosts_path));
    }

    if args.stats > 0 {
        tokio::spawn(stats_task(
            server.clone(),
            Duration::from_secs(args.stats.unsigned_abs()),
        ));
    }

    tracing::info!(interface = %args.metrics_interface, net_mode = %server.config.net_mode, "serving");
    if let Err(error) = serve_prometheus_endpoint_task(args.metrics_interface).await {
        tracing::error!(%error, "could not bind HTTP TCP socket");
        process::exit(1);
    }
}
