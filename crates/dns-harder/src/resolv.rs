use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use tokio::fs;

pub const SYSTEM_RESOLV_CONF: &str = "/etc/resolv.conf";
pub const DEV_RESOLV_CONF: &str = "/tmp/resolv.conf";

/// What the resolver file says once this process owns name resolution.
pub const TAKEOVER_CONTENTS: &str = "# managed by harderdns\nnameserver 127.0.0.1\n";

/// Placeholder written to the dev-mode file before the takeover, so the
/// takeover path can be exercised without touching the real resolver file.
const DEV_SEED_CONTENTS: &str = "# dev mode placeholder\nnameserver 192.0.2.1\n";

/// The `nameserver` addresses of a resolver file, in order.  Comment lines
/// (`#` or `;`) and every other directive are ignored.
pub fn nameservers(contents: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut words = line.split_whitespace();
        if words.next() == Some("nameserver") {
            if let Some(address) = words.next() {
                addresses.push(address.to_string());
            }
        }
    }
    addresses
}

/// The upstream pool implied by a resolver file: loopback entries are
/// dropped (after the takeover they would be this process), unparseable
/// entries are dropped, and the DNS port is attached.
pub fn upstream_pool(contents: &str) -> Vec<String> {
    nameservers(contents)
        .into_iter()
        .filter_map(|address| match address.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => None,
            Ok(IpAddr::V4(ip)) => Some(format!("{ip}:53")),
            Ok(IpAddr::V6(ip)) => Some(format!("[{ip}]:53")),
            Err(_) => {
                tracing::warn!(%address, "ignoring unparseable nameserver entry");
                None
            }
        })
        .collect()
}

/// Read the resolver file, capture its upstream pool, then rewrite the file
/// so that everything on this machine resolves through this process.
pub async fn take_over(path: &Path) -> Result<Vec<String>, Error> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|error| Error::Read { error })?;
    let pool = upstream_pool(&contents);

    fs::write(path, TAKEOVER_CONTENTS)
        .await
        .map_err(|error| Error::Write { error })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(|error| Error::Write { error })?;
    }

    Ok(pool)
}

pub async fn seed_dev_file(path: &Path) -> Result<(), Error> {
    fs::write(path, DEV_SEED_CONTENTS)
        .await
        .map_err(|error| Error::Write { error })
}

/// An error that can occur during the resolver file takeover.
#[derive(Debug)]
pub enum Error {
    Read { error: io::Error },
    Write { error: io::Error },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Read { error } => write!(f, "could not read resolver file: {error}"),
            Error::Write { error } => write!(f, "could not rewrite resolver file: {error}"),
        }
    }
}

impl std::error::Error for Error {}
