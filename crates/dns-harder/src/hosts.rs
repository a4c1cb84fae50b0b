use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;

use hickory_proto::rr::RecordType;
use serde::Deserialize;
use tokio::fs::read_to_string;

/// Static answers keyed by record type and name pattern, loaded from a JSON
/// file of the shape:
///
/// ```json
/// {
///   "A":    { "*.lan.": ["10.0.0.1", "10.0.0.2"] },
///   "AAAA": { "printer.lan.": ["fd00::10"] }
/// }
/// ```
///
/// Only A and AAAA lookups consult this map.  Patterns are globs (`*` is any
/// substring, `?` any single character); the values of the first matching
/// pattern become the answer, one record per value, in file order.
///
/// A reload builds a fresh map and swaps it in whole, so iteration order is
/// stable between reloads but unspecified across them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct HostsOverrides {
    overrides: HashMap<String, HashMap<String, Vec<String>>>,
}

impl HostsOverrides {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        match read_to_string(path).await {
            Ok(data) => Self::deserialise(&data),
            Err(error) => Err(Error::Io { error }),
        }
    }

    pub fn deserialise(data: &str) -> Result<Self, Error> {
        serde_json::from_str(data).map_err(|error| Error::Parse { error })
    }

    /// The values of the first pattern matching `qname`, if any.  Ties
    /// between patterns matching the same name are broken by map order.
    pub fn lookup(&self, qtype: RecordType, qname: &str) -> Option<&[String]> {
        let patterns = self.overrides.get(&qtype.to_string())?;
        for (pattern, values) in patterns {
            if wildcard_match(pattern, qname) {
                return Some(values);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.values().all(HashMap::is_empty)
    }
}

/// An error that can occur when loading a hosts overrides file.
#[derive(Debug)]
pub enum Error {
    Io { error: io::Error },
    Parse { error: serde_json::Error },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io { error } => write!(f, "could not read hosts file: {error}"),
            Error::Parse { error } => write!(f, "could not parse hosts file: {error}"),
        }
    }
}

impl std::error::Error for Error {}

/// Glob matching over names: `*` matches any substring (including the empty
/// one), `?` matches exactly one character, anything else matches itself.
/// Comparison is ASCII-case-insensitive, like name comparison elsewhere in
/// DNS.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.as_bytes();
    let name = name.as_bytes();

    let mut p = 0;
    let mut n = 0;
    // position to resume from when a literal run after a `*` stops matching
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p].eq_ignore_ascii_case(&name[n])) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
