//! Per-identity address statistics derived from the accumulated access log.

use crate::identity::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

/// Connections seen from one source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressActivity {
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Addresses observed for one identity in the current log window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityActivity {
    pub identity: Identity,
    pub addresses: HashMap<IpAddr, AddressActivity>,
}

impl IdentityActivity {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            addresses: HashMap::new(),
        }
    }

    /// Record one connection.
    pub fn record(&mut self, address: IpAddr, seen_at: DateTime<Utc>) {
        let entry = self.addresses.entry(address).or_insert(AddressActivity {
            count: 0,
            last_seen: seen_at,
        });
        entry.count += 1;
        if seen_at > entry.last_seen {
            entry.last_seen = seen_at;
        }
    }

    pub fn distinct_addresses(&self) -> usize {
        self.addresses.len()
    }

    pub fn exceeds(&self, max_addresses: usize) -> bool {
        self.distinct_addresses() > max_addresses
    }

    /// Observed addresses in a stable order.
    pub fn address_list(&self) -> Vec<IpAddr> {
        let mut list: Vec<IpAddr> = self.addresses.keys().copied().collect();
        list.sort();
        list
    }
}

/// Activity for every identity seen in the log window.
pub type ActivitySnapshot = HashMap<Identity, IdentityActivity>;

/// Identities above the address limit, sorted.
pub fn suspicious_identities(snapshot: &ActivitySnapshot, max_addresses: usize) -> Vec<Identity> {
    select(snapshot, |a| a.exceeds(max_addresses))
}

/// Identities within the address limit, sorted.
pub fn normal_identities(snapshot: &ActivitySnapshot, max_addresses: usize) -> Vec<Identity> {
    select(snapshot, |a| !a.exceeds(max_addresses))
}

fn select(snapshot: &ActivitySnapshot, pred: impl Fn(&IdentityActivity) -> bool) -> Vec<Identity> {
    let mut ids: Vec<Identity> = snapshot
        .values()
        .filter(|a| pred(a))
        .map(|a| a.identity.clone())
        .collect();
    ids.sort();
    ids
}

/// Error from an activity source.
#[derive(Debug)]
pub enum ActivityError {
    /// The accumulated log could not be read.
    Io(std::io::Error),
    /// The accumulated log is not valid text.
    Parse(String),
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Io(e) => write!(f, "IO error: {}", e),
            ActivityError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<std::io::Error> for ActivityError {
    fn from(e: std::io::Error) -> Self {
        ActivityError::Io(e)
    }
}

/// Source of per-identity activity, rebuilt on every call.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn analyze(&self) -> Result<ActivitySnapshot, ActivityError>;
}

/// Analyzer over the accumulated access log.
pub struct LogAnalyzer {
    path: PathBuf,
}

impl LogAnalyzer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ActivitySource for LogAnalyzer {
    async fn analyze(&self) -> Result<ActivitySnapshot, ActivityError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let content = String::from_utf8(bytes)
            .map_err(|e| ActivityError::Parse(format!("{}: {}", self.path.display(), e)))?;

        let snapshot = parse_log(&content);
        debug!(
            path = %self.path.display(),
            identities = snapshot.len(),
            "Accumulated log analyzed"
        );
        Ok(snapshot)
    }
}

/// One accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub address: IpAddr,
    pub identity: Identity,
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?) from (?:tcp:|udp:)?(\[[0-9A-Fa-f:.]+\]|[0-9.]+):\d+ accepted .*?email: (\S+)",
        )
        .unwrap()
    })
}

/// Parse the leading timestamp of an access log line (local time).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let format = if text.contains('.') {
        "%Y/%m/%d %H:%M:%S%.f"
    } else {
        "%Y/%m/%d %H:%M:%S"
    };
    let naive = NaiveDateTime::parse_from_str(text, format).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse an accepted-connection line. Other lines yield `None`.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let caps = line_regex().captures(line)?;
    let timestamp = parse_timestamp(&caps[1])?;
    let address: IpAddr = caps[2].trim_start_matches('[').trim_end_matches(']').parse().ok()?;

    Some(LogEntry {
        timestamp,
        address,
        identity: Identity::from(&caps[3]),
    })
}

/// Build a snapshot from log text. Loopback sources are ignored.
pub fn parse_log(content: &str) -> ActivitySnapshot {
    let mut snapshot = ActivitySnapshot::new();

    for entry in content.lines().filter_map(parse_line) {
        if entry.address.is_loopback() {
            continue;
        }
        snapshot
            .entry(entry.identity.clone())
            .or_insert_with(|| IdentityActivity::new(entry.identity))
            .record(entry.address, entry.timestamp);
    }

    snapshot
}
