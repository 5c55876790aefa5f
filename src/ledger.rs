//! Durable ban ledger with lazy and periodic expiry.
//!
//! The in-memory map is authoritative. Every mutation rewrites the JSON file
//! while the write lock is still held; a failed write is reported but never
//! rolls the mutation back.

use crate::identity::Identity;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// A single ban.
///
/// Also reads the legacy `ip_bans.json` layout (`email`, `ip_addresses`,
/// zero-time expiry for unlimited bans).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    #[serde(alias = "email")]
    pub identity: Identity,
    pub banned_at: DateTime<Utc>,
    /// `None` means the ban never expires.
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
    /// Source addresses that triggered the ban.
    #[serde(default, alias = "ip_addresses", deserialize_with = "deserialize_addresses")]
    pub addresses: Vec<IpAddr>,
}

/// Years before this mark a zero-value timestamp, meaning no expiry.
const ZERO_TIME_YEAR: i32 = 1970;

fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let expiry = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(expiry.filter(|t| t.year() >= ZERO_TIME_YEAR))
}

fn deserialize_addresses<'de, D>(deserializer: D) -> Result<Vec<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<IpAddr>>::deserialize(deserializer)?.unwrap_or_default())
}

impl BanRecord {
    /// Check if this ban has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }

    pub fn is_unlimited(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// Result of an unban request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnbanOutcome {
    Removed(BanRecord),
    NotBanned,
}

/// Ledger summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub expiring_within_hour: usize,
    pub ban_duration_minutes: i64,
    pub is_unlimited: bool,
}

/// Error from the ban ledger.
///
/// Returned by mutations only after the in-memory state was updated, so the
/// change is in effect even though it was not written out.
#[derive(Debug)]
pub enum LedgerError {
    /// Reading, writing or renaming the ledger file failed.
    Io(std::io::Error),
    /// The ledger could not be encoded.
    Serialize(serde_json::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Io(e) => write!(f, "ledger IO error: {}", e),
            LedgerError::Serialize(e) => write!(f, "ledger encoding error: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Io(e)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialize(e)
    }
}

type Records = HashMap<Identity, BanRecord>;

/// Thread-safe ban ledger mirrored to a JSON file.
pub struct BanLedger {
    path: PathBuf,
    ban_duration: Duration,
    records: RwLock<Records>,
}

impl BanLedger {
    /// Open the ledger at `path`, creating it if needed.
    ///
    /// Fails only when the backing file cannot be opened for writing. A
    /// missing or empty file is an empty ledger; an unreadable one is logged
    /// and replaced by an empty ledger on the next write.
    pub fn open(path: impl Into<PathBuf>, ban_duration: Duration) -> Result<Self, LedgerError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        OpenOptions::new().create(true).append(true).open(&path)?;

        let records = load_records(&path);
        info!(
            path = %path.display(),
            bans = records.len(),
            "Ban ledger loaded"
        );

        Ok(Self {
            path,
            ban_duration,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
    }

    /// Check whether `identity` is banned, evicting a lapsed record.
    pub fn is_banned(&self, identity: &Identity) -> bool {
        self.ban_info_at(identity, Utc::now()).is_some()
    }

    /// Get the active ban for `identity`, evicting a lapsed record.
    pub fn ban_info(&self, identity: &Identity) -> Option<BanRecord> {
        self.ban_info_at(identity, Utc::now())
    }

    fn ban_info_at(&self, identity: &Identity, now: DateTime<Utc>) -> Option<BanRecord> {
        {
            let records = self.read();
            match records.get(identity) {
                None => return None,
                Some(record) if !record.is_expired_at(now) => return Some(record.clone()),
                Some(_) => {}
            }
        }

        let mut records = self.write();
        if self.evict_if_expired(&mut records, identity, now).is_some() {
            self.persist_logged(&records);
        }
        // A concurrent ban may have replaced the record between the two locks.
        records.get(identity).cloned()
    }

    /// Ban `identity`, replacing any existing record.
    ///
    /// Callers check [`is_banned`](Self::is_banned) first so an active ban's
    /// timer is never reset. On a persistence error the record stays in
    /// memory and is still enforced.
    pub fn ban(
        &self,
        identity: &Identity,
        reason: &str,
        addresses: Vec<IpAddr>,
    ) -> Result<BanRecord, LedgerError> {
        let now = Utc::now();
        let expires_at = if self.ban_duration > Duration::zero() {
            let expires_at = now.checked_add_signed(self.ban_duration);
            if expires_at.is_none() {
                warn!(identity = %identity, "Ban duration out of range, banning without expiry");
            }
            expires_at
        } else {
            None
        };

        let record = BanRecord {
            identity: identity.clone(),
            banned_at: now,
            expires_at,
            reason: reason.to_string(),
            addresses,
        };

        let mut records = self.write();
        if let Some(previous) = records.insert(identity.clone(), record.clone()) {
            warn!(
                identity = %identity,
                previous_banned_at = %previous.banned_at,
                "Replacing existing ban record"
            );
        }
        let persisted = self.persist(&records);
        drop(records);

        info!(identity = %identity, "Identity banned");

        persisted.map(|_| record)
    }

    /// Remove the ban for `identity`, if any.
    pub fn unban(&self, identity: &Identity) -> Result<UnbanOutcome, LedgerError> {
        let mut records = self.write();
        match records.remove(identity) {
            Some(record) => {
                let persisted = self.persist(&records);
                drop(records);
                info!(
                    identity = %identity,
                    banned_at = %record.banned_at,
                    reason = %record.reason,
                    "Identity unbanned"
                );
                persisted.map(|_| UnbanOutcome::Removed(record))
            }
            None => {
                warn!(identity = %identity, "Unban requested for identity that is not banned");
                Ok(UnbanOutcome::NotBanned)
            }
        }
    }

    /// Remove every lapsed ban. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.write();
        let lapsed: Vec<Identity> = records
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.identity.clone())
            .collect();

        let removed = lapsed
            .iter()
            .filter(|id| self.evict_if_expired(&mut records, id, now).is_some())
            .count();

        if removed > 0 {
            self.persist_logged(&records);
            info!(removed, "Expired bans cleaned up");
        }

        removed
    }

    /// Remove records whose expiry is more than `retention` in the past.
    ///
    /// A non-positive retention keeps history forever.
    pub fn cleanup_older_than(&self, retention: Duration) -> usize {
        self.cleanup_older_than_at(retention, Utc::now())
    }

    fn cleanup_older_than_at(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        if retention <= Duration::zero() {
            return 0;
        }
        // Nothing can have expired before the earliest representable time.
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };
        let mut records = self.write();
        let before = records.len();

        records.retain(|identity, record| match record.expires_at {
            Some(expires_at) if expires_at < cutoff => {
                debug!(
                    identity = %identity,
                    expired_at = %expires_at,
                    "Dropping old ban record"
                );
                false
            }
            _ => true,
        });

        let removed = before - records.len();
        if removed > 0 {
            self.persist_logged(&records);
            info!(removed, retention_minutes = retention.num_minutes(), "Old ban records removed");
        }

        removed
    }

    /// Identities with a record, expired or not. No eviction.
    pub fn identities(&self) -> HashSet<Identity> {
        self.read().keys().cloned().collect()
    }

    /// Active bans sorted by identity.
    pub fn active_bans(&self) -> Vec<BanRecord> {
        self.cleanup_expired();
        let mut bans: Vec<BanRecord> = self.read().values().cloned().collect();
        bans.sort_by(|a, b| a.identity.cmp(&b.identity));
        bans
    }

    /// Ledger summary after evicting lapsed bans.
    pub fn stats(&self) -> LedgerStats {
        self.cleanup_expired();
        let now = Utc::now();
        let hour_ahead = now + Duration::hours(1);
        let records = self.read();

        LedgerStats {
            total: records.len(),
            expiring_within_hour: records
                .values()
                .filter(|r| matches!(r.expires_at, Some(t) if t < hour_ahead))
                .count(),
            ban_duration_minutes: self.ban_duration.num_minutes(),
            is_unlimited: self.ban_duration <= Duration::zero(),
        }
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared expiry primitive for every read and sweep path.
    fn evict_if_expired(
        &self,
        records: &mut Records,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Option<BanRecord> {
        if !records.get(identity)?.is_expired_at(now) {
            return None;
        }

        let record = records.remove(identity)?;
        info!(
            identity = %identity,
            addresses = ?record.addresses,
            banned_at = %record.banned_at,
            expired_at = ?record.expires_at,
            "Ban expired"
        );
        Some(record)
    }

    fn persist(&self, records: &Records) -> Result<(), LedgerError> {
        let ordered: BTreeMap<&Identity, &BanRecord> = records.iter().collect();
        let data = serde_json::to_vec_pretty(&ordered)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn persist_logged(&self, records: &Records) {
        if let Err(e) = self.persist(records) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist ban ledger");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_records(path: &Path) -> Records {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read ban ledger, starting empty");
            return Records::new();
        }
    };

    if content.trim().is_empty() {
        return Records::new();
    }

    match serde_json::from_str::<HashMap<Identity, BanRecord>>(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed ban ledger, starting empty");
            Records::new()
        }
    }
}
