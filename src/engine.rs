//! Reconciliation engine.
//!
//! Every cycle pulls the gateway roster and the activity snapshot, lets the
//! ban ledger drop lapsed records, then classifies each identity and issues
//! corrective calls so the ledger, the gateway and the firewall agree.
//!
//! Classification, in precedence order:
//!
//! | state      | condition                           | action                                    |
//! |------------|-------------------------------------|-------------------------------------------|
//! | Banned     | ledger holds an unexpired ban       | aggressive reset if still enabled         |
//! | Suspicious | distinct addresses > max            | ban, then aggressive reset                |
//! | Normal     | distinct addresses <= max           | unblock if the ban just lapsed, enable    |
//! | Inactive   | no activity this window             | enable if disabled                        |

use crate::activity::{
    normal_identities, suspicious_identities, ActivityError, ActivitySource, IdentityActivity,
};
use crate::config::Config;
use crate::firewall::AccessController;
use crate::identity::Identity;
use crate::ledger::{BanLedger, LedgerStats};
use crate::panel::{GatewayProxy, PanelError, RemoteIdentity};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Engine tuning, taken from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_addresses: usize,
    pub check_interval: Duration,
    /// Reported in status only. No transition consults it.
    pub grace_period: Duration,
    /// Retention of lapsed ban records.
    pub retention: chrono::Duration,
    /// When false, cycles classify and report but issue no corrective calls.
    pub enforce: bool,
    pub log_banned: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_addresses: config.enforcement.max_addresses,
            check_interval: config.enforcement.check_interval(),
            grace_period: config.enforcement.grace_period(),
            retention: config.bans.retention(),
            enforce: config.settings.enabled,
            log_banned: config.settings.log_banned,
        }
    }
}

/// Per-cycle classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Banned,
    Suspicious,
    Normal,
    Inactive,
}

/// Counters reported at the end of a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub banned: usize,
    pub suspicious: usize,
    pub normal: usize,
    /// Inactive identities that were re-enabled.
    pub enabled_inactive: usize,
    /// Corrective calls that failed and will be retried next cycle.
    pub failed_actions: usize,
}

/// Engine status for external reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub total_identities: usize,
    pub suspicious_count: usize,
    pub normal_count: usize,
    pub max_addresses: usize,
    pub check_interval_seconds: u64,
    pub grace_period_seconds: u64,
    pub bans: LedgerStats,
    /// Set when the activity snapshot could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error that aborts a cycle or a lifecycle call.
#[derive(Debug)]
pub enum EngineError {
    /// `start` was called on a running engine.
    AlreadyRunning,
    /// The gateway roster could not be fetched.
    Roster(PanelError),
    /// The activity snapshot could not be built.
    Activity(ActivityError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::AlreadyRunning => write!(f, "Engine is already running"),
            EngineError::Roster(e) => write!(f, "Failed to fetch identity roster: {}", e),
            EngineError::Activity(e) => write!(f, "Failed to analyze activity: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<PanelError> for EngineError {
    fn from(e: PanelError) -> Self {
        EngineError::Roster(e)
    }
}

impl From<ActivityError> for EngineError {
    fn from(e: ActivityError) -> Self {
        EngineError::Activity(e)
    }
}

/// The reconciliation engine.
pub struct ReconciliationEngine {
    ledger: Arc<BanLedger>,
    activity: Arc<dyn ActivitySource>,
    gateway: Arc<dyn GatewayProxy>,
    firewall: Arc<dyn AccessController>,
    settings: EngineSettings,
    running: AtomicBool,
    /// One cycle at a time, whether ticked or driven directly.
    cycle: Mutex<()>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<BanLedger>,
        activity: Arc<dyn ActivitySource>,
        gateway: Arc<dyn GatewayProxy>,
        firewall: Arc<dyn AccessController>,
        settings: EngineSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ledger,
            activity,
            gateway,
            firewall,
            settings,
            running: AtomicBool::new(false),
            cycle: Mutex::new(()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one full cycle.
    ///
    /// Fails without touching the ledger or any collaborator when the roster
    /// or the activity snapshot cannot be fetched. Per-identity failures are
    /// logged and counted in [`CycleSummary::failed_actions`].
    pub async fn run_cycle(&self) -> Result<CycleSummary, EngineError> {
        let _cycle = self.cycle.lock().await;

        let roster = self.gateway.list_identities().await?;
        let snapshot = self.activity.analyze().await?;

        let banned_at_start = self.ledger.identities();
        let expired = self.ledger.cleanup_expired();
        let purged = self.ledger.cleanup_older_than(self.settings.retention);
        if expired > 0 || purged > 0 {
            debug!(expired, purged, "Ban ledger cleaned up");
        }

        let mut summary = CycleSummary::default();
        let mut seen = HashSet::new();

        for remote in &roster {
            if !seen.insert(remote.identity.clone()) {
                continue;
            }
            let activity = snapshot.get(&remote.identity);
            let lapsed = banned_at_start.contains(&remote.identity);
            self.reconcile(remote, activity, lapsed, &mut summary).await;
        }

        info!(
            identities = seen.len(),
            banned = summary.banned,
            suspicious = summary.suspicious,
            normal = summary.normal,
            enabled_inactive = summary.enabled_inactive,
            failed_actions = summary.failed_actions,
            "Reconciliation cycle complete"
        );

        Ok(summary)
    }

    /// Classify an identity without side effects on collaborators.
    ///
    /// Reading the ledger may still evict a lapsed record.
    pub fn classify(&self, identity: &Identity, activity: Option<&IdentityActivity>) -> Classification {
        if self.ledger.is_banned(identity) {
            return Classification::Banned;
        }
        match activity {
            Some(a) if a.exceeds(self.settings.max_addresses) => Classification::Suspicious,
            Some(_) => Classification::Normal,
            None => Classification::Inactive,
        }
    }

    async fn reconcile(
        &self,
        remote: &RemoteIdentity,
        activity: Option<&IdentityActivity>,
        was_banned: bool,
        summary: &mut CycleSummary,
    ) {
        let identity = &remote.identity;

        match self.classify(identity, activity) {
            Classification::Banned => {
                summary.banned += 1;
                if remote.enabled && self.settings.enforce {
                    debug!(identity = %identity, "Banned identity still enabled");
                    if !self.reset(identity).await {
                        summary.failed_actions += 1;
                    }
                }
            }
            Classification::Suspicious => {
                summary.suspicious += 1;
                // Guarded by classify: no ban exists here.
                if let Some(activity) = activity {
                    if self.settings.enforce && !self.ban(identity, activity).await {
                        summary.failed_actions += 1;
                    }
                }
            }
            Classification::Normal => {
                summary.normal += 1;
                if !self.settings.enforce {
                    return;
                }
                if was_banned {
                    if let Some(activity) = activity {
                        summary.failed_actions += self.unblock_all(identity, activity).await;
                    }
                }
                if !remote.enabled && !self.enable(identity).await {
                    summary.failed_actions += 1;
                }
            }
            Classification::Inactive => {
                if remote.enabled || !self.settings.enforce {
                    return;
                }
                if self.enable(identity).await {
                    summary.enabled_inactive += 1;
                } else {
                    summary.failed_actions += 1;
                }
            }
        }
    }

    /// Create a ban record and sever live sessions. Returns false on failure.
    async fn ban(&self, identity: &Identity, activity: &IdentityActivity) -> bool {
        let count = activity.distinct_addresses();
        let reason = format!(
            "exceeded address limit: {} (max {})",
            count, self.settings.max_addresses
        );

        if let Err(e) = self.ledger.ban(identity, &reason, activity.address_list()) {
            // The ban is held in memory and enforced regardless.
            warn!(identity = %identity, error = %e, "Ban recorded but not persisted");
        }

        if self.settings.log_banned {
            if let Some(record) = self.ledger.ban_info(identity) {
                info!(
                    target: "banned",
                    identity = %record.identity,
                    addresses = ?record.addresses,
                    reason = %record.reason,
                    expires_at = ?record.expires_at,
                    "Identity exceeded address limit"
                );
            }
        }

        self.reset(identity).await
    }

    async fn reset(&self, identity: &Identity) -> bool {
        match self.gateway.aggressive_reset(identity).await {
            Ok(_) => {
                info!(identity = %identity, "Identity access revoked");
                true
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Aggressive reset failed, will retry next cycle");
                false
            }
        }
    }

    async fn enable(&self, identity: &Identity) -> bool {
        match self.gateway.enable(identity).await {
            Ok(()) => {
                info!(identity = %identity, "Identity re-enabled");
                true
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to enable identity, will retry next cycle");
                false
            }
        }
    }

    /// Unblock every observed address independently. Returns the failure count.
    async fn unblock_all(&self, identity: &Identity, activity: &IdentityActivity) -> usize {
        let mut failed = 0;
        for address in activity.address_list() {
            if let Err(e) = self.firewall.unblock(address).await {
                warn!(identity = %identity, address = %address, error = %e, "Failed to unblock address");
                failed += 1;
            }
        }
        if failed == 0 {
            info!(identity = %identity, "Ban lapsed, addresses unblocked");
        }
        failed
    }

    /// Start the periodic cycle. The first cycle runs one interval from now.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut task = self.task.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        self.shutdown.send_replace(false);

        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let every = engine.settings.check_interval;
            info!(
                interval_secs = every.as_secs(),
                max_addresses = engine.settings.max_addresses,
                enforce = engine.settings.enforce,
                "Reconciliation engine started"
            );

            let mut ticks = interval_at(Instant::now() + every, every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if let Err(e) = engine.run_cycle().await {
                            error!(error = %e, "Reconciliation cycle aborted");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Reconciliation engine stopped");
        }));

        Ok(())
    }

    /// Stop the periodic cycle, letting an in-flight cycle finish.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        self.shutdown.send_replace(true);

        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Engine task failed");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Current status, computed from a fresh activity snapshot.
    pub async fn status(&self) -> EngineStatus {
        let mut status = EngineStatus {
            running: self.is_running(),
            total_identities: 0,
            suspicious_count: 0,
            normal_count: 0,
            max_addresses: self.settings.max_addresses,
            check_interval_seconds: self.settings.check_interval.as_secs(),
            grace_period_seconds: self.settings.grace_period.as_secs(),
            bans: self.ledger.stats(),
            error: None,
        };

        match self.activity.analyze().await {
            Ok(snapshot) => {
                status.total_identities = snapshot.len();
                status.suspicious_count =
                    suspicious_identities(&snapshot, self.settings.max_addresses).len();
                status.normal_count = normal_identities(&snapshot, self.settings.max_addresses).len();
            }
            Err(e) => status.error = Some(e.to_string()),
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivitySnapshot;
    use crate::firewall::FirewallError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Enable(String),
        Disable(String),
        Reset(String),
        Block(IpAddr),
        Unblock(IpAddr),
    }

    type CallLog = Arc<StdMutex<Vec<Call>>>;

    struct FakeActivity {
        snapshot: StdMutex<Option<ActivitySnapshot>>,
    }

    #[async_trait]
    impl ActivitySource for FakeActivity {
        async fn analyze(&self) -> Result<ActivitySnapshot, ActivityError> {
            self.snapshot
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ActivityError::Parse("unreadable".to_string()))
        }
    }

    /// Records calls; identities in `failing` make enable and reset fail.
    struct FakeGateway {
        roster: StdMutex<Option<Vec<RemoteIdentity>>>,
        calls: CallLog,
        failing: StdMutex<HashSet<String>>,
    }

    impl FakeGateway {
        fn record(&self, call: Call, identity: &Identity) -> Result<(), PanelError> {
            self.calls.lock().unwrap().push(call);
            if self.failing.lock().unwrap().contains(identity.as_str()) {
                return Err(PanelError::Timeout);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GatewayProxy for FakeGateway {
        async fn list_identities(&self) -> Result<Vec<RemoteIdentity>, PanelError> {
            self.roster
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| PanelError::Rejected("panel down".to_string()))
        }

        async fn enable(&self, identity: &Identity) -> Result<(), PanelError> {
            self.record(Call::Enable(identity.to_string()), identity)
        }

        async fn disable(&self, identity: &Identity) -> Result<(), PanelError> {
            self.record(Call::Disable(identity.to_string()), identity)
        }

        async fn aggressive_reset(&self, identity: &Identity) -> Result<String, PanelError> {
            self.record(Call::Reset(identity.to_string()), identity)?;
            Ok(uuid::Uuid::new_v4().to_string())
        }
    }

    /// Records calls; addresses in `failing` make block and unblock fail.
    struct FakeFirewall {
        calls: CallLog,
        failing: StdMutex<HashSet<IpAddr>>,
    }

    impl FakeFirewall {
        fn record(&self, call: Call, address: IpAddr) -> Result<(), FirewallError> {
            self.calls.lock().unwrap().push(call);
            if self.failing.lock().unwrap().contains(&address) {
                return Err(FirewallError::Command {
                    address,
                    status: Some(1),
                    stderr: "Bad rule".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AccessController for FakeFirewall {
        async fn block(&self, address: IpAddr) -> Result<(), FirewallError> {
            self.record(Call::Block(address), address)
        }

        async fn unblock(&self, address: IpAddr) -> Result<(), FirewallError> {
            self.record(Call::Unblock(address), address)
        }

        fn is_blocked(&self, _address: &IpAddr) -> bool {
            false
        }
    }

    struct Harness {
        _dir: TempDir,
        ledger: Arc<BanLedger>,
        activity: Arc<FakeActivity>,
        gateway: Arc<FakeGateway>,
        firewall: Arc<FakeFirewall>,
        calls: CallLog,
        engine: Arc<ReconciliationEngine>,
    }

    impl Harness {
        fn new(
            roster: Option<Vec<RemoteIdentity>>,
            snapshot: Option<ActivitySnapshot>,
            settings: EngineSettings,
        ) -> Self {
            Self::seeded(roster, snapshot, settings, None)
        }

        /// Harness whose ledger file holds `seed` before it is opened.
        fn seeded(
            roster: Option<Vec<RemoteIdentity>>,
            snapshot: Option<ActivitySnapshot>,
            settings: EngineSettings,
            seed: Option<serde_json::Value>,
        ) -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("bans.json");
            if let Some(seed) = seed {
                std::fs::write(&path, seed.to_string()).unwrap();
            }
            let ledger = Arc::new(BanLedger::open(&path, chrono::Duration::minutes(30)).unwrap());

            let calls: CallLog = Arc::default();
            let activity = Arc::new(FakeActivity {
                snapshot: StdMutex::new(snapshot),
            });
            let gateway = Arc::new(FakeGateway {
                roster: StdMutex::new(roster),
                calls: calls.clone(),
                failing: StdMutex::default(),
            });
            let firewall = Arc::new(FakeFirewall {
                calls: calls.clone(),
                failing: StdMutex::default(),
            });
            let engine = Arc::new(ReconciliationEngine::new(
                ledger.clone(),
                activity.clone(),
                gateway.clone(),
                firewall.clone(),
                settings,
            ));

            Self {
                _dir: dir,
                ledger,
                activity,
                gateway,
                firewall,
                calls,
                engine,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn fail_identity(&self, email: &str) {
            self.gateway.failing.lock().unwrap().insert(email.to_string());
        }

        fn fail_address(&self, address: IpAddr) {
            self.firewall.failing.lock().unwrap().insert(address);
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            max_addresses: 3,
            check_interval: Duration::from_secs(300),
            grace_period: Duration::from_secs(0),
            retention: chrono::Duration::minutes(1440),
            enforce: true,
            log_banned: true,
        }
    }

    fn remote(email: &str, enabled: bool) -> RemoteIdentity {
        RemoteIdentity {
            identity: Identity::from(email),
            enabled,
            credential: format!("cred-{}", email),
        }
    }

    fn addr(n: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, n])
    }

    fn snapshot(entries: &[(&str, u8)]) -> ActivitySnapshot {
        let now = Utc::now();
        let mut snapshot = ActivitySnapshot::new();
        for (email, count) in entries {
            let mut activity = IdentityActivity::new(Identity::from(*email));
            for n in 1..=*count {
                activity.record(addr(n), now);
            }
            snapshot.insert(Identity::from(*email), activity);
        }
        snapshot
    }

    /// Ledger file content holding one ban that lapsed a minute ago.
    fn lapsed_ban(email: &str) -> serde_json::Value {
        let past = Utc::now() - chrono::Duration::minutes(1);
        let record = serde_json::json!({
            "identity": email,
            "banned_at": past - chrono::Duration::minutes(30),
            "expires_at": past,
            "reason": "exceeded address limit: 4 (max 3)",
            "addresses": []
        });
        let mut ledger = serde_json::Map::new();
        ledger.insert(email.to_string(), record);
        serde_json::Value::Object(ledger)
    }

    #[tokio::test]
    async fn test_suspicious_identity_is_banned_and_reset_once() {
        let h = Harness::new(
            Some(vec![remote("user@x", true)]),
            Some(snapshot(&[("user@x", 5)])),
            settings(),
        );

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.suspicious, 1);

        let record = h.ledger.ban_info(&Identity::from("user@x")).unwrap();
        assert!(record.reason.contains('5'));
        assert!(record.reason.contains('3'));
        assert_eq!(record.reason, "exceeded address limit: 5 (max 3)");
        assert_eq!(record.addresses.len(), 5);
        assert_eq!(h.calls(), vec![Call::Reset("user@x".to_string())]);
    }

    #[tokio::test]
    async fn test_expired_ban_removed_by_cleanup() {
        let h = Harness::seeded(
            Some(vec![]),
            Some(ActivitySnapshot::new()),
            settings(),
            Some(lapsed_ban("user@x")),
        );

        assert_eq!(h.ledger.len(), 1);
        assert_eq!(h.ledger.cleanup_expired(), 1);
        assert!(!h.ledger.is_banned(&Identity::from("user@x")));
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_normal_disabled_identity_is_enabled_without_firewall_calls() {
        let h = Harness::new(
            Some(vec![remote("user@y", false)]),
            Some(snapshot(&[("user@y", 2)])),
            settings(),
        );

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.normal, 1);
        assert_eq!(h.calls(), vec![Call::Enable("user@y".to_string())]);
    }

    #[tokio::test]
    async fn test_roster_failure_aborts_cycle() {
        let h = Harness::new(None, Some(snapshot(&[("user@x", 5)])), settings());

        let result = h.engine.run_cycle().await;
        assert!(matches!(result, Err(EngineError::Roster(_))));
        assert!(h.calls().is_empty());
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_activity_failure_aborts_cycle() {
        let h = Harness::new(Some(vec![remote("user@x", false)]), None, settings());

        let result = h.engine.run_cycle().await;
        assert!(matches!(result, Err(EngineError::Activity(_))));
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_banned_enabled_identity_is_reset() {
        let h = Harness::new(
            Some(vec![remote("a@x", true), remote("b@x", false)]),
            Some(snapshot(&[("a@x", 1)])),
            settings(),
        );
        h.ledger.ban(&Identity::from("a@x"), "manual", vec![]).unwrap();
        h.ledger.ban(&Identity::from("b@x"), "manual", vec![]).unwrap();

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.banned, 2);
        assert_eq!(h.calls(), vec![Call::Reset("a@x".to_string())]);
    }

    #[tokio::test]
    async fn test_banned_identity_over_limit_keeps_first_ban() {
        let h = Harness::new(
            Some(vec![remote("a@x", false)]),
            Some(snapshot(&[("a@x", 6)])),
            settings(),
        );
        let first = h.ledger.ban(&Identity::from("a@x"), "manual", vec![]).unwrap();

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.banned, 1);
        assert_eq!(summary.suspicious, 0);

        let record = h.ledger.ban_info(&Identity::from("a@x")).unwrap();
        assert_eq!(record.banned_at, first.banned_at);
        assert_eq!(record.reason, "manual");
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_disabled_identity_is_enabled() {
        let h = Harness::new(
            Some(vec![remote("idle@x", false), remote("on@x", true)]),
            Some(ActivitySnapshot::new()),
            settings(),
        );

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.enabled_inactive, 1);
        assert_eq!(h.calls(), vec![Call::Enable("idle@x".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_ban_and_retries() {
        let h = Harness::new(
            Some(vec![remote("user@x", true)]),
            Some(snapshot(&[("user@x", 5)])),
            settings(),
        );
        h.fail_identity("user@x");

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.failed_actions, 1);
        assert!(h.ledger.is_banned(&Identity::from("user@x")));

        // Still enabled remotely, so the next cycle retries the reset.
        h.clear_calls();
        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.banned, 1);
        assert_eq!(h.calls(), vec![Call::Reset("user@x".to_string())]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_identities() {
        let h = Harness::new(
            Some(vec![
                remote("a@x", false),
                remote("b@x", false),
                remote("c@x", true),
                remote("d@x", true),
            ]),
            Some(snapshot(&[("c@x", 5), ("d@x", 4)])),
            settings(),
        );
        h.fail_identity("a@x");
        h.fail_identity("c@x");

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(
            h.calls(),
            vec![
                Call::Enable("a@x".to_string()),
                Call::Enable("b@x".to_string()),
                Call::Reset("c@x".to_string()),
                Call::Reset("d@x".to_string()),
            ]
        );
        assert_eq!(summary.enabled_inactive, 1);
        assert_eq!(summary.suspicious, 2);
        assert_eq!(summary.failed_actions, 2);
        assert!(h.ledger.is_banned(&Identity::from("c@x")));
        assert!(h.ledger.is_banned(&Identity::from("d@x")));
    }

    #[tokio::test]
    async fn test_lapsed_ban_unblocks_addresses() {
        let h = Harness::seeded(
            Some(vec![remote("user@x", false)]),
            Some(snapshot(&[("user@x", 2)])),
            settings(),
            Some(lapsed_ban("user@x")),
        );

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.normal, 1);
        assert!(h.ledger.is_empty());
        assert_eq!(
            h.calls(),
            vec![
                Call::Unblock(addr(1)),
                Call::Unblock(addr(2)),
                Call::Enable("user@x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_unblock_does_not_stop_other_addresses() {
        let h = Harness::seeded(
            Some(vec![remote("user@x", false), remote("idle@x", false)]),
            Some(snapshot(&[("user@x", 3)])),
            settings(),
            Some(lapsed_ban("user@x")),
        );
        h.fail_address(addr(1));

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(
            h.calls(),
            vec![
                Call::Unblock(addr(1)),
                Call::Unblock(addr(2)),
                Call::Unblock(addr(3)),
                Call::Enable("user@x".to_string()),
                Call::Enable("idle@x".to_string()),
            ]
        );
        assert_eq!(summary.failed_actions, 1);
        assert_eq!(summary.enabled_inactive, 1);
    }

    #[tokio::test]
    async fn test_unpersisted_ban_still_resets() {
        let h = Harness::new(
            Some(vec![remote("user@x", true)]),
            Some(snapshot(&[("user@x", 5)])),
            settings(),
        );
        // A directory in the temp file's place makes every ledger write fail.
        std::fs::create_dir(h.ledger.path().with_extension("json.tmp")).unwrap();

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.suspicious, 1);
        assert_eq!(summary.failed_actions, 0);
        assert!(h.ledger.is_banned(&Identity::from("user@x")));
        assert_eq!(h.calls(), vec![Call::Reset("user@x".to_string())]);
    }

    /// Counts events on the `banned` target.
    struct BannedLines(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BannedLines {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if event.metadata().target() == "banned" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn banned_lines(log_banned: bool) -> usize {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(BannedLines(count.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut config = settings();
        config.log_banned = log_banned;
        let h = Harness::new(
            Some(vec![remote("user@x", true)]),
            Some(snapshot(&[("user@x", 5)])),
            config,
        );
        h.engine.run_cycle().await.unwrap();
        assert!(h.ledger.is_banned(&Identity::from("user@x")));

        count.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_log_banned_controls_detailed_line() {
        assert_eq!(banned_lines(true).await, 1);
        assert_eq!(banned_lines(false).await, 0);
    }

    #[tokio::test]
    async fn test_classification_is_deterministic() {
        let roster = vec![
            remote("a@x", true),
            remote("b@x", false),
            remote("c@x", false),
            remote("d@x", true),
        ];
        let activity = snapshot(&[("a@x", 2), ("b@x", 1), ("d@x", 3)]);

        let first = Harness::new(Some(roster.clone()), Some(activity.clone()), settings());
        let second = Harness::new(Some(roster), Some(activity), settings());

        let s1 = first.engine.run_cycle().await.unwrap();
        let s2 = second.engine.run_cycle().await.unwrap();
        assert_eq!(s1, s2);
        assert_eq!(first.calls(), second.calls());
        assert_eq!(
            first.calls(),
            vec![Call::Enable("b@x".to_string()), Call::Enable("c@x".to_string())]
        );
    }

    #[tokio::test]
    async fn test_observe_only_issues_no_calls() {
        let mut observe = settings();
        observe.enforce = false;
        let h = Harness::new(
            Some(vec![remote("a@x", true), remote("b@x", false)]),
            Some(snapshot(&[("a@x", 5)])),
            observe,
        );

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.suspicious, 1);
        assert!(h.calls().is_empty());
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_roster_entries_processed_once() {
        let h = Harness::new(
            Some(vec![remote("a@x", false), remote("a@x", false)]),
            Some(ActivitySnapshot::new()),
            settings(),
        );

        let summary = h.engine.run_cycle().await.unwrap();
        assert_eq!(summary.enabled_inactive, 1);
        assert_eq!(h.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_status() {
        let h = Harness::new(
            Some(vec![]),
            Some(snapshot(&[("a@x", 5), ("b@x", 1), ("c@x", 3)])),
            settings(),
        );

        let status = h.engine.status().await;
        assert!(!status.running);
        assert_eq!(status.total_identities, 3);
        assert_eq!(status.suspicious_count, 1);
        assert_eq!(status.normal_count, 2);
        assert_eq!(status.max_addresses, 3);
        assert_eq!(status.check_interval_seconds, 300);
        assert!(status.error.is_none());

        *h.activity.snapshot.lock().unwrap() = None;
        let status = h.engine.status().await;
        assert!(status.error.is_some());
        assert_eq!(status.total_identities, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop() {
        let mut fast = settings();
        fast.check_interval = Duration::from_secs(10);
        let h = Harness::new(
            Some(vec![remote("idle@x", false)]),
            Some(ActivitySnapshot::new()),
            fast,
        );

        h.engine.start().await.unwrap();
        assert!(h.engine.is_running());
        assert!(matches!(h.engine.start().await, Err(EngineError::AlreadyRunning)));

        // No cycle before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.calls(), vec![Call::Enable("idle@x".to_string())]);

        h.engine.stop().await;
        assert!(!h.engine.is_running());

        h.clear_calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.calls().is_empty());

        // Restartable after stop.
        h.engine.start().await.unwrap();
        h.engine.stop().await;
    }
}
