//! Configuration types for the share guard.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// Sharing policy.
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// Ban ledger storage and lifetime.
    #[serde(default)]
    pub bans: BanConfig,

    /// Access log ingestion.
    #[serde(default)]
    pub activity: ActivityConfig,

    /// Remote x-ui panel.
    pub panel: PanelConfig,

    /// Local firewall.
    #[serde(default)]
    pub firewall: FirewallConfig,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch. When false, cycles only observe.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log a detailed line for every newly banned identity on the `banned` target.
    #[serde(default = "default_true")]
    pub log_banned: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_banned: true,
        }
    }
}

/// Sharing policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnforcementConfig {
    /// Ban an identity seen from more than this many distinct addresses.
    #[serde(default = "default_max_addresses")]
    pub max_addresses: usize,

    /// Seconds between reconciliation cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,

    /// Reported in status only; no classification rule consults it.
    #[serde(default)]
    pub grace_period_seconds: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            max_addresses: default_max_addresses(),
            check_interval_seconds: default_check_interval(),
            grace_period_seconds: 0,
        }
    }
}

impl EnforcementConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

fn default_max_addresses() -> usize {
    3
}

fn default_check_interval() -> u64 {
    300
}

/// Ban ledger configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BanConfig {
    /// Path of the JSON ledger file.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Ban length in minutes. Zero or negative bans forever.
    #[serde(default = "default_ban_duration")]
    pub ban_duration_minutes: i64,

    /// How long expired records are kept, in minutes. Zero or negative keeps them forever.
    #[serde(default = "default_ban_retention")]
    pub retention_minutes: i64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            ban_duration_minutes: default_ban_duration(),
            retention_minutes: default_ban_retention(),
        }
    }
}

impl BanConfig {
    pub fn ban_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ban_duration_minutes)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retention_minutes)
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("/var/lib/share-guard/bans.json")
}

fn default_ban_duration() -> i64 {
    30
}

fn default_ban_retention() -> i64 {
    1440
}

/// Access log ingestion configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActivityConfig {
    /// Live access log written by the proxy core.
    #[serde(default = "default_source_log")]
    pub source_log_path: PathBuf,

    /// Accumulated copy the analyzer reads.
    #[serde(default = "default_accumulated_log")]
    pub accumulated_log_path: PathBuf,

    /// Seconds between copies of new source lines.
    #[serde(default = "default_accumulate_interval")]
    pub accumulate_interval_seconds: u64,

    /// Age in minutes after which accumulated lines are trimmed. Zero or negative keeps them forever.
    #[serde(default = "default_activity_retention")]
    pub retention_minutes: i64,

    /// Seconds between retention trims.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            source_log_path: default_source_log(),
            accumulated_log_path: default_accumulated_log(),
            accumulate_interval_seconds: default_accumulate_interval(),
            retention_minutes: default_activity_retention(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

fn default_source_log() -> PathBuf {
    PathBuf::from("/usr/local/x-ui/access.log")
}

fn default_accumulated_log() -> PathBuf {
    PathBuf::from("/var/lib/share-guard/accumulated.log")
}

fn default_accumulate_interval() -> u64 {
    60
}

fn default_activity_retention() -> i64 {
    60
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// x-ui panel connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanelConfig {
    /// Base URL, e.g. `http://127.0.0.1:54321/`.
    pub url: String,

    /// Panel login (supports ${ENV_VAR} syntax).
    pub username: String,

    /// Panel password (supports ${ENV_VAR} syntax).
    pub password: String,

    /// Inbound whose clients are policed.
    pub inbound_id: u32,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_panel_timeout")]
    pub timeout_ms: u64,

    /// Pause between the writes of a multi-phase update, in milliseconds.
    #[serde(default = "default_apply_delay")]
    pub apply_delay_ms: u64,
}

fn default_panel_timeout() -> u64 {
    30_000
}

fn default_apply_delay() -> u64 {
    1000
}

/// Local firewall configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallConfig {
    /// Issue firewall commands at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Firewall executable.
    #[serde(default = "default_firewall_binary")]
    pub binary: String,

    /// Chain receiving the DROP rules.
    #[serde(default = "default_firewall_chain")]
    pub chain: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_firewall_binary(),
            chain: default_firewall_chain(),
        }
    }
}

fn default_firewall_binary() -> String {
    "iptables".to_string()
}

fn default_firewall_chain() -> String {
    "INPUT".to_string()
}

fn default_true() -> bool {
    true
}

/// Upper bound for minute-valued settings.
const MAX_MINUTES: i64 = 100 * 365 * 24 * 60;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding `${VAR}` references.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let mut config: Config = serde_yaml::from_str(&expanded)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        if !self.panel.url.is_empty() && !self.panel.url.ends_with('/') {
            self.panel.url.push('/');
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enforcement.max_addresses == 0 {
            anyhow::bail!("enforcement.max_addresses must be at least 1");
        }

        if self.enforcement.check_interval_seconds == 0 {
            anyhow::bail!("enforcement.check_interval_seconds must be greater than 0");
        }

        if self.activity.accumulate_interval_seconds == 0 {
            anyhow::bail!("activity.accumulate_interval_seconds must be greater than 0");
        }

        if self.activity.cleanup_interval_seconds == 0 {
            anyhow::bail!("activity.cleanup_interval_seconds must be greater than 0");
        }

        for (name, minutes) in [
            ("bans.ban_duration_minutes", self.bans.ban_duration_minutes),
            ("bans.retention_minutes", self.bans.retention_minutes),
            ("activity.retention_minutes", self.activity.retention_minutes),
        ] {
            if minutes > MAX_MINUTES {
                anyhow::bail!("{} must be at most {} (100 years), got {}", name, MAX_MINUTES, minutes);
            }
        }

        if self.panel.url.is_empty() {
            anyhow::bail!("panel.url is empty");
        }

        if !self.panel.url.starts_with("http://") && !self.panel.url.starts_with("https://") {
            anyhow::bail!("panel.url must start with http:// or https://: {}", self.panel.url);
        }

        if self.panel.username.is_empty() {
            anyhow::bail!("panel.username is empty");
        }

        if self.firewall.enabled && (self.firewall.binary.is_empty() || self.firewall.chain.is_empty()) {
            anyhow::bail!("firewall is enabled but binary or chain is empty");
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Share Guard Configuration

settings:
  enabled: true                # false: classify and log only, no corrective actions
  log_banned: true

# Connection-sharing policy
enforcement:
  max_addresses: 3             # Ban when more distinct source addresses are seen
  check_interval_seconds: 300
  grace_period_seconds: 0      # Reported in status, not used for decisions

# Ban ledger
bans:
  ledger_path: "/var/lib/share-guard/bans.json"
  ban_duration_minutes: 30     # 0 = ban forever
  retention_minutes: 1440      # Keep expired records this long, 0 = forever

# Access log ingestion
activity:
  source_log_path: "/usr/local/x-ui/access.log"
  accumulated_log_path: "/var/lib/share-guard/accumulated.log"
  accumulate_interval_seconds: 60
  retention_minutes: 60        # Window of activity used for counting, 0 = forever
  cleanup_interval_seconds: 3600

# x-ui panel
panel:
  url: "http://127.0.0.1:54321/"
  username: "${PANEL_USER}"
  password: "${PANEL_PASS}"
  inbound_id: 1
  timeout_ms: 30000
  apply_delay_ms: 1000

# Local firewall
firewall:
  enabled: true
  binary: "iptables"
  chain: "INPUT"
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
