//! Connection-sharing enforcement for x-ui gateways.
//!
//! Counts the distinct source addresses each identity connects from and
//! revokes access for identities that exceed a configured limit, keeping a
//! local ban ledger, the remote panel and the local firewall in agreement.
//!
//! # Features
//!
//! - **Ban Ledger** - Durable JSON ledger with lazy and periodic expiry
//! - **Access Log Accumulation** - Tails the proxy access log with a checkpoint
//! - **Activity Analysis** - Per-identity address counters from the log window
//! - **Aggressive Reset** - Disables and rotates credentials so live sessions drop
//! - **Self-Healing** - Re-enables idle and compliant identities
//!
//! # Example Configuration
//!
//! ```yaml
//! enforcement:
//!   max_addresses: 3
//!   check_interval_seconds: 300
//!
//! bans:
//!   ledger_path: /var/lib/share-guard/bans.json
//!   ban_duration_minutes: 30
//!
//! activity:
//!   source_log_path: /usr/local/x-ui/access.log
//!   accumulated_log_path: /var/lib/share-guard/accumulated.log
//!
//! panel:
//!   url: "http://127.0.0.1:54321/"
//!   username: "${PANEL_USER}"
//!   password: "${PANEL_PASSWORD}"
//!   inbound_id: 1
//! ```

pub mod accumulator;
pub mod activity;
pub mod config;
pub mod engine;
pub mod firewall;
pub mod identity;
pub mod ledger;
pub mod panel;

pub use accumulator::LogAccumulator;
pub use activity::{ActivitySource, LogAnalyzer};
pub use config::Config;
pub use engine::{CycleSummary, EngineSettings, EngineStatus, ReconciliationEngine};
pub use firewall::{AccessController, FirewallController};
pub use identity::Identity;
pub use ledger::BanLedger;
pub use panel::{GatewayProxy, XuiPanel};
