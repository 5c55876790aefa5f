//! Address blocking through the local firewall.

use crate::config::FirewallConfig;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Error from the firewall.
#[derive(Debug)]
pub enum FirewallError {
    /// The firewall command could not be started.
    Io(std::io::Error),
    /// The firewall command exited unsuccessfully.
    Command {
        address: IpAddr,
        status: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for FirewallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirewallError::Io(e) => write!(f, "IO error: {}", e),
            FirewallError::Command {
                address,
                status,
                stderr,
            } => match status {
                Some(code) => write!(f, "firewall command for {} exited with {}: {}", address, code, stderr),
                None => write!(f, "firewall command for {} was terminated: {}", address, stderr),
            },
        }
    }
}

impl std::error::Error for FirewallError {}

impl From<std::io::Error> for FirewallError {
    fn from(e: std::io::Error) -> Self {
        FirewallError::Io(e)
    }
}

/// Idempotent address blocking.
#[async_trait]
pub trait AccessController: Send + Sync {
    /// Block `address`. Blocking an already-blocked address is a no-op.
    async fn block(&self, address: IpAddr) -> Result<(), FirewallError>;

    /// Unblock `address`. Unblocking an address that is not blocked is a no-op.
    async fn unblock(&self, address: IpAddr) -> Result<(), FirewallError>;

    fn is_blocked(&self, address: &IpAddr) -> bool;
}

/// Rule-level operations the controller delegates to.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn insert_drop(&self, address: IpAddr) -> Result<(), FirewallError>;

    async fn delete_drop(&self, address: IpAddr) -> Result<(), FirewallError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// DROP rules through the `iptables` command line.
pub struct IptablesBackend {
    binary: String,
    chain: String,
}

impl IptablesBackend {
    pub fn new(binary: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            chain: chain.into(),
        }
    }

    fn args(&self, op: &str, address: IpAddr) -> Vec<String> {
        vec![
            op.to_string(),
            self.chain.clone(),
            "-s".to_string(),
            address.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }

    async fn run(&self, op: &str, address: IpAddr) -> Result<(), FirewallError> {
        let output = Command::new(&self.binary)
            .args(self.args(op, address))
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FirewallError::Command {
                address,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn insert_drop(&self, address: IpAddr) -> Result<(), FirewallError> {
        self.run("-I", address).await
    }

    async fn delete_drop(&self, address: IpAddr) -> Result<(), FirewallError> {
        self.run("-D", address).await
    }

    fn name(&self) -> &str {
        &self.binary
    }
}

/// Backend used when the firewall is disabled in configuration.
pub struct NoopBackend;

#[async_trait]
impl FirewallBackend for NoopBackend {
    async fn insert_drop(&self, address: IpAddr) -> Result<(), FirewallError> {
        debug!(address = %address, "Firewall disabled, not inserting rule");
        Ok(())
    }

    async fn delete_drop(&self, address: IpAddr) -> Result<(), FirewallError> {
        debug!(address = %address, "Firewall disabled, not deleting rule");
        Ok(())
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Access controller caching the set of addresses it has blocked.
pub struct FirewallController {
    backend: Box<dyn FirewallBackend>,
    blocked: RwLock<HashSet<IpAddr>>,
    /// Serializes check-then-command sequences so rules are never duplicated.
    ops: Mutex<()>,
}

impl FirewallController {
    pub fn new(backend: Box<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            blocked: RwLock::new(HashSet::new()),
            ops: Mutex::new(()),
        }
    }

    /// Build the controller described by `config`.
    pub fn from_config(config: &FirewallConfig) -> Self {
        if config.enabled {
            Self::new(Box::new(IptablesBackend::new(&config.binary, &config.chain)))
        } else {
            Self::new(Box::new(NoopBackend))
        }
    }

    /// Currently blocked addresses, sorted.
    pub fn blocked_addresses(&self) -> Vec<IpAddr> {
        let mut list: Vec<IpAddr> = self
            .blocked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        list.sort();
        list
    }

    fn set_blocked(&self, address: IpAddr, blocked: bool) {
        let mut set = self.blocked.write().unwrap_or_else(PoisonError::into_inner);
        if blocked {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }
}

#[async_trait]
impl AccessController for FirewallController {
    async fn block(&self, address: IpAddr) -> Result<(), FirewallError> {
        let _op = self.ops.lock().await;

        if self.is_blocked(&address) {
            debug!(address = %address, "Address already blocked");
            return Ok(());
        }

        self.backend.insert_drop(address).await?;
        self.set_blocked(address, true);
        info!(address = %address, backend = self.backend.name(), "Address blocked");
        Ok(())
    }

    async fn unblock(&self, address: IpAddr) -> Result<(), FirewallError> {
        let _op = self.ops.lock().await;

        if !self.is_blocked(&address) {
            debug!(address = %address, "Address was not blocked");
            return Ok(());
        }

        self.backend.delete_drop(address).await?;
        self.set_blocked(address, false);
        info!(address = %address, backend = self.backend.name(), "Address unblocked");
        Ok(())
    }

    fn is_blocked(&self, address: &IpAddr) -> bool {
        self.blocked
            .read()
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }
}
