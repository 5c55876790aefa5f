//! Share guard CLI.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zentinel_share_guard::ledger::UnbanOutcome;
use zentinel_share_guard::{
    BanLedger, Config, EngineSettings, FirewallController, GatewayProxy, Identity, LogAccumulator,
    LogAnalyzer, ReconciliationEngine, XuiPanel,
};

#[derive(Parser, Debug)]
#[command(name = "zentinel-share-guard")]
#[command(about = "Connection-sharing enforcement for x-ui - ban identities seen from too many addresses")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "share-guard.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Print active bans and exit
    #[arg(long)]
    list_bans: bool,

    /// Remove the ban for an identity, re-enable it and exit
    #[arg(long, value_name = "IDENTITY")]
    unban: Option<String>,

    /// Print engine status as JSON and exit
    #[arg(long)]
    status: bool,

    /// Run a single reconciliation cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let ledger = Arc::new(
        BanLedger::open(&config.bans.ledger_path, config.bans.ban_duration())
            .with_context(|| format!("opening ban ledger {}", config.bans.ledger_path.display()))?,
    );

    if args.list_bans {
        let bans = ledger.active_bans();
        println!("{}", serde_json::to_string_pretty(&bans)?);
        return Ok(());
    }

    let panel = Arc::new(XuiPanel::new(config.panel.clone())?);

    if let Some(email) = args.unban {
        return unban(&ledger, panel.as_ref(), &email).await;
    }

    let accumulator = Arc::new(LogAccumulator::new(&config.activity).with_context(|| {
        format!(
            "opening accumulated log {}",
            config.activity.accumulated_log_path.display()
        )
    })?);
    let analyzer = Arc::new(LogAnalyzer::new(accumulator.accumulated_path()));
    let firewall = Arc::new(FirewallController::from_config(&config.firewall));

    let engine = Arc::new(ReconciliationEngine::new(
        ledger,
        analyzer,
        panel,
        firewall,
        EngineSettings::from_config(&config),
    ));

    if args.status {
        let status = engine.status().await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    if args.once {
        accumulator
            .accumulate_new_lines()
            .context("accumulating access log")?;
        let summary = engine.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accumulating = accumulator.spawn(shutdown_rx);
    engine.start().await?;

    info!(
        max_addresses = config.enforcement.max_addresses,
        inbound_id = config.panel.inbound_id,
        firewall = config.firewall.enabled,
        "Share guard running"
    );

    wait_for_shutdown().await?;

    engine.stop().await;
    shutdown_tx.send_replace(true);
    if let Err(e) = accumulating.await {
        warn!(error = %e, "Accumulator task failed");
    }

    info!("Share guard stopped");
    Ok(())
}

async fn unban(ledger: &BanLedger, panel: &dyn GatewayProxy, email: &str) -> Result<()> {
    let remote = panel.find_identity(email).await?;
    let identity = match &remote {
        Some(remote) => remote.identity.clone(),
        None => {
            warn!(identity = %email, "Identity not found on panel, removing ledger record only");
            Identity::from(email)
        }
    };

    match ledger.unban(&identity)? {
        UnbanOutcome::Removed(record) => {
            info!(identity = %identity, reason = %record.reason, "Ban removed");
        }
        UnbanOutcome::NotBanned => {
            info!(identity = %identity, "Identity was not banned");
        }
    }

    if remote.is_some() {
        panel.enable(&identity).await?;
    }
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
