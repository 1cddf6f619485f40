//! Drip runner: loads campaigns and users from a fixture file and runs the
//! drip pipeline once, on a schedule, or as a dry-run walk.

use anyhow::Context;
use campaign_channels::LogTransport;
use campaign_core::config::AppConfig;
use campaign_drip::{Drip, DripContext, DripStore, Fixtures, MemoryStore, RunOutcome, TriggerDispatcher};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "drip-runner")]
#[command(about = "Rule-based drip email campaigns")]
#[command(version)]
struct Cli {
    /// TOML config file (environment variables with the DRIP__ prefix override it)
    #[arg(long, env = "DRIP_CONFIG")]
    config: Option<PathBuf>,

    /// JSON fixture file with users and campaigns
    #[arg(long, env = "DRIP_FIXTURES")]
    fixtures: PathBuf,

    /// Default sender address (overrides config)
    #[arg(long, env = "DRIP__DRIP__FROM_EMAIL")]
    from_email: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one campaign, or every enabled campaign, once
    Run {
        #[arg(long)]
        campaign: Option<String>,
    },
    /// Simulate a campaign over a window of days without sending
    Walk {
        #[arg(long)]
        campaign: String,
        #[arg(long, default_value_t = 7)]
        past: u32,
        #[arg(long, default_value_t = 7)]
        future: u32,
    },
    /// Run the campaigns triggered by creation of an entity type
    Trigger {
        #[arg(long)]
        entity: String,
    },
    /// Run every enabled campaign on the configured interval
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip_runner=info,campaign_drip=info,campaign_channels=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    // An explicit config file must load; otherwise fall back to defaults.
    let mut config = match cli.config.as_deref() {
        Some(path) => AppConfig::load_from(Some(path))
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }),
    };
    if let Some(from_email) = cli.from_email {
        config.drip.from_email = Some(from_email);
    }

    info!(
        node_id = %config.node_id,
        email_builder = %config.drip.email_builder,
        interval_secs = config.schedule.interval_secs,
        "Configuration loaded"
    );

    let fixtures = Fixtures::from_path(&cli.fixtures)
        .with_context(|| format!("loading fixtures from {}", cli.fixtures.display()))?;
    let store = Arc::new(MemoryStore::from_fixtures(fixtures)?);
    let ctx = DripContext::new(store.clone(), Arc::new(LogTransport)).with_config(config.drip.clone());

    match cli.command {
        Command::Run { campaign: Some(name) } => {
            let campaign = store
                .get_campaign(&name)?
                .with_context(|| format!("no campaign named '{name}'"))?;
            let dispatcher = TriggerDispatcher::new(ctx);
            report(&[dispatcher.run_campaign(campaign)]);
        }
        Command::Run { campaign: None } => {
            let dispatcher = TriggerDispatcher::new(ctx);
            report(&dispatcher.run_all()?);
        }
        Command::Trigger { entity } => {
            let dispatcher = TriggerDispatcher::new(ctx);
            report(&dispatcher.on_entity_created(&entity)?);
        }
        Command::Walk { campaign, past, future } => {
            let campaign = store
                .get_campaign(&campaign)?
                .with_context(|| format!("no campaign named '{campaign}'"))?;
            let drip = Drip::new(campaign, ctx)?;
            for entry in drip.timeline(past, future)? {
                info!(
                    campaign = drip.name(),
                    shift = %entry.shift,
                    now = %entry.now,
                    candidates = entry.candidates,
                    pending = entry.pending,
                    "Simulated day"
                );
            }
        }
        Command::Daemon => {
            if !config.schedule.enabled {
                warn!("Schedule disabled in config, nothing to do");
                return Ok(());
            }
            let dispatcher = Arc::new(TriggerDispatcher::new(ctx));
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                config.schedule.interval_secs.max(1),
            ));
            info!("Drip runner scheduled");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let dispatcher = Arc::clone(&dispatcher);
                        match tokio::task::spawn_blocking(move || dispatcher.run_all()).await {
                            Ok(Ok(runs)) => report(&runs),
                            Ok(Err(e)) => error!(error = %e, "Scheduled sweep failed"),
                            Err(e) => error!(error = %e, "Scheduled sweep panicked"),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }
    }

    info!(sent_records = store.sent_records().len(), "Drip runner finished");
    Ok(())
}

fn report(runs: &[campaign_drip::CampaignRun]) {
    for run in runs {
        match &run.outcome {
            RunOutcome::Sent(count) => info!(campaign = %run.campaign, sent = count, "Campaign run"),
            RunOutcome::Disabled => info!(campaign = %run.campaign, "Campaign disabled"),
            RunOutcome::AlreadyRunning => warn!(campaign = %run.campaign, "Campaign already running"),
            RunOutcome::Failed(e) => error!(campaign = %run.campaign, error = %e, "Campaign failed"),
        }
    }
}
