use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::monitor::Monitor;
use crate::session::{FeedId, LiveFeed, SessionEvent};
use crate::settings::SettingsStore;
use crate::utils::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "vidwatch", version, about = "Drive live and surveillance video feeds against the analysis backend")]
pub struct Cli {
    /// Settings file (defaults to $VIDWATCH_SETTINGS, then ./vidwatch.json)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Override the backend API base URL
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Start the live feed and follow it until Ctrl-C
    Live {
        /// Camera index or stream URL, instead of the configured one
        #[arg(long)]
        source: Option<String>,
        /// Seconds between automatic reports (5-60)
        #[arg(long)]
        report_every: Option<u64>,
    },
    /// Start every configured camera and follow them until Ctrl-C
    Fleet {
        /// Seconds between automatic reports (5-60)
        #[arg(long)]
        report_every: Option<u64>,
    },
    /// Show what the backend chat currently treats as its video context
    Context,
    /// Send one chat message
    Chat {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
}

pub async fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let store = match cli.settings {
        Some(path) => SettingsStore::new(path)?,
        None => SettingsStore::from_env()?,
    };
    if let Some(url) = cli.api_url {
        store.override_api_url(url);
    }
    let mut settings = store.settings();
    if let CliCommand::Live { source: Some(source), .. } = &cli.command {
        settings.live.source = source.clone();
    }

    info!("vidwatch starting against {}", settings.api_base_url);
    let monitor = Monitor::connect(&settings).context("Failed to set up the backend client")?;

    match cli.command {
        CliCommand::Live { report_every, .. } => {
            let follower = tokio::spawn(follow_events(monitor.live().subscribe_events()));
            monitor
                .live()
                .start(LiveFeed)
                .await
                .context("Failed to start the live feed")?;
            if let Some(seconds) = report_every {
                monitor
                    .live()
                    .set_report_cadence(Duration::from_secs(seconds))
                    .await?;
            }
            wait_for_shutdown(&monitor).await?;
            follower.abort();
        }
        CliCommand::Fleet { report_every } => {
            let follower = tokio::spawn(follow_events(monitor.cameras().subscribe_events()));
            let started = monitor.cameras().start_all().await;
            for (feed, err) in &started.failed {
                warn!("{} did not start: {}", feed, err);
            }
            if started.succeeded.is_empty() {
                anyhow::bail!("no camera could be started");
            }
            if let Some(seconds) = report_every {
                monitor
                    .cameras()
                    .set_report_cadence(Duration::from_secs(seconds))
                    .await?;
            }
            wait_for_shutdown(&monitor).await?;
            follower.abort();
        }
        CliCommand::Context => {
            let probe = monitor.chat().probe().await?;
            println!("{}", serde_json::to_string_pretty(&probe)?);
        }
        CliCommand::Chat { message } => {
            let message = message.join(" ");
            if let Some(answer) = monitor.chat().send(&message).await?.completed() {
                println!("{}", answer.content);
            }
        }
    }

    Ok(())
}

async fn wait_for_shutdown(monitor: &Monitor) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    monitor.shutdown().await;
    Ok(())
}

async fn follow_events<F: FeedId>(mut events: broadcast::Receiver<SessionEvent<F>>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PhaseChanged { feed, phase }) => info!("{feed}: {phase}"),
            Ok(SessionEvent::FrameUpdated { feed, degraded: true }) => warn!("{feed}: no frame"),
            Ok(SessionEvent::FrameUpdated { .. }) => {}
            Ok(SessionEvent::ReportsUpdated { feed, count }) => info!("{feed}: {count} report(s)"),
            Ok(SessionEvent::Notice { message, .. }) => info!("{message}"),
            Err(RecvError::Lagged(skipped)) => warn!("event follower fell behind, skipped {skipped}"),
            Err(RecvError::Closed) => break,
        }
    }
}
