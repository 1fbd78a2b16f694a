//! mcwatch - Minecraft server status bot for Discord
//!
//! Polls Minecraft servers on a timer and keeps one live status message per
//! server up to date in a Discord channel.

mod clock;
mod config;
mod discord;
mod history;
mod probe;
mod publish;
mod report;
mod scheduler;

use clap::{Parser, Subcommand};
use clock::SystemClock;
use config::BotConfig;
use discord::{DiscordClient, Gateway};
use probe::MinecraftProber;
use publish::Publisher;
use report::{PlottersChart, ReportRenderer, ReportStyle};
use scheduler::{Monitor, Scheduler};

use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mcwatch")]
#[command(about = "Minecraft server status bot for Discord")]
struct Args {
    /// Path to the JSON config file (default: $MCWATCH_CONFIG or config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Run the bot (default)
    #[default]
    Run,
    /// Overwrite the global slash commands and exit
    RegisterCommands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("mcwatch=info".parse()?))
        .init();

    let args = Args::parse();

    // Load configuration
    let path = BotConfig::resolve_path(args.config);
    let cfg = Arc::new(BotConfig::load(&path)?);
    tracing::info!("Loaded {} targets from {}", cfg.targets.len(), path.display());

    let http = discord::http_client(&cfg.bot_token);

    match args.command.unwrap_or_default() {
        Command::RegisterCommands => {
            let application_id = discord::application_id(&cfg)?;
            discord::commands::register_commands(&http, application_id, &cfg).await?;
            Ok(())
        }
        Command::Run => run(cfg, http).await,
    }
}

async fn run(
    cfg: Arc<BotConfig>,
    http: Arc<twilight_http::Client>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut labels = match report::register_bundled_font() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Chart labels disabled: {}", e);
            false
        }
    };
    if let Some(font) = &cfg.chart_font {
        match report::load_chart_font(font) {
            Ok(()) => {
                tracing::info!("Using chart font {}", font.display());
                labels = true;
            }
            Err(e) => tracing::warn!("Ignoring chartFont: {}", e),
        }
    }

    let renderer = ReportRenderer::new(ReportStyle::from_config(&cfg), Arc::new(PlottersChart::new(labels)));
    let publisher = Publisher::new(Arc::new(DiscordClient::new(http.clone())), cfg.edit_failure_policy);
    let monitor = Arc::new(Monitor::new(
        Arc::new(MinecraftProber),
        renderer,
        publisher,
        Arc::new(SystemClock),
        cfg.probe_timeout(),
    ));

    // Start scheduler
    let scheduler = Scheduler::new(monitor.clone(), cfg.overlap_policy);
    scheduler.start(&cfg.targets).await;
    tracing::info!("Monitoring: {}", scheduler.active_targets().await.join(", "));

    let gateway = Gateway::new(http, cfg.clone(), monitor);
    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = tokio::select! {
        r = gateway.run() => r.map_err(Into::into),
        r = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            r.map_err(Into::into)
        }
    };

    scheduler.stop().await;
    result
}
