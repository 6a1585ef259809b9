use anyhow::Result;
use clap::Parser;
use huddle_relay::cli::{self, Cli, Commands};
use huddle_relay::config::RelayConfig;
use huddle_relay::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli.serve)?;
    let telemetry = Telemetry::init(&config.telemetry)?;

    match cli.command {
        Some(Commands::Probe {
            url,
            email,
            room,
            wait_secs,
        }) => cli::run_probe(url, email, room, wait_secs).await,
        Some(Commands::Serve) | None => huddle_relay::run(config, telemetry.metrics_handle()).await,
    }
}
