use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Args};

use crate::coordinator::RelayOptions;
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the signaling listener to.
    #[arg(long, env = "HUDDLE_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// Broadcast `user:left` to the remaining room members on disconnect.
    #[arg(
        long,
        env = "HUDDLE_RELAY_ANNOUNCE_DEPARTURES",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub announce_departures: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "HUDDLE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Log filter directive used when RUST_LOG is unset.
    #[arg(long, env = "HUDDLE_RELAY_LOG", default_value = "info")]
    pub log_filter: String,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "HUDDLE_RELAY_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub options: RelayOptions,
    pub shutdown_grace: Duration,
    pub telemetry: TelemetryConfig,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        Ok(RelayConfig {
            listen_addr,
            options: RelayOptions {
                announce_departures: args.announce_departures,
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            telemetry: TelemetryConfig {
                log_filter: args.log_filter,
                otel_stdout: args.otel_stdout,
            },
        })
    }
}
