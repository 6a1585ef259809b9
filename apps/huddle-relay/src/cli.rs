use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientEvent, JoinRequest, ServerEvent};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use crate::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "huddle-relay")]
#[command(about = "Huddle signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve,
    /// Join a room and print every signaling event received
    Probe {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:3001/ws")]
        url: String,

        /// Email to join with
        #[arg(short, long)]
        email: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// Stop after this many seconds (runs until the socket closes otherwise)
        #[arg(long)]
        wait_secs: Option<u64>,
    },
}

pub async fn run_probe(url: String, email: String, room: String, wait_secs: Option<u64>) -> Result<()> {
    debug!("Connecting to {} as {} for room {}", url, email, room);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = ClientEvent::Join(JoinRequest { email, room });
    write.send(Message::Text(join.encode()?.into())).await?;

    let deadline = wait_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, read.next()).await {
                Ok(next) => next,
                Err(_) => break,
            },
            None => read.next().await,
        };
        let Some(frame) = next else {
            break;
        };
        match frame? {
            Message::Text(text) => match ServerEvent::decode(&text) {
                Ok(event) => print_event(&event)?,
                Err(err) => warn!("Unrecognised frame from relay: {}", err),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}

fn print_event(event: &ServerEvent) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(event)?);
    if let ServerEvent::JoinFailed(err) = event {
        return Err(anyhow!("Join failed: {}", err.message));
    }
    Ok(())
}
