use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientEvent, ServerEvent};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::SignalingError;

/// Outbound half of the signaling channel.
pub trait SignalSink: Send + Sync {
    /// Queue `event` for the relay. Once the channel is gone the event is
    /// dropped; nothing is buffered for a later connection.
    fn send(&self, event: ClientEvent);
}

/// WebSocket connection to the relay.
pub struct SignalingClient {
    url: Url,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<ServerEvent>>,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(relay_url: &str) -> Result<Self, SignalingError> {
        let url = websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerEvent>();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = Arc::clone(&closed);
        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match event.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = event.name(), error = %err, "failed to encode signaling event");
                        continue;
                    }
                };
                if let Err(err) = ws_write.send(Message::Text(text.into())).await {
                    debug!(error = %err, "signaling write failed");
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            let _ = ws_write.close().await;
        });

        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => ServerEvent::decode(&text),
                    Ok(Message::Binary(data)) => ServerEvent::decode_bytes(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                match decoded {
                    Ok(event) => {
                        if inbound_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "unrecognised frame from relay"),
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            url,
            outbound,
            inbound: AsyncMutex::new(inbound),
            closed,
            tasks: vec![writer, reader],
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next event from the relay; `None` once the socket has closed.
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.inbound.lock().await.recv().await
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, event: ClientEvent) {
        let name = event.name();
        if self.is_closed() || self.outbound.send(event).is_err() {
            debug!(event = name, "signaling channel closed; dropping event");
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// Turn a relay address (`http://host:port` or a ws URL) into the
/// WebSocket endpoint. A bare host gets the `/ws` path.
pub fn websocket_url(relay_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: relay_url.to_string(),
        reason,
    };
    let mut url = Url::parse(relay_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme".to_string()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
