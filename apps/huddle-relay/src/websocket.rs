use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientEvent, ConnectionId};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::http::AppState;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.coordinator, remote_addr))
}

async fn handle_socket(socket: WebSocket, coordinator: Arc<Coordinator>, remote_addr: SocketAddr) {
    let (connection_id, mut outbound) = coordinator.connect();
    let (mut sender, mut receiver) = socket.split();

    info!(connection_id = %connection_id, remote_addr = %remote_addr, "signaling connection opened");

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %writer_id, error = %err, "failed to encode server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_id, "writer task finished");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        match frame {
            Message::Text(text) => dispatch(&coordinator, &connection_id, ClientEvent::decode(&text)),
            Message::Binary(bytes) => {
                dispatch(&coordinator, &connection_id, ClientEvent::decode_bytes(&bytes))
            }
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Runs for every socket, joined or not, clean close or not.
    coordinator.disconnect(&connection_id);
    writer.abort();

    info!(connection_id = %connection_id, "signaling connection closed");
}

fn dispatch(
    coordinator: &Coordinator,
    connection_id: &ConnectionId,
    decoded: Result<ClientEvent, huddle_protocol::ProtocolError>,
) {
    match decoded {
        Ok(event) => {
            debug!(connection_id = %connection_id, event = event.name(), "received client event");
            coordinator.handle(connection_id, event);
        }
        Err(err) => coordinator.reject_frame(connection_id, &err),
    }
}
