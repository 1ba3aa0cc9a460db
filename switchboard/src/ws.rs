//! WebSocket signaling endpoint
//!
//! `GET /ws?room=<id>&peer=<id>&name=<display>` upgrades to a WebSocket that
//! carries one JSON signaling message per text frame. The socket is split:
//! the peer's writer task owns the sink, the session reader owns the stream.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use switchboard_sfu::{
    session, JoinRequest, PeerId, RoomId, SfuError, SignalingSink, SignalingStream,
};
use tracing::{debug, info, warn};

use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub room: Option<String>,
    pub peer: Option<String>,
    pub name: Option<String>,
}

impl WsQuery {
    /// Empty parameters count as absent
    fn into_request(self, default_room: &str) -> JoinRequest {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        JoinRequest {
            room_id: RoomId::new(present(self.room).unwrap_or_else(|| default_room.to_string())),
            peer_id: present(self.peer).map(PeerId::from),
            name: present(self.name),
        }
    }
}

/// Read half of a split WebSocket
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl SignalingStream for WebSocketStream {
    async fn recv(&mut self) -> Option<switchboard_sfu::Result<String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) => return None, // Graceful close
                Some(Err(e)) => return Some(Err(SfuError::Transport(e.to_string()))),
                None => return None,
                Some(Ok(_)) => {
                    // Binary, ping and pong frames carry no signaling
                }
            }
        }
    }
}

/// Write half of a split WebSocket
struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl SignalingSink for WebSocketSink {
    async fn send(&mut self, text: String) -> switchboard_sfu::Result<()> {
        self.sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SfuError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sender.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request = query.into_request(&state.default_room);
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, request))
}

async fn handle_socket(socket: WebSocket, state: AppState, request: JoinRequest) {
    let room_id = request.room_id.clone();
    info!(room_id = %room_id, peer_id = ?request.peer_id, "WebSocket connection established");

    let (sender, receiver) = socket.split();
    let stream = WebSocketStream { receiver };
    let sink = WebSocketSink { sender };

    if let Err(e) = session::run(state.registry.clone(), request, stream, sink).await {
        warn!(room_id = %room_id, error = %e, "Signaling session failed");
    }

    info!(room_id = %room_id, "WebSocket connection closed");
}
