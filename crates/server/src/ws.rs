use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ConnectionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, ServerEvent},
};
use tracing::{debug, warn};

use crate::{auth, room_bus::RoomFanout, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: String,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    match auth::verify_token(&state.auth, &q.token) {
        Ok(user_id) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, user_id))
            .into_response(),
        Err(_) => (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(
                ErrorCode::Unauthorized,
                "invalid or expired token",
            )),
        )
            .into_response(),
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let connection_id = ConnectionId::new();
    let mut pushes = state.bus.register(connection_id).await;
    let (mut sender, mut receiver) = socket.split();

    // resolved once per connection; typing notifications reuse it
    let display_name = state
        .api
        .storage
        .display_name_for_user(user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| format!("user:{}", user_id.0));

    let send_task = tokio::spawn(async move {
        while let Some(event) = pushes.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    debug!(?connection_id, user_id = user_id.0, "websocket connected");

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    handle_frame(&state, connection_id, user_id, &display_name, frame).await;
                }
                Err(err) => {
                    warn!(%err, "dropping malformed client frame");
                    state
                        .bus
                        .send_to(
                            connection_id,
                            ServerEvent::Error(ApiError::new(
                                ErrorCode::Validation,
                                "malformed client frame",
                            )),
                        )
                        .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, ?connection_id, "websocket receive failed");
                break;
            }
        }
    }

    state.bus.disconnect(connection_id).await;
    send_task.abort();
    debug!(?connection_id, user_id = user_id.0, "websocket closed");
}

async fn handle_frame(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    display_name: &str,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::JoinRoom { room_id } => {
            if let Err(err) = server_api::ensure_participant(&room_id, user_id) {
                state
                    .bus
                    .send_to(connection_id, ServerEvent::Error(err))
                    .await;
                return;
            }
            state.bus.join(connection_id, room_id).await;
        }
        ClientFrame::LeaveRoom { room_id } => {
            state.bus.leave(connection_id, &room_id).await;
        }
        ClientFrame::Typing { room_id } => {
            // best-effort: a typing frame for a room the caller is not part
            // of is simply dropped
            if server_api::ensure_participant(&room_id, user_id).is_err() {
                return;
            }
            let event = ServerEvent::TypingStarted {
                room_id: room_id.clone(),
                user_id,
                display_name: display_name.to_string(),
            };
            state
                .bus
                .publish_typing(&room_id, connection_id, event)
                .await;
        }
    }
}
