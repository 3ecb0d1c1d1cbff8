use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{RoomId, UserId},
    protocol::{ClientFrame, MessagePayload, RoomSummary, ServerEvent},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use anyhow::{anyhow, Result};

pub mod chat_list;
pub mod chat_session;
pub mod task_queue;

pub use chat_list::{ChatListController, RoomActivity, MAX_ACTIVE_CHATS};
pub use chat_session::{ChatSession, MessageView, SessionState};
pub use task_queue::SerializedTaskQueue;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session is not joined")]
    NotConnected,
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket send failed: {0}")]
    Send(String),
}

/// Request/response half of the chat service: message persistence and
/// history. Implemented over HTTP in production; tests swap in an in-memory
/// double.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn append_message(&self, receiver_id: UserId, body: &str) -> Result<MessagePayload>;
    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessagePayload>>;
    async fn mark_read(&self, room_id: &RoomId) -> Result<u64>;
    async fn clear_room(&self, room_id: &RoomId) -> Result<u64>;
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>>;
}

/// Live push half of the chat service. A connection object with an explicit
/// lifecycle, owned by whoever created it and handed to sessions that need
/// it; there is no process-wide singleton.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn join(&self, room_id: &RoomId) -> Result<()>;
    async fn leave(&self, room_id: &RoomId) -> Result<()>;
    async fn send_typing(&self, room_id: &RoomId) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    receiver_id: i64,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct MarkReadResponse {
    updated: u64,
}

#[derive(Debug, Deserialize)]
struct ClearRoomResponse {
    deleted: u64,
}

/// HTTP implementation of [`ChatBackend`], authenticated with the bearer
/// token the login endpoint issued.
pub struct HttpBackend {
    http: Client,
    server_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn append_message(&self, receiver_id: UserId, body: &str) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .bearer_auth(&self.token)
            .json(&SendMessageRequest {
                receiver_id: receiver_id.0,
                body,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(format!("{}/rooms/{room_id}/messages", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn mark_read(&self, room_id: &RoomId) -> Result<u64> {
        let response: MarkReadResponse = self
            .http
            .post(format!("{}/rooms/{room_id}/read", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.updated)
    }

    async fn clear_room(&self, room_id: &RoomId) -> Result<u64> {
        let response: ClearRoomResponse = self
            .http
            .delete(format!("{}/rooms/{room_id}/messages", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.deleted)
    }

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        let response = self
            .http
            .get(format!("{}/rooms", self.server_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket implementation of [`ChatTransport`]. Opened explicitly, closed
/// on drop; pushes fan out to subscribers over a broadcast channel.
pub struct WsTransport {
    writer: Mutex<WsSink>,
    events: broadcast::Sender<ServerEvent>,
    read_task: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(server_url: &str, token: &str) -> Result<Self> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?token={token}");
        let (stream, _) = connect_async(&ws_url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (writer, mut reader) = stream.split();

        let (events, _) = broadcast::channel(256);
        let events_tx = events.clone();
        let read_task = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = events_tx.send(event);
                        }
                        Err(err) => warn!(%err, "dropping malformed server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(writer),
            events,
            read_task,
        })
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()).into())
    }

    /// Tears the connection down. Also happens implicitly on drop.
    pub fn close(&self) {
        self.read_task.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[async_trait]
impl ChatTransport for WsTransport {
    async fn join(&self, room_id: &RoomId) -> Result<()> {
        self.send_frame(&ClientFrame::JoinRoom {
            room_id: room_id.clone(),
        })
        .await
    }

    async fn leave(&self, room_id: &RoomId) -> Result<()> {
        self.send_frame(&ClientFrame::LeaveRoom {
            room_id: room_id.clone(),
        })
        .await
    }

    async fn send_typing(&self, room_id: &RoomId) -> Result<()> {
        self.send_frame(&ClientFrame::Typing {
            room_id: room_id.clone(),
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
