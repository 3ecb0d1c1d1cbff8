use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, RoomId, UserId},
    error::ApiError,
};

/// Frames a client sends over the live socket. Message sending and history
/// go over HTTP; the socket carries only room membership and typing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinRoom { room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    Typing { room_id: RoomId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// One row of the caller's chat list: the latest message in a room plus the
/// caller's unread count for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub counterparty_id: UserId,
    pub last_message: MessagePayload,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
    },
    /// Best-effort typing notification. Never persisted, never retried.
    TypingStarted {
        room_id: RoomId,
        user_id: UserId,
        display_name: String,
    },
    RoomCleared {
        room_id: RoomId,
    },
    Error(ApiError),
}
