use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use tracing::debug;

use crate::{ChatBackend, ChatTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joined,
}

/// One entry of the displayed sequence. `confirmed` is false only for an
/// optimistic local insert whose store append has not been acknowledged.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub message: MessagePayload,
    pub confirmed: bool,
}

/// Per-room client state machine: joins the room's push channel, seeds
/// history, merges live pushes, and reconciles optimistic sends.
///
/// Owned exclusively by the controller that created it; the displayed
/// sequence stays ascending by timestamp, with local insertion order
/// breaking ties.
pub struct ChatSession {
    room_id: RoomId,
    user_id: UserId,
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn ChatTransport>,
    state: SessionState,
    messages: Vec<MessageView>,
    minimized: bool,
    peer_typing: bool,
    scroll_to_latest: bool,
    next_provisional_id: i64,
}

impl ChatSession {
    pub fn new(
        room_id: RoomId,
        user_id: UserId,
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            room_id,
            user_id,
            backend,
            transport,
            state: SessionState::Disconnected,
            messages: Vec::new(),
            minimized: false,
            peer_typing: false,
            scroll_to_latest: false,
            next_provisional_id: -1,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    pub fn minimized(&self) -> bool {
        self.minimized
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        self.minimized = minimized;
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    /// Returns and clears the scroll side-effect flag raised by merges.
    pub fn take_scroll_to_latest(&mut self) -> bool {
        std::mem::take(&mut self.scroll_to_latest)
    }

    /// Joins the room and seeds the local sequence from stored history.
    pub async fn open(&mut self) -> Result<()> {
        self.state = SessionState::Connecting;
        if let Err(err) = self.transport.join(&self.room_id).await {
            self.state = SessionState::Disconnected;
            return Err(err);
        }
        let history = match self.backend.fetch_history(&self.room_id).await {
            Ok(history) => history,
            Err(err) => {
                self.state = SessionState::Disconnected;
                return Err(err);
            }
        };
        self.messages = history
            .into_iter()
            .map(|message| MessageView {
                message,
                confirmed: true,
            })
            .collect();
        self.resort();
        self.state = SessionState::Joined;
        self.scroll_to_latest = true;
        Ok(())
    }

    /// Merges one inbound push. Events for other rooms, and anything
    /// arriving after teardown, are ignored.
    pub fn apply_event(&mut self, event: &ServerEvent) {
        if self.state != SessionState::Joined {
            return;
        }
        match event {
            ServerEvent::MessageReceived { message } if message.room_id == self.room_id => {
                self.merge_message(message.clone());
            }
            ServerEvent::TypingStarted {
                room_id, user_id, ..
            } if *room_id == self.room_id && *user_id != self.user_id => {
                self.peer_typing = true;
            }
            ServerEvent::RoomCleared { room_id } if *room_id == self.room_id => {
                self.messages.clear();
            }
            _ => {}
        }
    }

    fn merge_message(&mut self, message: MessagePayload) {
        // idempotent merge: the sender's own echo, or a duplicate push,
        // carries an id that is already present
        if self
            .messages
            .iter()
            .any(|view| view.message.message_id == message.message_id)
        {
            return;
        }
        if message.sender_id != self.user_id {
            self.peer_typing = false;
        }
        let position = self
            .messages
            .iter()
            .position(|view| view.message.sent_at > message.sent_at)
            .unwrap_or(self.messages.len());
        self.messages.insert(
            position,
            MessageView {
                message,
                confirmed: true,
            },
        );
        self.scroll_to_latest = true;
    }

    /// Optimistic send: the message appears locally at once under a
    /// provisional id, then the store-confirmed row replaces it so the bus
    /// echo dedups exactly. On failure the provisional entry stays,
    /// unconfirmed, for the user to retry.
    pub async fn send(&mut self, body: &str) -> Result<MessageId> {
        if self.state != SessionState::Joined {
            return Err(TransportError::NotConnected.into());
        }
        let receiver_id = self
            .room_id
            .counterparty(self.user_id)
            .ok_or_else(|| anyhow!("room {} has no counterparty for this user", self.room_id))?;

        let provisional_id = MessageId(self.next_provisional_id);
        self.next_provisional_id -= 1;
        self.messages.push(MessageView {
            message: MessagePayload {
                message_id: provisional_id,
                room_id: self.room_id.clone(),
                sender_id: self.user_id,
                receiver_id,
                body: body.to_string(),
                sent_at: Utc::now(),
                read_at: None,
            },
            confirmed: false,
        });
        self.scroll_to_latest = true;

        let stored = self.backend.append_message(receiver_id, body).await?;
        debug!(
            provisional = provisional_id.0,
            confirmed = stored.message_id.0,
            "send acknowledged"
        );
        if let Some(view) = self
            .messages
            .iter_mut()
            .find(|view| view.message.message_id == provisional_id)
        {
            view.message = stored.clone();
            view.confirmed = true;
        }
        self.resort();
        Ok(stored.message_id)
    }

    pub async fn send_typing(&self) -> Result<()> {
        if self.state != SessionState::Joined {
            return Err(TransportError::NotConnected.into());
        }
        self.transport.send_typing(&self.room_id).await
    }

    /// Clears the room's stored history and empties the local sequence.
    /// There is no undo.
    pub async fn clear(&mut self) -> Result<u64> {
        let deleted = self.backend.clear_room(&self.room_id).await?;
        self.messages.clear();
        Ok(deleted)
    }

    /// Leaves the room and stops accepting pushes.
    pub async fn close(&mut self) {
        if self.state == SessionState::Joined {
            let _ = self.transport.leave(&self.room_id).await;
        }
        self.state = SessionState::Disconnected;
    }

    // Stable sort: messages sharing a timestamp keep their local insertion
    // order.
    fn resort(&mut self) {
        self.messages
            .sort_by(|a, b| a.message.sent_at.cmp(&b.message.sent_at));
    }
}

#[cfg(test)]
#[path = "tests/chat_session_tests.rs"]
mod tests;
