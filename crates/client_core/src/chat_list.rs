use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use shared::{
    domain::{RoomId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::warn;

use crate::{ChatBackend, ChatSession, ChatTransport};

/// Upper bound on concurrently open chat windows.
pub const MAX_ACTIVE_CHATS: usize = 3;

/// Unread counter and last-message preview for one room, maintained whether
/// or not a session for that room is open.
#[derive(Debug, Clone, Default)]
pub struct RoomActivity {
    pub last_message: Option<MessagePayload>,
    pub unread_count: i64,
}

/// Owns the open [`ChatSession`]s (bounded, least-recently-activated
/// eviction) plus a background view of every room's unread count and
/// last-message preview, fed by the shared transport subscription.
pub struct ChatListController {
    user_id: UserId,
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn ChatTransport>,
    events: broadcast::Receiver<ServerEvent>,
    sessions: HashMap<RoomId, ChatSession>,
    /// Activation order, least recently activated first.
    activation_order: Vec<RoomId>,
    activity: HashMap<RoomId, RoomActivity>,
    max_active: usize,
}

impl ChatListController {
    pub fn new(
        user_id: UserId,
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self::with_capacity(user_id, backend, transport, MAX_ACTIVE_CHATS)
    }

    pub fn with_capacity(
        user_id: UserId,
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn ChatTransport>,
        max_active: usize,
    ) -> Self {
        let events = transport.subscribe();
        Self {
            user_id,
            backend,
            transport,
            events,
            sessions: HashMap::new(),
            activation_order: Vec::new(),
            activity: HashMap::new(),
            max_active,
        }
    }

    /// Seeds unread counts and previews from the stored chat list.
    pub async fn refresh_rooms(&mut self) -> Result<()> {
        let rooms = self.backend.list_rooms().await?;
        for summary in rooms {
            self.activity.insert(
                summary.room_id.clone(),
                RoomActivity {
                    last_message: Some(summary.last_message),
                    unread_count: summary.unread_count,
                },
            );
        }
        Ok(())
    }

    /// Opens (or re-activates) the chat with a counterparty. An existing
    /// session is brought to front and un-minimized; otherwise the least
    /// recently activated session is evicted if the bound is hit, and a
    /// fresh session joins the room. Opening reads the room.
    pub async fn open_chat(&mut self, counterparty_id: UserId) -> Result<RoomId> {
        let room_id = RoomId::direct(self.user_id, counterparty_id);

        if let Some(session) = self.sessions.get_mut(&room_id) {
            session.set_minimized(false);
        } else {
            if self.sessions.len() >= self.max_active {
                if let Some(victim) = self.activation_order.first().cloned() {
                    self.close_chat(&victim).await;
                }
            }
            let mut session = ChatSession::new(
                room_id.clone(),
                self.user_id,
                Arc::clone(&self.backend),
                Arc::clone(&self.transport),
            );
            session.open().await?;
            self.sessions.insert(room_id.clone(), session);
        }
        self.activate(&room_id);

        match self.backend.mark_read(&room_id).await {
            Ok(_) => {
                self.activity.entry(room_id.clone()).or_default().unread_count = 0;
            }
            Err(err) => warn!(%err, room_id = %room_id, "failed to mark room read"),
        }

        Ok(room_id)
    }

    pub async fn close_chat(&mut self, room_id: &RoomId) {
        if let Some(mut session) = self.sessions.remove(room_id) {
            session.close().await;
        }
        self.activation_order.retain(|r| r != room_id);
    }

    /// UI-only: the session keeps its room subscription either way.
    pub fn toggle_minimize(&mut self, room_id: &RoomId) {
        if let Some(session) = self.sessions.get_mut(room_id) {
            let minimized = session.minimized();
            session.set_minimized(!minimized);
        }
    }

    /// Awaits and applies the next inbound push. Returns `None` once the
    /// transport is gone; lagged events are skipped with a warning.
    pub async fn pump_event(&mut self) -> Option<ServerEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    self.apply_event(&event);
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "chat event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Routes one push: into the open session for its room if there is one,
    /// and into the background unread/preview state otherwise.
    pub fn apply_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } => {
                let room_id = message.room_id.clone();
                let has_session = self.sessions.contains_key(&room_id);
                if let Some(session) = self.sessions.get_mut(&room_id) {
                    session.apply_event(event);
                }

                let entry = self.activity.entry(room_id).or_default();
                entry.last_message = Some(message.clone());
                if message.receiver_id == self.user_id && !has_session {
                    entry.unread_count += 1;
                }
            }
            ServerEvent::TypingStarted { room_id, .. } => {
                if let Some(session) = self.sessions.get_mut(room_id) {
                    session.apply_event(event);
                }
            }
            ServerEvent::RoomCleared { room_id } => {
                if let Some(session) = self.sessions.get_mut(room_id) {
                    session.apply_event(event);
                }
                self.activity.remove(room_id);
            }
            ServerEvent::Error(_) => {}
        }
    }

    /// Open rooms, least recently activated first.
    pub fn open_rooms(&self) -> Vec<RoomId> {
        self.activation_order.clone()
    }

    pub fn session(&self, room_id: &RoomId) -> Option<&ChatSession> {
        self.sessions.get(room_id)
    }

    pub fn session_mut(&mut self, room_id: &RoomId) -> Option<&mut ChatSession> {
        self.sessions.get_mut(room_id)
    }

    pub fn activity(&self, room_id: &RoomId) -> Option<&RoomActivity> {
        self.activity.get(room_id)
    }

    fn activate(&mut self, room_id: &RoomId) {
        self.activation_order.retain(|r| r != room_id);
        self.activation_order.push(room_id.clone());
    }
}

#[cfg(test)]
#[path = "tests/chat_list_tests.rs"]
mod tests;
