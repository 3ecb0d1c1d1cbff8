use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{MessagePayload, RoomSummary, ServerEvent},
};
use tokio::sync::broadcast;

use crate::{ChatBackend, ChatTransport};

/// In-memory stand-in for the server: a message store plus a broadcast
/// fan-out that echoes stored messages to every subscriber, the sender
/// included, matching the delivery policy of the real bus.
pub(crate) struct TestHub {
    state: Mutex<HubState>,
    events: broadcast::Sender<ServerEvent>,
    pub joined: Mutex<Vec<RoomId>>,
    pub left: Mutex<Vec<RoomId>>,
    pub fail_appends: AtomicBool,
}

#[derive(Default)]
struct HubState {
    messages: Vec<MessagePayload>,
    next_id: i64,
}

impl TestHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            events,
            joined: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            fail_appends: AtomicBool::new(false),
        })
    }

    /// A backend + transport handle acting as one user.
    pub fn actor(self: &Arc<Self>, user_id: UserId) -> Arc<TestActor> {
        Arc::new(TestActor {
            hub: Arc::clone(self),
            user_id,
        })
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn store(&self, sender_id: UserId, receiver_id: UserId, body: &str) -> MessagePayload {
        let mut state = self.state.lock().expect("hub lock");
        state.next_id += 1;
        let message = MessagePayload {
            message_id: MessageId(state.next_id),
            room_id: RoomId::direct(sender_id, receiver_id),
            sender_id,
            receiver_id,
            body: body.to_string(),
            sent_at: Utc::now(),
            read_at: None,
        };
        state.messages.push(message.clone());
        message
    }
}

pub(crate) struct TestActor {
    pub hub: Arc<TestHub>,
    pub user_id: UserId,
}

#[async_trait]
impl ChatBackend for TestActor {
    async fn append_message(&self, receiver_id: UserId, body: &str) -> Result<MessagePayload> {
        if self.hub.fail_appends.load(Ordering::SeqCst) {
            return Err(anyhow!("append rejected by test hub"));
        }
        let message = self.hub.store(self.user_id, receiver_id, body);
        self.hub.push(ServerEvent::MessageReceived {
            message: message.clone(),
        });
        Ok(message)
    }

    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessagePayload>> {
        let state = self.hub.state.lock().expect("hub lock");
        let mut history: Vec<_> = state
            .messages
            .iter()
            .filter(|m| &m.room_id == room_id)
            .cloned()
            .collect();
        history.sort_by_key(|m| (m.sent_at, m.message_id));
        Ok(history)
    }

    async fn mark_read(&self, room_id: &RoomId) -> Result<u64> {
        let mut state = self.hub.state.lock().expect("hub lock");
        let mut updated = 0;
        for message in state
            .messages
            .iter_mut()
            .filter(|m| &m.room_id == room_id && m.receiver_id == self.user_id)
        {
            if message.read_at.is_none() {
                message.read_at = Some(Utc::now());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn clear_room(&self, room_id: &RoomId) -> Result<u64> {
        let deleted = {
            let mut state = self.hub.state.lock().expect("hub lock");
            let before = state.messages.len();
            state.messages.retain(|m| &m.room_id != room_id);
            (before - state.messages.len()) as u64
        };
        self.hub.push(ServerEvent::RoomCleared {
            room_id: room_id.clone(),
        });
        Ok(deleted)
    }

    async fn list_rooms(&self) -> Result<Vec<RoomSummary>> {
        let state = self.hub.state.lock().expect("hub lock");
        let mut last_by_room: HashMap<RoomId, MessagePayload> = HashMap::new();
        let mut unread_by_room: HashMap<RoomId, i64> = HashMap::new();
        for message in state
            .messages
            .iter()
            .filter(|m| m.room_id.has_participant(self.user_id))
        {
            last_by_room.insert(message.room_id.clone(), message.clone());
            if message.receiver_id == self.user_id && message.read_at.is_none() {
                *unread_by_room.entry(message.room_id.clone()).or_default() += 1;
            }
        }

        let mut summaries: Vec<_> = last_by_room
            .into_iter()
            .map(|(room_id, last_message)| RoomSummary {
                counterparty_id: room_id
                    .counterparty(self.user_id)
                    .expect("participant room"),
                unread_count: unread_by_room.get(&room_id).copied().unwrap_or(0),
                room_id,
                last_message,
            })
            .collect();
        summaries.sort_by_key(|s| std::cmp::Reverse(s.last_message.message_id));
        Ok(summaries)
    }
}

#[async_trait]
impl ChatTransport for TestActor {
    async fn join(&self, room_id: &RoomId) -> Result<()> {
        self.hub.joined.lock().expect("hub lock").push(room_id.clone());
        Ok(())
    }

    async fn leave(&self, room_id: &RoomId) -> Result<()> {
        self.hub.left.lock().expect("hub lock").push(room_id.clone());
        Ok(())
    }

    async fn send_typing(&self, room_id: &RoomId) -> Result<()> {
        // the real bus excludes the origin connection; other subscribers of
        // this hub play the part of the user's peers
        self.hub.push(ServerEvent::TypingStarted {
            room_id: room_id.clone(),
            user_id: self.user_id,
            display_name: format!("user:{}", self.user_id.0),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.hub.events.subscribe()
    }
}
