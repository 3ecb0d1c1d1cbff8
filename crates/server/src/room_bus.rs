use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use shared::{
    domain::{ConnectionId, RoomId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Room fan-out seam. The in-memory [`RoomBus`] is the single-process
/// implementation; a multi-process deployment would back this trait with a
/// shared pub/sub backplane instead.
///
/// Delivery is at-most-once per currently joined connection. A connection
/// that is not joined at publish time never receives the message; durability
/// comes from the message store, not from here.
#[async_trait]
pub trait RoomFanout: Send + Sync {
    async fn join(&self, connection_id: ConnectionId, room_id: RoomId);
    async fn leave(&self, connection_id: ConnectionId, room_id: &RoomId);
    /// Implicit leave-all. Idempotent.
    async fn disconnect(&self, connection_id: ConnectionId);
    /// Delivers to every connection currently joined to the room, the
    /// publisher's own connections included.
    async fn publish(&self, room_id: &RoomId, event: ServerEvent);
    /// Best-effort typing relay; skips the originating connection.
    async fn publish_typing(&self, room_id: &RoomId, origin: ConnectionId, event: ServerEvent);
}

#[derive(Default)]
struct BusInner {
    senders: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl BusInner {
    fn deliver(&mut self, room_id: &RoomId, event: &ServerEvent, skip: Option<ConnectionId>) {
        let Some(subscribers) = self.rooms.get(room_id) else {
            return;
        };

        let mut dead = Vec::new();
        for connection_id in subscribers {
            if Some(*connection_id) == skip {
                continue;
            }
            match self.senders.get(connection_id) {
                Some(sender) => {
                    if sender.send(event.clone()).is_err() {
                        dead.push(*connection_id);
                    }
                }
                None => dead.push(*connection_id),
            }
        }

        for connection_id in dead {
            self.remove_connection(connection_id);
        }
    }

    fn remove_connection(&mut self, connection_id: ConnectionId) {
        self.senders.remove(&connection_id);
        if let Some(rooms) = self.joined.remove(&connection_id) {
            for room_id in rooms {
                if let Some(subscribers) = self.rooms.get_mut(&room_id) {
                    subscribers.remove(&connection_id);
                    if subscribers.is_empty() {
                        self.rooms.remove(&room_id);
                    }
                }
            }
        }
    }
}

/// In-memory per-room subscriber registry. Holds no durable state and is
/// fully reconstructed by clients rejoining after a restart.
#[derive(Default)]
pub struct RoomBus {
    inner: Mutex<BusInner>,
}

impl RoomBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection and returns the receiving end of its
    /// push channel. Dropping the receiver evicts the connection lazily on
    /// the next delivery attempt; `disconnect` evicts it eagerly.
    pub async fn register(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.senders.insert(connection_id, tx);
        inner.joined.entry(connection_id).or_default();
        rx
    }

    /// Direct push to one connection, used for per-connection error frames.
    pub async fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) {
        let inner = self.inner.lock().await;
        if let Some(sender) = inner.senders.get(&connection_id) {
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl RoomFanout for RoomBus {
    async fn join(&self, connection_id: ConnectionId, room_id: RoomId) {
        let mut inner = self.inner.lock().await;
        if !inner.senders.contains_key(&connection_id) {
            return;
        }
        inner
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(connection_id);
        inner
            .joined
            .entry(connection_id)
            .or_default()
            .insert(room_id.clone());
        debug!(%room_id, ?connection_id, "connection joined room");
    }

    async fn leave(&self, connection_id: ConnectionId, room_id: &RoomId) {
        let mut inner = self.inner.lock().await;
        if let Some(subscribers) = inner.rooms.get_mut(room_id) {
            subscribers.remove(&connection_id);
            if subscribers.is_empty() {
                inner.rooms.remove(room_id);
            }
        }
        if let Some(rooms) = inner.joined.get_mut(&connection_id) {
            rooms.remove(room_id);
        }
    }

    async fn disconnect(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.remove_connection(connection_id);
        debug!(?connection_id, "connection disconnected");
    }

    async fn publish(&self, room_id: &RoomId, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        inner.deliver(room_id, &event, None);
    }

    async fn publish_typing(&self, room_id: &RoomId, origin: ConnectionId, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        inner.deliver(room_id, &event, Some(origin));
    }
}

#[cfg(test)]
#[path = "tests/room_bus_tests.rs"]
mod tests;
