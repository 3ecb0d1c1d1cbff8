use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

/// Identity of one live socket connection. Minted per WebSocket upgrade,
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a two-party conversation, derived from the unordered
/// participant pair: `dm:{lo}:{hi}`. Both participants resolve to the same
/// room no matter who initiates, and participant authorization is decided
/// from the id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn direct(a: UserId, b: UserId) -> Self {
        let (lo, hi) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
        Self(format!("dm:{lo}:{hi}"))
    }

    /// Validates a raw room id received over the wire.
    pub fn parse(raw: &str) -> Option<Self> {
        let room = Self(raw.to_string());
        room.participants().map(|_| room)
    }

    /// The two participants encoded in the id, or `None` for a malformed id.
    pub fn participants(&self) -> Option<(UserId, UserId)> {
        let rest = self.0.strip_prefix("dm:")?;
        let (lo, hi) = rest.split_once(':')?;
        let lo: i64 = lo.parse().ok()?;
        let hi: i64 = hi.parse().ok()?;
        if lo <= 0 || lo >= hi {
            return None;
        }
        Some((UserId(lo), UserId(hi)))
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants()
            .map(|(a, b)| a == user_id || b == user_id)
            .unwrap_or(false)
    }

    pub fn counterparty(&self, user_id: UserId) -> Option<UserId> {
        let (a, b) = self.participants()?;
        if user_id == a {
            Some(b)
        } else if user_id == b {
            Some(a)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
