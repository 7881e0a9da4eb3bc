//! Delta protocol pushed from the fan-out engine to live subscribers.
//!
//! A subscription first receives one [`StreamEvent::Snapshot`], then a
//! sequence of [`StreamEvent::Delta`]s in commit order, and possibly a final
//! [`StreamEvent::Closed`]. Every delta carries the commit version of the
//! entity it describes so a consumer can drop anything it has already seen.

use serde::{Deserialize, Serialize};

use crate::types::{Chat, ChatId, Message, MessageId, User, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Add,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Entity {
    User(User),
    Chat(Chat),
    Message(Message),
}

/// Identity of an entity, independent of its version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum EntityKey {
    User(UserId),
    Chat(ChatId),
    Message(MessageId),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::User(u) => EntityKey::User(u.id.clone()),
            Entity::Chat(c) => EntityKey::Chat(c.id),
            Entity::Message(m) => EntityKey::Message(m.id),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Entity::User(u) => u.version,
            Entity::Chat(c) => c.version,
            Entity::Message(m) => m.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delta {
    pub kind: DeltaKind,
    pub entity: Entity,
    /// Commit version that produced this delta.
    pub version: u64,
}

impl Delta {
    pub fn new(kind: DeltaKind, entity: Entity, version: u64) -> Self {
        Self {
            kind,
            entity,
            version,
        }
    }
}

/// Why the engine ended a subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClosedReason {
    /// The viewer is no longer a member of the chat.
    Revoked,
    /// The chat was deleted.
    ChatDeleted,
    /// The consumer fell too far behind; resume from the last cursor.
    Lagged,
    /// The engine is shutting down.
    Shutdown,
}

impl std::fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ClosedReason::Revoked => "membership revoked",
            ClosedReason::ChatDeleted => "chat deleted",
            ClosedReason::Lagged => "subscriber lagged behind",
            ClosedReason::Shutdown => "server shutting down",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Initial state. `removed` lists entities deleted after the resume
    /// cursor (empty for a fresh subscription).
    Snapshot {
        items: Vec<Entity>,
        removed: Vec<EntityKey>,
        cursor: u64,
    },
    Delta(Delta),
    Closed { reason: ClosedReason },
}

impl StreamEvent {
    /// Position a consumer should resume from after handling this event.
    pub fn cursor(&self) -> Option<u64> {
        match self {
            StreamEvent::Snapshot { cursor, .. } => Some(*cursor),
            StreamEvent::Delta(delta) => Some(delta.version),
            StreamEvent::Closed { .. } => None,
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Snapshot { .. } => "snapshot",
            StreamEvent::Delta(_) => "delta",
            StreamEvent::Closed { .. } => "closed",
        }
    }
}
