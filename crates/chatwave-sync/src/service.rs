//! Async operation surface of the messaging core.
//!
//! Every call runs its store work on the blocking pool while holding the
//! single database lock. Commits are published to the [`FanoutEngine`]
//! before that lock is released, and new subscriptions read their snapshot
//! and register under it too. So each subscriber sees deltas in commit
//! order, and none of them falls between a snapshot and the first delta.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chatwave_shared::{
    AuthProfile, Chat, ChatError, ChatId, ChatPatch, DeltaKind, Entity, EntityKey, Message,
    MessageId, NewChat, NewMessage, NewUser, StreamEvent, User, UserId, UserPatch,
};
use chatwave_store::Database;
use tracing::{debug, error, info};

use crate::fanout::{Change, FanoutConfig, FanoutEngine, Filter, Subscription};
use crate::Result;

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Mutex<Database>>,
    engine: FanoutEngine,
}

impl ChatService {
    pub fn new(db: Database, config: FanoutConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            engine: FanoutEngine::new(config),
        }
    }

    /// In-memory service, for tests and throwaway sessions.
    pub fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::new(db, FanoutConfig::default()))
    }

    pub fn engine(&self) -> &FanoutEngine {
        &self.engine
    }

    /// Close every live subscription with `Shutdown`.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &FanoutEngine) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| ChatError::Unavailable("store lock poisoned".into()))?;
            f(&guard, &engine)
        })
        .await
        .map_err(|e| {
            error!(op, error = %e, "store task failed");
            ChatError::Unavailable(format!("{op} did not complete"))
        })?
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        self.run("create_user", move |db, engine| {
            let user = db.create_user(&new)?;
            engine.publish(&Change::User {
                kind: DeltaKind::Add,
                user: user.clone(),
            });
            Ok(user)
        })
        .await
    }

    /// Provision the record of a freshly authenticated account on first
    /// sign-in; later sign-ins return the stored record unchanged.
    pub async fn ensure_user(&self, profile: AuthProfile) -> Result<User> {
        self.run("ensure_user", move |db, engine| {
            let (user, created) = db.ensure_user(&profile)?;
            if created {
                engine.publish(&Change::User {
                    kind: DeltaKind::Add,
                    user: user.clone(),
                });
            }
            Ok(user)
        })
        .await
    }

    pub async fn update_user(&self, actor: UserId, id: UserId, patch: UserPatch) -> Result<User> {
        self.run("update_user", move |db, engine| {
            let user = db.update_user(&actor, &id, &patch)?;
            engine.publish(&Change::User {
                kind: DeltaKind::Update,
                user: user.clone(),
            });
            Ok(user)
        })
        .await
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.run("get_user", move |db, _| Ok(db.get_user(&id)?))
            .await
    }

    /// One-shot read of the directory.
    pub async fn users(&self) -> Result<Vec<User>> {
        self.run("users", |db, _| Ok(db.list_users()?)).await
    }

    /// Live directory: a snapshot of every user, then adds and updates.
    pub async fn list_users(&self) -> Result<Subscription> {
        self.run("list_users", |db, engine| {
            let users = db.list_users()?;
            let snapshot = StreamEvent::Snapshot {
                items: users.into_iter().map(Entity::User).collect(),
                removed: vec![],
                cursor: db.current_version()?,
            };
            Ok(engine.register(Filter::Users, snapshot))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Chats
    // ------------------------------------------------------------------

    /// Create a chat. For a DM whose pair already has one, the existing
    /// chat is returned and nothing is published.
    pub async fn create_chat(&self, actor: UserId, new: NewChat) -> Result<Chat> {
        self.run("create_chat", move |db, engine| {
            let (chat, created) = db.create_chat(&new, &actor)?;
            if created {
                engine.publish(&Change::Chat {
                    added: chat.member_ids.clone(),
                    removed: BTreeSet::new(),
                    chat: chat.clone(),
                });
            } else {
                debug!(chat = %chat.id, "existing dm returned");
            }
            Ok(chat)
        })
        .await
    }

    /// A chat as seen by one of its members.
    pub async fn get_chat(&self, actor: UserId, id: ChatId) -> Result<Chat> {
        self.run("get_chat", move |db, _| {
            let chat = db.get_chat(&id)?;
            if !chat.is_member(&actor) {
                return Err(ChatError::forbidden(format!(
                    "user {actor} is not a member of this chat"
                )));
            }
            Ok(chat)
        })
        .await
    }

    pub async fn update_members(
        &self,
        actor: UserId,
        id: ChatId,
        members: BTreeSet<UserId>,
    ) -> Result<Chat> {
        self.run("update_members", move |db, engine| {
            let change = db.update_chat_members(&id, &members, &actor)?;
            engine.publish(&Change::Chat {
                chat: change.chat.clone(),
                added: change.added,
                removed: change.removed,
            });
            Ok(change.chat)
        })
        .await
    }

    pub async fn update_details(&self, actor: UserId, id: ChatId, patch: ChatPatch) -> Result<Chat> {
        self.run("update_details", move |db, engine| {
            let chat = db.update_chat_details(&id, &patch, &actor)?;
            engine.publish(&Change::Chat {
                chat: chat.clone(),
                added: BTreeSet::new(),
                removed: BTreeSet::new(),
            });
            Ok(chat)
        })
        .await
    }

    pub async fn delete_chat(&self, actor: UserId, id: ChatId) -> Result<()> {
        self.run("delete_chat", move |db, engine| {
            let chat = db.delete_chat(&id, &actor)?;
            engine.publish(&Change::ChatDeleted { chat });
            Ok(())
        })
        .await
    }

    /// Live chat list of `user`: a snapshot, then membership-aware deltas.
    pub async fn list_chats_for_user(&self, user: UserId) -> Result<Subscription> {
        self.run("list_chats_for_user", move |db, engine| {
            let chats = db.list_chats_for_user(&user)?;
            let snapshot = StreamEvent::Snapshot {
                items: chats.into_iter().map(Entity::Chat).collect(),
                removed: vec![],
                cursor: db.current_version()?,
            };
            Ok(engine.register(Filter::ChatsOf(user), snapshot))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn append(&self, actor: UserId, chat_id: ChatId, new: NewMessage) -> Result<Message> {
        self.run("append", move |db, engine| {
            let appended = db.append_message(&chat_id, &actor, &new)?;
            // Message and activity bump come from one commit; publish them
            // together so nobody sees one without the other.
            engine.publish_all(&[
                Change::Message {
                    kind: DeltaKind::Add,
                    message: appended.message.clone(),
                    audience: appended.chat.member_ids.clone(),
                },
                Change::Chat {
                    chat: appended.chat,
                    added: BTreeSet::new(),
                    removed: BTreeSet::new(),
                },
            ]);
            Ok(appended.message)
        })
        .await
    }

    pub async fn edit(
        &self,
        actor: UserId,
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
        expected_version: Option<u64>,
    ) -> Result<Message> {
        self.run("edit", move |db, engine| {
            let edited =
                db.edit_message(&chat_id, &message_id, &content, &actor, expected_version)?;
            engine.publish(&Change::Message {
                kind: DeltaKind::Update,
                message: edited.message.clone(),
                audience: edited.audience,
            });
            Ok(edited.message)
        })
        .await
    }

    pub async fn delete_message(&self, actor: UserId, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.run("delete_message", move |db, engine| {
            let deleted = db.delete_message(&chat_id, &message_id, &actor)?;
            engine.publish(&Change::Message {
                kind: DeltaKind::Remove,
                message: deleted.message,
                audience: deleted.audience,
            });
            Ok(())
        })
        .await
    }

    /// Live message log of a chat for one of its members.
    ///
    /// Without `since` the snapshot holds the whole log. With a cursor from
    /// an earlier subscription it holds only what changed after it, and
    /// `removed` lists messages deleted meanwhile.
    pub async fn stream_messages(
        &self,
        viewer: UserId,
        chat_id: ChatId,
        since: Option<u64>,
    ) -> Result<Subscription> {
        self.run("stream_messages", move |db, engine| {
            let batch = db.messages_since(&chat_id, &viewer, since)?;
            info!(
                chat = %chat_id,
                viewer = %viewer,
                messages = batch.messages.len(),
                cursor = batch.cursor,
                "message stream opened"
            );
            let snapshot = StreamEvent::Snapshot {
                items: batch.messages.into_iter().map(Entity::Message).collect(),
                removed: batch.removed.into_iter().map(EntityKey::Message).collect(),
                cursor: batch.cursor,
            };
            Ok(engine.register(
                Filter::MessagesIn {
                    chat: chat_id,
                    viewer,
                },
                snapshot,
            ))
        })
        .await
    }
}
