//! Client sync cache.
//!
//! Holds what one signed-in client has received from its three streams
//! (user directory, own chat list, active conversation) and the views the
//! UI renders from them. Every applied event rebuilds the views, so a user
//! record arriving after the chat that references it repairs the
//! "Unknown User" placeholder on the next event without a refetch.
//!
//! Events are deduplicated by commit version: anything not newer than what
//! the cache already holds for the same entity is ignored.

use std::collections::{BTreeMap, HashMap};

use chatwave_shared::constants::UNKNOWN_USER_NAME;
use chatwave_shared::validate::default_avatar;
use chatwave_shared::{
    Chat, ChatId, ChatKind, ClosedReason, DeltaKind, Entity, EntityKey, Message, MessageId,
    StreamEvent, User, UserId,
};
use chrono::{DateTime, Utc};
use tracing::debug;

/// A chat list row with its members joined in.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatView {
    pub chat: Chat,
    /// Group name, or the other participant's name for a DM.
    pub title: String,
    pub avatar: String,
    pub subtitle: String,
    pub users: Vec<User>,
}

/// A message with its author joined in.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub message: Message,
    pub author: User,
    /// Render the attachment inline instead of as a file chip.
    pub image_preview: bool,
    /// Attachment size as shown on the file chip.
    pub file_size: Option<String>,
}

impl MessageView {
    fn new(message: Message, author: User) -> Self {
        let attachment = message.attachment.as_ref();
        Self {
            image_preview: attachment.is_some_and(|a| a.is_image_previewable()),
            file_size: attachment.map(|a| a.human_size()),
            message,
            author,
        }
    }
}

struct ActiveChat {
    id: ChatId,
    /// Keyed by `seq`, which is the display order.
    messages: BTreeMap<u64, Message>,
    seq_of: HashMap<MessageId, u64>,
    cursor: Option<u64>,
    closed: Option<ClosedReason>,
}

impl ActiveChat {
    fn new(id: ChatId) -> Self {
        Self {
            id,
            messages: BTreeMap::new(),
            seq_of: HashMap::new(),
            cursor: None,
            closed: None,
        }
    }

    fn upsert(&mut self, message: Message) {
        if let Some(old_seq) = self.seq_of.insert(message.id, message.seq) {
            self.messages.remove(&old_seq);
        }
        self.messages.insert(message.seq, message);
    }

    fn remove(&mut self, id: &MessageId) {
        if let Some(seq) = self.seq_of.remove(id) {
            self.messages.remove(&seq);
        }
    }

    fn advance(&mut self, cursor: u64) {
        self.cursor = Some(self.cursor.map_or(cursor, |c| c.max(cursor)));
    }
}

pub struct ClientCache {
    me: UserId,
    users: HashMap<UserId, User>,
    chats: HashMap<ChatId, Chat>,
    active: Option<ActiveChat>,
    /// Highest version applied per entity, removals included.
    seen: HashMap<EntityKey, u64>,

    chat_list: Vec<ChatView>,
    message_views: Vec<MessageView>,
    transcript: String,
}

impl ClientCache {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            users: HashMap::new(),
            chats: HashMap::new(),
            active: None,
            seen: HashMap::new(),
            chat_list: Vec::new(),
            message_views: Vec::new(),
            transcript: String::new(),
        }
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    fn is_newer(&self, key: &EntityKey, version: u64) -> bool {
        self.seen.get(key).map_or(true, |&seen| version > seen)
    }

    fn mark(&mut self, key: EntityKey, version: u64) {
        let entry = self.seen.entry(key).or_insert(version);
        *entry = (*entry).max(version);
    }

    // ------------------------------------------------------------------
    // Stream input
    // ------------------------------------------------------------------

    /// Apply an event of the user directory stream.
    pub fn apply_users(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Snapshot { items, .. } => {
                for entity in items {
                    self.apply_entity(DeltaKind::Add, entity);
                }
            }
            StreamEvent::Delta(delta) => {
                if self.is_newer(&delta.entity.key(), delta.version) {
                    self.apply_entity(delta.kind, delta.entity);
                }
            }
            StreamEvent::Closed { reason } => debug!(%reason, "user stream closed"),
        }
        self.rebuild();
    }

    /// Apply an event of the chat list stream. A snapshot replaces the list.
    pub fn apply_chats(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Snapshot { items, .. } => {
                self.chats.clear();
                self.seen.retain(|key, _| !matches!(key, EntityKey::Chat(_)));
                for entity in items {
                    self.apply_entity(DeltaKind::Add, entity);
                }
            }
            StreamEvent::Delta(delta) => {
                if self.is_newer(&delta.entity.key(), delta.version) {
                    self.apply_entity(delta.kind, delta.entity);
                }
            }
            StreamEvent::Closed { reason } => debug!(%reason, "chat stream closed"),
        }
        self.rebuild();
    }

    /// Switch the conversation view to `chat`, dropping the previous one.
    pub fn activate(&mut self, chat: ChatId) {
        if self.active.as_ref().map(|a| a.id) != Some(chat) {
            self.seen
                .retain(|key, _| !matches!(key, EntityKey::Message(_)));
            self.active = Some(ActiveChat::new(chat));
            self.rebuild();
        }
    }

    pub fn deactivate(&mut self) {
        self.active = None;
        self.seen
            .retain(|key, _| !matches!(key, EntityKey::Message(_)));
        self.rebuild();
    }

    /// Apply an event of `chat`'s message stream. A snapshot is merged, so
    /// a resumed stream picks up where the last one stopped.
    ///
    /// Events of any chat other than the active one are dropped, and they
    /// never move the resume cursor.
    pub fn apply_messages(&mut self, chat: ChatId, event: StreamEvent) {
        if self.active_chat() != Some(chat) {
            debug!(chat = %chat, "message event for inactive chat dropped");
            return;
        }
        match event {
            StreamEvent::Snapshot {
                items,
                removed,
                cursor,
            } => {
                for entity in items {
                    if self.is_newer(&entity.key(), entity.version()) {
                        self.apply_entity(DeltaKind::Add, entity);
                    }
                }
                for key in removed {
                    if let EntityKey::Message(id) = key {
                        if let Some(active) = self.active.as_mut() {
                            active.remove(&id);
                        }
                    }
                }
                if let Some(active) = self.active.as_mut() {
                    active.closed = None;
                    active.advance(cursor);
                }
            }
            StreamEvent::Delta(delta) => {
                if !matches!(&delta.entity, Entity::Message(m) if m.chat_id == chat) {
                    return;
                }
                let version = delta.version;
                if self.is_newer(&delta.entity.key(), version) {
                    self.apply_entity(delta.kind, delta.entity);
                }
                if let Some(active) = self.active.as_mut() {
                    active.advance(version);
                }
            }
            StreamEvent::Closed { reason } => {
                debug!(%reason, chat = %chat, "message stream closed");
                if let Some(active) = self.active.as_mut() {
                    active.closed = Some(reason);
                }
            }
        }
        self.rebuild();
    }

    fn apply_entity(&mut self, kind: DeltaKind, entity: Entity) {
        let key = entity.key();
        let version = entity.version();
        match (kind, entity) {
            (DeltaKind::Remove, Entity::User(user)) => {
                self.users.remove(&user.id);
            }
            (_, Entity::User(user)) => {
                self.users.insert(user.id.clone(), user);
            }
            (DeltaKind::Remove, Entity::Chat(chat)) => {
                self.chats.remove(&chat.id);
            }
            (_, Entity::Chat(chat)) => {
                self.chats.insert(chat.id, chat);
            }
            (kind, Entity::Message(message)) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if message.chat_id != active.id {
                    return;
                }
                if kind == DeltaKind::Remove {
                    active.remove(&message.id);
                } else {
                    active.upsert(message);
                }
            }
        }
        self.mark(key, version);
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Cached user, or the "Unknown User" placeholder if it has not arrived.
    pub fn user(&self, id: &UserId) -> User {
        self.users
            .get(id)
            .cloned()
            .unwrap_or_else(|| placeholder_user(id))
    }

    /// Chats, most recently active first.
    pub fn chat_list(&self) -> &[ChatView] {
        &self.chat_list
    }

    /// Active conversation in log order.
    pub fn messages(&self) -> &[MessageView] {
        &self.message_views
    }

    /// The active conversation as `author: content` lines.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn active_chat(&self) -> Option<ChatId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Cursor to resume the active message stream from.
    pub fn message_cursor(&self) -> Option<u64> {
        self.active.as_ref().and_then(|a| a.cursor)
    }

    /// Why the active message stream ended, if it did.
    pub fn active_closed(&self) -> Option<ClosedReason> {
        self.active.as_ref().and_then(|a| a.closed)
    }

    fn rebuild(&mut self) {
        let mut chat_list: Vec<ChatView> = self
            .chats
            .values()
            .map(|chat| self.chat_view(chat))
            .collect();
        chat_list.sort_by(|a, b| {
            b.chat
                .activity_at()
                .cmp(&a.chat.activity_at())
                .then_with(|| a.chat.id.cmp(&b.chat.id))
        });
        self.chat_list = chat_list;

        self.message_views = match &self.active {
            Some(active) => active
                .messages
                .values()
                .map(|message| MessageView::new(message.clone(), self.user(&message.author_id)))
                .collect(),
            None => Vec::new(),
        };

        self.transcript = self
            .message_views
            .iter()
            .map(transcript_line)
            .collect::<Vec<_>>()
            .join("\n");
    }

    fn chat_view(&self, chat: &Chat) -> ChatView {
        let users: Vec<User> = chat.member_ids.iter().map(|id| self.user(id)).collect();

        match chat.kind {
            ChatKind::Dm => {
                let other = users
                    .iter()
                    .find(|u| u.id != self.me)
                    .or_else(|| users.first())
                    .cloned()
                    .unwrap_or_else(|| placeholder_user(&self.me));
                ChatView {
                    title: other.name.clone(),
                    avatar: other.avatar.clone(),
                    subtitle: other.bio.clone(),
                    chat: chat.clone(),
                    users,
                }
            }
            ChatKind::Group => ChatView {
                title: chat.name.clone(),
                avatar: chat
                    .avatar
                    .clone()
                    .unwrap_or_else(|| default_avatar(&chat.name)),
                subtitle: chat
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("{} members", chat.member_ids.len())),
                chat: chat.clone(),
                users,
            },
        }
    }
}

fn placeholder_user(id: &UserId) -> User {
    User {
        id: id.clone(),
        name: UNKNOWN_USER_NAME.to_string(),
        avatar: default_avatar(UNKNOWN_USER_NAME),
        bio: String::new(),
        created_at: DateTime::<Utc>::default(),
        version: 0,
    }
}

fn transcript_line(view: &MessageView) -> String {
    let message = &view.message;
    let body = match (&message.content, &message.attachment) {
        (Some(text), Some(file)) => format!("{text} [file: {}]", file.name),
        (Some(text), None) => text.clone(),
        (None, Some(file)) => format!("[file: {}]", file.name),
        (None, None) => String::new(),
    };
    format!("{}: {}", view.author.name, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwave_shared::{Attachment, Delta};
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn user(id: &str, name: &str, version: u64) -> User {
        User {
            id: UserId::from(id),
            name: name.to_string(),
            avatar: default_avatar(name),
            bio: format!("{name}'s bio"),
            created_at: Utc::now(),
            version,
        }
    }

    fn chat(kind: ChatKind, name: &str, members: &[&str], version: u64) -> Chat {
        Chat {
            id: ChatId::new(),
            kind,
            name: name.to_string(),
            description: None,
            avatar: None,
            member_ids: members.iter().map(|m| UserId::from(*m)).collect::<BTreeSet<_>>(),
            created_by: UserId::from(members[0]),
            created_at: Utc::now(),
            last_message_at: None,
            version,
        }
    }

    fn message(chat: &Chat, author: &str, seq: u64, text: &str) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: chat.id,
            author_id: UserId::from(author),
            content: Some(text.to_string()),
            attachment: None,
            created_at: Utc::now(),
            edited_at: None,
            seq,
            version: 100 + seq,
        }
    }

    fn snapshot(items: Vec<Entity>) -> StreamEvent {
        StreamEvent::Snapshot {
            items,
            removed: vec![],
            cursor: 0,
        }
    }

    fn delta(kind: DeltaKind, entity: Entity) -> StreamEvent {
        let version = entity.version();
        StreamEvent::Delta(Delta::new(kind, entity, version))
    }

    #[test]
    fn test_dm_title_repairs_after_user_arrives() {
        let mut cache = ClientCache::new(UserId::from("alice"));
        let dm = chat(ChatKind::Dm, "", &["alice", "bob"], 3);
        cache.apply_chats(snapshot(vec![Entity::Chat(dm)]));

        assert_eq!(cache.chat_list()[0].title, UNKNOWN_USER_NAME);

        cache.apply_users(delta(DeltaKind::Add, Entity::User(user("bob", "Bob", 4))));
        assert_eq!(cache.chat_list()[0].title, "Bob");
        assert_eq!(cache.chat_list()[0].subtitle, "Bob's bio");
    }

    #[test]
    fn test_chat_list_sorted_by_activity() {
        let mut cache = ClientCache::new(UserId::from("a"));
        let mut old = chat(ChatKind::Group, "Old", &["a", "b"], 1);
        old.created_at = Utc::now() - Duration::hours(2);
        let mut busy = chat(ChatKind::Group, "Busy", &["a", "b"], 2);
        busy.created_at = Utc::now() - Duration::hours(3);
        cache.apply_chats(snapshot(vec![
            Entity::Chat(old.clone()),
            Entity::Chat(busy.clone()),
        ]));
        assert_eq!(cache.chat_list()[0].title, "Old");

        busy.last_message_at = Some(Utc::now());
        busy.version = 5;
        cache.apply_chats(delta(DeltaKind::Update, Entity::Chat(busy)));
        let titles: Vec<_> = cache.chat_list().iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["Busy", "Old"]);
        assert_eq!(cache.chat_list()[0].subtitle, "2 members");
    }

    #[test]
    fn test_stale_delta_is_ignored() {
        let mut cache = ClientCache::new(UserId::from("a"));
        cache.apply_users(delta(DeltaKind::Add, Entity::User(user("b", "New", 7))));
        cache.apply_users(delta(DeltaKind::Update, Entity::User(user("b", "Old", 5))));
        assert_eq!(cache.user(&UserId::from("b")).name, "New");
    }

    #[test]
    fn test_removed_chat_leaves_list() {
        let mut cache = ClientCache::new(UserId::from("a"));
        let team = chat(ChatKind::Group, "Team", &["a", "b"], 1);
        cache.apply_chats(delta(DeltaKind::Add, Entity::Chat(team.clone())));
        let mut gone = team;
        gone.version = 2;
        cache.apply_chats(delta(DeltaKind::Remove, Entity::Chat(gone)));
        assert!(cache.chat_list().is_empty());
    }

    #[test]
    fn test_transcript_and_message_order() {
        let mut cache = ClientCache::new(UserId::from("a"));
        cache.apply_users(snapshot(vec![
            Entity::User(user("a", "Ann", 1)),
            Entity::User(user("b", "Ben", 2)),
        ]));
        let team = chat(ChatKind::Group, "Team", &["a", "b"], 3);
        cache.activate(team.id);

        let first = message(&team, "a", 1, "hello");
        let mut second = message(&team, "b", 2, "");
        second.content = None;
        second.attachment = Some(Attachment {
            name: "report.pdf".into(),
            size_bytes: 10,
            mime_type: "application/pdf".into(),
            locator: "https://files/report.pdf".into(),
        });

        // Delivered out of order; the view follows seq.
        cache.apply_messages(team.id, delta(DeltaKind::Add, Entity::Message(second.clone())));
        cache.apply_messages(team.id, delta(DeltaKind::Add, Entity::Message(first.clone())));
        // A replay of the same version changes nothing.
        cache.apply_messages(team.id, delta(DeltaKind::Add, Entity::Message(first)));

        assert_eq!(cache.messages().len(), 2);
        assert_eq!(cache.transcript(), "Ann: hello\nBen: [file: report.pdf]");
        assert_eq!(cache.message_cursor(), Some(second.version));

        let file = &cache.messages()[1];
        assert!(!file.image_preview);
        assert_eq!(file.file_size.as_deref(), Some("10 B"));
        assert_eq!(cache.messages()[0].file_size, None);
    }

    #[test]
    fn test_image_attachment_is_previewed() {
        let mut cache = ClientCache::new(UserId::from("a"));
        let team = chat(ChatKind::Group, "Team", &["a", "b"], 1);
        cache.activate(team.id);

        let mut photo = message(&team, "a", 1, "look");
        photo.attachment = Some(Attachment {
            name: "cat.png".into(),
            size_bytes: 45 * 1024,
            mime_type: "image/png".into(),
            locator: "data:image/png;base64,AAAA".into(),
        });
        cache.apply_messages(team.id, delta(DeltaKind::Add, Entity::Message(photo)));

        let view = &cache.messages()[0];
        assert!(view.image_preview);
        assert_eq!(view.file_size.as_deref(), Some("45 KB"));
    }

    #[test]
    fn test_late_author_repairs_message_views() {
        let mut cache = ClientCache::new(UserId::from("a"));
        let team = chat(ChatKind::Group, "Team", &["a", "b"], 1);
        cache.activate(team.id);
        cache.apply_messages(
            team.id,
            delta(DeltaKind::Add, Entity::Message(message(&team, "b", 1, "hi"))),
        );

        assert_eq!(cache.messages()[0].author.name, UNKNOWN_USER_NAME);
        assert_eq!(cache.transcript(), format!("{UNKNOWN_USER_NAME}: hi"));

        cache.apply_users(delta(DeltaKind::Add, Entity::User(user("b", "Ben", 2))));
        assert_eq!(cache.messages()[0].author.name, "Ben");
        assert_eq!(cache.transcript(), "Ben: hi");

        cache.apply_users(delta(DeltaKind::Update, Entity::User(user("b", "Benjamin", 3))));
        assert_eq!(cache.messages()[0].author.name, "Benjamin");
        assert_eq!(cache.transcript(), "Benjamin: hi");
    }

    #[test]
    fn test_other_chat_events_leave_active_chat_alone() {
        let mut cache = ClientCache::new(UserId::from("a"));
        let active = chat(ChatKind::Group, "Active", &["a", "b"], 1);
        let other = chat(ChatKind::Group, "Other", &["a", "b"], 2);
        cache.activate(active.id);
        cache.apply_messages(
            active.id,
            StreamEvent::Snapshot {
                items: vec![],
                removed: vec![],
                cursor: 5,
            },
        );

        // Leftovers from the previous chat's stream, tagged with either id.
        let stray = message(&other, "b", 2, "elsewhere");
        cache.apply_messages(other.id, delta(DeltaKind::Add, Entity::Message(stray.clone())));
        cache.apply_messages(active.id, delta(DeltaKind::Add, Entity::Message(stray)));
        cache.apply_messages(
            other.id,
            StreamEvent::Snapshot {
                items: vec![],
                removed: vec![],
                cursor: 50,
            },
        );
        cache.apply_messages(
            other.id,
            StreamEvent::Closed {
                reason: ClosedReason::Revoked,
            },
        );

        assert_eq!(cache.message_cursor(), Some(5));
        assert_eq!(cache.active_closed(), None);
        assert!(cache.messages().is_empty());
        assert_eq!(cache.transcript(), "");
    }

    #[test]
    fn test_closed_stream_is_reported() {
        let mut cache = ClientCache::new(UserId::from("a"));
        let team = chat(ChatKind::Group, "Team", &["a", "b"], 1);
        cache.activate(team.id);
        cache.apply_messages(team.id, StreamEvent::Closed {
            reason: ClosedReason::Revoked,
        });
        assert_eq!(cache.active_closed(), Some(ClosedReason::Revoked));
    }
}
