//! Fan-out engine.
//!
//! Every live subscription owns a bounded queue. Publishing walks the
//! registered subscriptions, decides per subscriber which delta (if any) it
//! is entitled to, and pushes it without waiting on the consumer. A slow
//! consumer first has its pending updates coalesced, and past the hard
//! limit its subscription is closed with [`ClosedReason::Lagged`] so it can
//! resume from its last cursor.
//!
//! The engine never talks to storage. Callers publish [`Change`]s in commit
//! order, which is what keeps every subscriber's view ordered.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chatwave_shared::constants::{DEFAULT_SUBSCRIBER_HARD_LIMIT, DEFAULT_SUBSCRIBER_SOFT_LIMIT};
use chatwave_shared::{
    Chat, ChatId, ClosedReason, Delta, DeltaKind, Entity, Message, StreamEvent, User, UserId,
};
use futures::Stream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Per-subscriber buffer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Queue length above which pending updates of one entity are merged.
    pub soft_limit: usize,
    /// Queue length at which the subscription is closed as lagged.
    pub hard_limit: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            soft_limit: DEFAULT_SUBSCRIBER_SOFT_LIMIT,
            hard_limit: DEFAULT_SUBSCRIBER_HARD_LIMIT,
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The user directory.
    Users,
    /// Every chat the given user belongs to.
    ChatsOf(UserId),
    /// The message log of one chat, as seen by `viewer`.
    MessagesIn { chat: ChatId, viewer: UserId },
}

/// A committed mutation, as the engine needs to see it.
#[derive(Debug, Clone)]
pub enum Change {
    User {
        kind: DeltaKind,
        user: User,
    },
    /// A chat was created or changed. `added`/`removed` are the membership
    /// difference the commit introduced.
    Chat {
        chat: Chat,
        added: BTreeSet<UserId>,
        removed: BTreeSet<UserId>,
    },
    ChatDeleted {
        chat: Chat,
    },
    /// `audience` is the member set of the chat at the message's commit.
    Message {
        kind: DeltaKind,
        message: Message,
        audience: BTreeSet<UserId>,
    },
}

/// What a single subscriber gets out of a change.
#[derive(Debug, PartialEq)]
enum Routed {
    Skip,
    Deliver(Delta),
    Close(ClosedReason),
}

fn route(filter: &Filter, change: &Change) -> Routed {
    match (filter, change) {
        (Filter::Users, Change::User { kind, user }) => Routed::Deliver(Delta::new(
            *kind,
            Entity::User(user.clone()),
            user.version,
        )),

        (
            Filter::ChatsOf(user),
            Change::Chat {
                chat,
                added,
                removed,
            },
        ) => {
            let kind = if added.contains(user) {
                DeltaKind::Add
            } else if removed.contains(user) {
                DeltaKind::Remove
            } else if chat.is_member(user) {
                DeltaKind::Update
            } else {
                return Routed::Skip;
            };
            Routed::Deliver(Delta::new(kind, Entity::Chat(chat.clone()), chat.version))
        }
        (Filter::ChatsOf(user), Change::ChatDeleted { chat }) if chat.is_member(user) => {
            Routed::Deliver(Delta::new(
                DeltaKind::Remove,
                Entity::Chat(chat.clone()),
                chat.version,
            ))
        }

        (
            Filter::MessagesIn { chat, viewer },
            Change::Message {
                kind,
                message,
                audience,
            },
        ) if message.chat_id == *chat => {
            if audience.contains(viewer) {
                Routed::Deliver(Delta::new(
                    *kind,
                    Entity::Message(message.clone()),
                    message.version,
                ))
            } else {
                Routed::Close(ClosedReason::Revoked)
            }
        }
        (Filter::MessagesIn { chat, viewer }, Change::Chat { chat: changed, .. })
            if changed.id == *chat && !changed.is_member(viewer) =>
        {
            Routed::Close(ClosedReason::Revoked)
        }
        (Filter::MessagesIn { chat, .. }, Change::ChatDeleted { chat: deleted })
            if deleted.id == *chat =>
        {
            Routed::Close(ClosedReason::ChatDeleted)
        }

        _ => Routed::Skip,
    }
}

// ---------------------------------------------------------------------------
// Subscriber queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queue {
    events: VecDeque<StreamEvent>,
    /// A terminal `Closed` event has been queued.
    closed: bool,
}

struct Slot {
    queue: Mutex<Queue>,
    notify: Notify,
}

#[derive(Debug, PartialEq, Eq)]
enum Pushed {
    Queued,
    Coalesced,
    Lagged,
    AlreadyClosed,
}

impl Slot {
    fn new(first: StreamEvent) -> Self {
        let mut queue = Queue::default();
        queue.events.push_back(first);
        Self {
            queue: Mutex::new(queue),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A panicked holder cannot leave the queue half-written.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, delta: Delta, config: &FanoutConfig) -> Pushed {
        let outcome = {
            let mut queue = self.lock();
            if queue.closed {
                return Pushed::AlreadyClosed;
            }

            let len = queue.events.len();
            if len >= config.hard_limit {
                queue.events.push_back(StreamEvent::Closed {
                    reason: ClosedReason::Lagged,
                });
                queue.closed = true;
                Pushed::Lagged
            } else if len >= config.soft_limit && delta.kind == DeltaKind::Update {
                // Only an Update can stand in for an older Update; the newer
                // one moves to the back so versions stay increasing.
                let key = delta.entity.key();
                let last_same = queue.events.iter().rposition(|event| {
                    matches!(event, StreamEvent::Delta(queued) if queued.entity.key() == key)
                });
                let replaceable = last_same.filter(|&i| {
                    matches!(&queue.events[i], StreamEvent::Delta(queued) if queued.kind == DeltaKind::Update)
                });
                let outcome = match replaceable {
                    Some(i) => {
                        queue.events.remove(i);
                        Pushed::Coalesced
                    }
                    None => Pushed::Queued,
                };
                queue.events.push_back(StreamEvent::Delta(delta));
                outcome
            } else {
                queue.events.push_back(StreamEvent::Delta(delta));
                Pushed::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    fn close(&self, reason: ClosedReason) -> bool {
        {
            let mut queue = self.lock();
            if queue.closed {
                return false;
            }
            queue.events.push_back(StreamEvent::Closed { reason });
            queue.closed = true;
        }
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<StreamEvent> {
        self.lock().events.pop_front()
    }

    fn is_drained_and_closed(&self) -> bool {
        let queue = self.lock();
        queue.closed && queue.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Registered {
    filter: Filter,
    slot: Arc<Slot>,
}

struct EngineInner {
    config: FanoutConfig,
    subscribers: Mutex<HashMap<u64, Registered>>,
    next_id: AtomicU64,
}

impl EngineInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Registered>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared registry of live subscriptions.
#[derive(Clone)]
pub struct FanoutEngine {
    inner: Arc<EngineInner>,
}

impl FanoutEngine {
    pub fn new(config: FanoutConfig) -> Self {
        info!(
            soft_limit = config.soft_limit,
            hard_limit = config.hard_limit,
            "fan-out engine started"
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> FanoutConfig {
        self.inner.config
    }

    /// Register a subscription whose first event is `snapshot`.
    ///
    /// The caller must hold whatever lock serialises commits while it reads
    /// the snapshot and registers, so no commit falls between the two.
    pub fn register(&self, filter: Filter, snapshot: StreamEvent) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(snapshot));

        let mut subscribers = self.inner.subscribers();
        subscribers.insert(
            id,
            Registered {
                filter: filter.clone(),
                slot: slot.clone(),
            },
        );
        debug!(subscription = id, ?filter, total = subscribers.len(), "subscribed");

        Subscription {
            id,
            filter,
            slot,
            engine: Arc::downgrade(&self.inner),
        }
    }

    /// Push one committed change to every entitled subscriber.
    pub fn publish(&self, change: &Change) {
        self.publish_all(std::slice::from_ref(change));
    }

    /// Push several changes of one commit. No other publish can interleave.
    pub fn publish_all(&self, changes: &[Change]) {
        let config = self.inner.config;
        let mut subscribers = self.inner.subscribers();
        let mut finished = Vec::new();

        for (id, registered) in subscribers.iter() {
            for change in changes {
                match route(&registered.filter, change) {
                    Routed::Skip => {}
                    Routed::Deliver(delta) => match registered.slot.push(delta, &config) {
                        Pushed::Lagged => {
                            warn!(subscription = id, "subscriber lagged; closing");
                            finished.push(*id);
                            break;
                        }
                        Pushed::AlreadyClosed => {
                            finished.push(*id);
                            break;
                        }
                        Pushed::Queued | Pushed::Coalesced => {}
                    },
                    Routed::Close(reason) => {
                        registered.slot.close(reason);
                        debug!(subscription = id, %reason, "subscription closed");
                        finished.push(*id);
                        break;
                    }
                }
            }
        }

        for id in finished {
            subscribers.remove(&id);
        }
    }

    /// Close every live subscription.
    pub fn shutdown(&self) {
        let mut subscribers = self.inner.subscribers();
        for registered in subscribers.values() {
            registered.slot.close(ClosedReason::Shutdown);
        }
        info!(closed = subscribers.len(), "fan-out engine shut down");
        subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }
}

/// Handle to one live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    filter: Filter,
    slot: Arc<Slot>,
    engine: Weak<EngineInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Next event, waiting if none is queued. `None` once a `Closed` event
    /// has been handed out.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.slot.pop() {
                return Some(event);
            }
            if self.slot.is_drained_and_closed() {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Next queued event without waiting.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.slot.pop()
    }

    /// Every event queued right now.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        std::iter::from_fn(|| self.slot.pop()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            if engine.subscribers().remove(&self.id).is_some() {
                debug!(subscription = self.id, "unsubscribed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwave_shared::{ChatKind, MessageId};
    use chrono::Utc;

    fn user(id: &str, version: u64) -> User {
        User {
            id: UserId::from(id),
            name: id.to_string(),
            avatar: String::new(),
            bio: String::new(),
            created_at: Utc::now(),
            version,
        }
    }

    fn chat(members: &[&str], version: u64) -> Chat {
        Chat {
            id: ChatId::new(),
            kind: ChatKind::Group,
            name: "Team".into(),
            description: None,
            avatar: None,
            member_ids: members.iter().map(|m| UserId::from(*m)).collect(),
            created_by: UserId::from(members[0]),
            created_at: Utc::now(),
            last_message_at: None,
            version,
        }
    }

    fn message(chat: &Chat, author: &str, seq: u64, version: u64) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: chat.id,
            author_id: UserId::from(author),
            content: Some(format!("m{seq}")),
            attachment: None,
            created_at: Utc::now(),
            edited_at: None,
            seq,
            version,
        }
    }

    fn empty_snapshot() -> StreamEvent {
        StreamEvent::Snapshot {
            items: vec![],
            removed: vec![],
            cursor: 0,
        }
    }

    fn delta_kinds(events: &[StreamEvent]) -> Vec<DeltaKind> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => Some(d.kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_chat_membership_routing() {
        let engine = FanoutEngine::new(FanoutConfig::default());
        let mut a = engine.register(Filter::ChatsOf(UserId::from("a")), empty_snapshot());
        let mut c = engine.register(Filter::ChatsOf(UserId::from("c")), empty_snapshot());
        let mut z = engine.register(Filter::ChatsOf(UserId::from("z")), empty_snapshot());

        let mut team = chat(&["a", "b"], 1);
        engine.publish(&Change::Chat {
            chat: team.clone(),
            added: team.member_ids.clone(),
            removed: BTreeSet::new(),
        });

        team.member_ids.insert(UserId::from("c"));
        team.version = 2;
        engine.publish(&Change::Chat {
            chat: team.clone(),
            added: BTreeSet::from([UserId::from("c")]),
            removed: BTreeSet::new(),
        });

        team.member_ids.remove(&UserId::from("c"));
        team.version = 3;
        engine.publish(&Change::Chat {
            chat: team.clone(),
            added: BTreeSet::new(),
            removed: BTreeSet::from([UserId::from("c")]),
        });

        assert_eq!(
            delta_kinds(&a.drain()),
            vec![DeltaKind::Add, DeltaKind::Update, DeltaKind::Update]
        );
        assert_eq!(
            delta_kinds(&c.drain()),
            vec![DeltaKind::Add, DeltaKind::Remove]
        );
        assert!(delta_kinds(&z.drain()).is_empty());
    }

    #[test]
    fn test_message_to_non_member_closes_with_revoked() {
        let engine = FanoutEngine::new(FanoutConfig::default());
        let team = chat(&["a", "b"], 1);
        let mut sub = engine.register(
            Filter::MessagesIn {
                chat: team.id,
                viewer: UserId::from("b"),
            },
            empty_snapshot(),
        );

        engine.publish(&Change::Message {
            kind: DeltaKind::Add,
            message: message(&team, "a", 1, 2),
            audience: BTreeSet::from([UserId::from("a")]),
        });

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Closed {
                reason: ClosedReason::Revoked
            }
        );
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[test]
    fn test_chat_deletion_closes_message_stream() {
        let engine = FanoutEngine::new(FanoutConfig::default());
        let team = chat(&["a", "b"], 1);
        let mut sub = engine.register(
            Filter::MessagesIn {
                chat: team.id,
                viewer: UserId::from("a"),
            },
            empty_snapshot(),
        );

        engine.publish(&Change::ChatDeleted { chat: team });
        let events = sub.drain();
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Closed {
                reason: ClosedReason::ChatDeleted
            })
        );
    }

    #[test]
    fn test_soft_limit_coalesces_updates_only() {
        let engine = FanoutEngine::new(FanoutConfig {
            soft_limit: 2,
            hard_limit: 100,
        });
        let mut sub = engine.register(Filter::Users, empty_snapshot());

        engine.publish(&Change::User {
            kind: DeltaKind::Add,
            user: user("x", 1),
        });
        for v in 2..10 {
            engine.publish(&Change::User {
                kind: DeltaKind::Update,
                user: user("x", v),
            });
        }

        let events = sub.drain();
        // snapshot, the add and only the newest update
        assert_eq!(events.len(), 3);
        assert_eq!(
            delta_kinds(&events),
            vec![DeltaKind::Add, DeltaKind::Update]
        );
        assert_eq!(events.last().and_then(StreamEvent::cursor), Some(9));
    }

    #[test]
    fn test_soft_limit_keeps_removes_in_order() {
        let engine = FanoutEngine::new(FanoutConfig {
            soft_limit: 2,
            hard_limit: 100,
        });
        let mut sub = engine.register(Filter::Users, empty_snapshot());

        let kinds = [
            DeltaKind::Add,
            DeltaKind::Update,
            DeltaKind::Remove,
            DeltaKind::Add,
            DeltaKind::Update,
            DeltaKind::Update,
        ];
        for (v, kind) in (1..).zip(kinds) {
            engine.publish(&Change::User {
                kind,
                user: user("x", v),
            });
        }

        let events = sub.drain();
        assert_eq!(
            delta_kinds(&events),
            vec![
                DeltaKind::Add,
                DeltaKind::Update,
                DeltaKind::Remove,
                DeltaKind::Add,
                DeltaKind::Update
            ]
        );
        assert_eq!(events.last().and_then(StreamEvent::cursor), Some(6));
    }

    #[test]
    fn test_hard_limit_closes_as_lagged() {
        let engine = FanoutEngine::new(FanoutConfig {
            soft_limit: 2,
            hard_limit: 3,
        });
        let mut sub = engine.register(Filter::Users, empty_snapshot());

        for v in 1..=5 {
            engine.publish(&Change::User {
                kind: DeltaKind::Add,
                user: user(&format!("u{v}"), v),
            });
        }

        let events = sub.drain();
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Closed {
                reason: ClosedReason::Lagged
            })
        );
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let engine = FanoutEngine::new(FanoutConfig::default());
        let sub = engine.register(Filter::Users, empty_snapshot());
        assert_eq!(engine.subscriber_count(), 1);
        drop(sub);
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish_and_ends_after_close() {
        let engine = FanoutEngine::new(FanoutConfig::default());
        let mut sub = engine.register(Filter::Users, empty_snapshot());
        assert!(matches!(sub.next().await, Some(StreamEvent::Snapshot { .. })));

        let publisher = engine.clone();
        tokio::spawn(async move {
            publisher.publish(&Change::User {
                kind: DeltaKind::Add,
                user: user("late", 1),
            });
            publisher.shutdown();
        });

        assert!(matches!(sub.next().await, Some(StreamEvent::Delta(_))));
        assert_eq!(
            sub.next().await,
            Some(StreamEvent::Closed {
                reason: ClosedReason::Shutdown
            })
        );
        assert_eq!(sub.next().await, None);
    }
}
