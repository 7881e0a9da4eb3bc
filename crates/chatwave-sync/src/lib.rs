//! # chatwave-sync
//!
//! The realtime core the UI layer talks to.
//!
//! - [`ChatService`] is the async operation surface: every mutation commits
//!   through the store and is fanned out before the call returns.
//! - [`FanoutEngine`] keeps the live subscriptions and pushes ordered deltas
//!   into per-subscriber buffers without ever blocking a writer.
//! - [`ClientCache`] rebuilds a client's view (chat list, active
//!   conversation, transcript) from the streams it receives.
//! - [`suggest`] calls the external file-suggestion model.

pub mod cache;
pub mod fanout;
pub mod service;
pub mod suggest;

pub use cache::{ChatView, ClientCache, MessageView};
pub use fanout::{FanoutConfig, FanoutEngine, Filter, Subscription};
pub use service::ChatService;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, chatwave_shared::ChatError>;
