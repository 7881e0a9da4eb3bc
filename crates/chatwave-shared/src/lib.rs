//! # chatwave-shared
//!
//! Plain data types shared by the store, the sync core and the server:
//! identifiers, domain records, the delta protocol pushed to live
//! subscribers, and the error taxonomy every operation reports through.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
pub mod validate;

pub use error::{ChatError, ErrorKind};
pub use protocol::{ClosedReason, Delta, DeltaKind, Entity, EntityKey, StreamEvent};
pub use types::*;
