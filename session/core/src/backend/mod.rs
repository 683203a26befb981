//! Conversation Backends
//!
//! - [`RestBackend`]: stored conversations of a signed-in user
//! - [`RealtimeGuestBackend`]: in-memory guest conversations
//!
//! The session controller selects one based on the authentication state and
//! never branches on the mode for create/list/fetch.

pub mod guest;
pub mod rest;
pub mod traits;

pub use guest::RealtimeGuestBackend;
pub use rest::RestBackend;
pub use traits::{BackendError, BackendMode, BackendReply, ConversationBackend};
