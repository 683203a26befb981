//! Chat Session Core - Headless Streaming Chat Sessions
//!
//! This crate holds the client-side session logic of a streaming chat
//! front-end, independent of any UI. A terminal client, a GUI, or a test
//! harness drives it with commands and renders the updates it publishes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Surfaces                                │
//! │        terminal client  ·  GUI shell  ·  headless tests           │
//! │                 │ SessionCommand        ▲ SessionUpdate           │
//! └─────────────────┼───────────────────────┼─────────────────────────┘
//!                   ▼                       │
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         ChatSession                               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │ SessionState │  │ Conversation │  │    ConnectionManager     │ │
//! │  │  (messages,  │  │   Backend    │  │  (one real-time channel, │ │
//! │  │  list, flags)│  │ REST / guest │  │   opened by policy)      │ │
//! │  └──────────────┘  └──────┬───────┘  └────────────┬─────────────┘ │
//! └───────────────────────────┼───────────────────────┼───────────────┘
//!                             ▼                       ▼
//!                       REST API (reqwest)     Socket.IO (ws / polling)
//! ```
//!
//! # Key Types
//!
//! - [`ChatSession`]: the reducer; consumes commands, transport events and
//!   the turn deadline
//! - [`SessionState`]: observable state with its message invariants
//! - [`ConnectionManager`]: opens and closes the real-time transport
//! - [`AuthManager`]: login, logout and the persisted guest flag
//! - [`ChatConfig`]: layered configuration (file, environment, CLI)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chat_session_core::{
//!     load_config, ApiClient, ChatSession, SessionCommand, SessionEnvironment,
//!     transport::SocketIoConnector,
//! };
//! use tokio::sync::mpsc;
//!
//! let config = load_config()?;
//! let api = Arc::new(ApiClient::new(config.backend_url())?);
//! let connector = SocketIoConnector::new(config.transport.clone(), Some(api.cookie_jar()));
//! let (updates_tx, mut updates) = mpsc::channel(256);
//! let (commands_tx, commands) = mpsc::channel(32);
//!
//! let session = ChatSession::new(
//!     api, connector, SessionEnvironment::in_memory(), config.session.clone(), updates_tx,
//! );
//! tokio::spawn(session.run(commands));
//!
//! commands_tx.send(SessionCommand::SetAuthenticated(true)).await?;
//! while let Some(update) = updates.recv().await {
//!     // render
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`api`]: typed REST endpoints
//! - [`auth`]: authentication and guest flag
//! - [`backend`]: conversation backends for authenticated and guest modes
//! - [`config`]: configuration loading
//! - [`connection`]: connection policy
//! - [`controller`]: the session reducer
//! - [`events`]: real-time wire events
//! - [`messages`]: messages, conversations and ids
//! - [`session`]: the state store
//! - [`storage`]: persisted flags and the location query
//! - [`transport`]: Socket.IO and in-process transports
//!
//! # No UI Dependencies
//!
//! Nothing here renders. Surfaces own presentation entirely.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod controller;
pub mod events;
pub mod messages;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use api::{AccountApi, ApiClient, ApiError, ApiUser, ConversationApi};
pub use auth::{AuthManager, AuthState};
pub use backend::{BackendError, BackendMode, BackendReply, ConversationBackend};
pub use connection::{ConnectionChange, ConnectionInputs, ConnectionManager};
pub use controller::{ChatSession, NotifyLevel, SessionCommand, SessionUpdate, TurnPhase};
pub use events::{IncomingEvent, OutgoingEvent};
pub use messages::{ChatMessage, Conversation, ConversationId, MessageId, Sender, SessionId};
pub use session::{derive_title, SessionSnapshot, SessionState, TitleDefaults};
pub use storage::{LocalStore, LocationSync, SessionEnvironment};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ChatConfig, ChatToml, ConfigError,
    ConfigOverrides, ConfigSource, SessionConfig,
};
