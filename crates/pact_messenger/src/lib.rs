//! pact_messenger: Per-session messaging for Pact Secure Channel
//!
//! [`MessageHandler`] is the one type an application talks to. It owns the
//! session ratchet, writes through the shared store and drives the sync
//! engine, and reports everything it learns as [`HandlerEvent`]s.
//!
//! # Module layout
//! - `handler`: send / receive pipeline, history, expiry sweeper
//! - `events`: events surfaced to the UI layer
//! - `config`: messenger tunables, loaded from JSON
//! - `error`: error categories surfaced to the application

pub mod config;
pub mod error;
pub mod events;
pub mod handler;

pub use config::MessengerConfig;
pub use error::MessengerError;
pub use events::HandlerEvent;
pub use handler::{HistoryEntry, MessageHandler, RatchetBootstrap, SessionParams};
