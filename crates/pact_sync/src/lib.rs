//! pact_sync: Peer reconciliation for Pact Secure Channel
//!
//! One [`SyncEngine`] per session moves ciphertext records between the two
//! replicas of a pact over an already established byte channel.
//!
//! # Frame flow
//! - on connect: flush the offline queue, then `sync-request{lastHlc, digest}`
//! - `sync-request`  → `sync-response` with every record after `lastHlc`
//! - `sync-response` / `message` → merge into the store, surface peer records
//! - `ack` / `status-update` → monotonic status change
//! - `typing` → ephemeral, clears after a quiet period
//!
//! # Module layout
//! - `engine`: connection state, outbound queue, inbound handling
//! - `channel`: byte channel trait, in-process loopback, inbound pump
//! - `index`: mirrored id → HLC index and Merkle digest
//! - `config`: tunables
//! - `error`: unified error type

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;

pub use channel::{spawn_inbound_pump, ByteChannel, ChannelError, LoopbackChannel};
pub use config::SyncConfig;
pub use engine::{ConnectionState, SyncEngine, SyncEvent, Transmit};
pub use error::SyncError;
pub use index::SyncIndex;
