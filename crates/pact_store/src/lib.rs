//! pact_store: Local-first replicated message store for Pact Secure Channel
//!
//! # Storage strategy
//! - Ciphertext records live in clear SQLite columns so they can be ranged,
//!   merged and replicated without the vault.
//! - Decrypted bodies and ratchet snapshots are AES-256-GCM sealed under the
//!   vault key and never leave this replica.
//! - Ordering is by hybrid logical clock; merge is last-writer-wins on HLC.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on open.

pub mod clock;
pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod vault;

pub use clock::HlcClock;
pub use db::Store;
pub use error::StoreError;
pub use models::{MergeOutcome, SyncState};
pub use vault::Vault;
