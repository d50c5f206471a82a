//! Message store over SQLite via sqlx.
//!
//! Ciphertext records are stored in clear columns so they can be queried
//! and replicated; decrypted bodies and ratchet snapshots go through the
//! [`Vault`]. Every query is namespaced by `session_id`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use zeroize::Zeroizing;

use pact_crypto::RatchetSnapshot;
use pact_proto::{Hlc, MessageStatus, Origin, StoredMessage};

use crate::{
    clock::HlcClock,
    error::StoreError,
    migrations,
    models::{origin_str, MergeOutcome, MessageRow, SyncState, MESSAGE_COLUMNS},
    vault::Vault,
};

/// Store handle. Clones share the pool, vault and clock.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    vault: Vault,
    clock: Arc<HlcClock>,
}

impl Store {
    /// Open (or create) the database at `db_path` and apply migrations.
    ///
    /// WAL and foreign keys are connection options; SQLite refuses to change
    /// `journal_mode` inside the transaction a migration runs in.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(opts).await?;
        migrations::run(&pool).await?;
        tracing::info!(path = %db_path.display(), "message store opened");
        Ok(Self::from_parts(pool, vault))
    }

    /// Private in-memory database. A single connection that never idles
    /// out, since each in-memory connection is its own database.
    pub async fn open_in_memory(vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        migrations::run(&pool).await?;
        Ok(Self::from_parts(pool, vault))
    }

    fn from_parts(pool: SqlitePool, vault: Vault) -> Self {
        Self {
            pool,
            vault,
            clock: Arc::new(HlcClock::new()),
        }
    }

    /// Replace the HLC source.
    pub fn with_clock(mut self, clock: HlcClock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn clock(&self) -> &HlcClock {
        &self.clock
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Order on `(time, counter)`; the tiebreaker is ignored.
    pub fn compare(a: &Hlc, b: &Hlc) -> std::cmp::Ordering {
        a.compare(b)
    }

    // ── Records ──────────────────────────────────────────────────────────────

    /// Persist a locally authored record. Assigns a UUID when `id` is empty
    /// and always stamps a fresh HLC.
    pub async fn create(&self, mut record: StoredMessage) -> Result<StoredMessage, StoreError> {
        if record.id.is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        record.hlc = self.clock.now();
        record.origin = Origin::Local;

        let mut conn = self.pool.acquire().await?;
        if !insert_row(&mut conn, &record).await? {
            return Err(StoreError::Duplicate(record.id));
        }
        tracing::debug!(session = %record.session_id, id = %record.id, hlc = %record.hlc, "record created");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
        sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(StoredMessage::try_from)
            .transpose()
    }

    /// Records whose HLC wall time falls in `[from, to)`, oldest first.
    pub async fn range(
        &self,
        session_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE session_id = ? AND hlc_millis >= ? AND hlc_millis < ? \
             ORDER BY hlc_millis, hlc_counter, hlc_node LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(session_id)
            .bind(from.timestamp_millis())
            .bind(to.timestamp_millis())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Records strictly after `after` in `(time, counter)` order; every
    /// record of the session when `after` is `None`.
    pub async fn since(&self, session_id: &str, after: Option<Hlc>) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = match after {
            Some(after) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE session_id = ? AND (hlc_millis > ? OR (hlc_millis = ? AND hlc_counter > ?)) \
                     ORDER BY hlc_millis, hlc_counter, hlc_node"
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(session_id)
                    .bind(after.millis as i64)
                    .bind(after.millis as i64)
                    .bind(i64::from(after.counter))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? \
                     ORDER BY hlc_millis, hlc_counter, hlc_node"
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(session_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// `(id, hlc)` of every record in the session, for the sync index.
    pub async fn index_entries(&self, session_id: &str) -> Result<Vec<(String, Hlc)>, StoreError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, hlc_millis, hlc_counter, hlc_node FROM messages WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, m, c, n)| (id, Hlc::new(m as u64, c as u32, n as u32)))
            .collect())
    }

    /// Flip every delivered record addressed to `recipient_id` to read.
    /// Returns the ids that changed.
    pub async fn mark_read(&self, session_id: &str, recipient_id: &str) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE session_id = ? AND recipient_id = ? AND status = 'delivered'",
        )
        .bind(session_id)
        .bind(recipient_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE messages SET status = 'read' \
             WHERE session_id = ? AND recipient_id = ? AND status = 'delivered'",
        )
        .bind(session_id)
        .bind(recipient_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if !ids.is_empty() {
            tracing::debug!(session = %session_id, count = ids.len(), "marked read");
        }
        Ok(ids)
    }

    /// Apply a status change if it moves forward. Returns whether it did.
    pub async fn update_status(&self, id: &str, status: MessageStatus) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let current = MessageStatus::parse(&current).ok_or_else(|| StoreError::Corrupt {
            id: id.to_string(),
            reason: "unknown status".into(),
        })?;
        if !current.can_advance_to(status) {
            return Ok(false);
        }
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Last-writer-wins merge of a peer's record.
    ///
    /// Absent: insert as remote origin. Present: adopt the incoming fields
    /// only if its HLC supersedes the stored one, keeping the stored origin
    /// and local tags. Otherwise discard. A failed lookup counts as absent;
    /// the insert then degrades to a no-op if the row does exist.
    pub async fn merge(&self, incoming: &StoredMessage) -> Result<MergeOutcome, StoreError> {
        if !self.clock.observe(&incoming.hlc) {
            tracing::warn!(id = %incoming.id, millis = incoming.hlc.millis, "remote stamp too far ahead, record refused");
            return Ok(MergeOutcome::Rejected);
        }
        if incoming.is_expired(Utc::now()) {
            tracing::debug!(id = %incoming.id, "expired record dropped");
            return Ok(MergeOutcome::Rejected);
        }

        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
        let existing = match sqlx::query_as::<_, MessageRow>(&sql)
            .bind(&incoming.id)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row.and_then(|r| match StoredMessage::try_from(r) {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(id = %incoming.id, "unreadable row treated as absent: {e}");
                    None
                }
            }),
            Err(e) => {
                tracing::warn!(id = %incoming.id, "merge lookup failed, treating as absent: {e}");
                None
            }
        };

        let outcome = match existing {
            None => {
                let mut record = incoming.clone();
                record.origin = Origin::Remote;
                record.undecryptable = false;
                if insert_row(&mut tx, &record).await? {
                    MergeOutcome::Inserted
                } else {
                    MergeOutcome::Ignored
                }
            }
            Some(current) if incoming.hlc.supersedes(&current.hlc) => {
                sqlx::query(
                    "UPDATE messages SET session_id = ?, sender_id = ?, recipient_id = ?, \
                     dh_public_key = ?, previous_chain_length = ?, message_index = ?, nonce = ?, \
                     ciphertext = ?, key_version = ?, sent_at = ?, status = ?, hlc_millis = ?, \
                     hlc_counter = ?, hlc_node = ?, expires_at_ms = ? WHERE id = ?",
                )
                .bind(&incoming.session_id)
                .bind(&incoming.sender_id)
                .bind(&incoming.recipient_id)
                .bind(&incoming.dh_public_key)
                .bind(incoming.previous_chain_length as i64)
                .bind(incoming.message_index as i64)
                .bind(&incoming.nonce)
                .bind(&incoming.ciphertext)
                .bind(i64::from(incoming.key_version))
                .bind(incoming.sent_at)
                .bind(incoming.status.as_str())
                .bind(incoming.hlc.millis as i64)
                .bind(i64::from(incoming.hlc.counter))
                .bind(i64::from(incoming.hlc.node))
                .bind(incoming.expires_at.map(|t| t.timestamp_millis()))
                .bind(&incoming.id)
                .execute(&mut *tx)
                .await?;
                MergeOutcome::Updated
            }
            Some(_) => MergeOutcome::Ignored,
        };
        tx.commit().await?;
        tracing::debug!(id = %incoming.id, hlc = %incoming.hlc, ?outcome, "merged record");
        Ok(outcome)
    }

    pub async fn tag_undecryptable(&self, id: &str, undecryptable: bool) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE messages SET undecryptable = ? WHERE id = ?")
            .bind(undecryptable)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn undecryptable(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? AND undecryptable = 1 \
             ORDER BY hlc_millis, hlc_counter, hlc_node"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Local records by `sender_id` that never made it out: pending or failed.
    pub async fn unsent(&self, session_id: &str, sender_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE session_id = ? AND sender_id = ? AND origin = 'local' AND status IN ('pending', 'failed') \
             ORDER BY hlc_millis, hlc_counter, hlc_node"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(session_id)
            .bind(sender_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Delete records whose expiry has passed. Returns the deleted ids.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM messages WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?")
                .bind(now.timestamp_millis())
                .fetch_all(&mut *tx)
                .await?;
        sqlx::query("DELETE FROM messages WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?")
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "expired messages deleted");
        }
        Ok(ids)
    }

    /// Drop everything held for a session: records, bodies, sync and ratchet state.
    pub async fn wipe_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["message_bodies", "messages", "sync_state", "ratchet_states"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?"))
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(session = %session_id, "session wiped");
        Ok(())
    }

    // ── Sealed columns ───────────────────────────────────────────────────────

    pub async fn put_body(&self, message_id: &str, session_id: &str, body: &[u8]) -> Result<(), StoreError> {
        let sealed = self.vault.seal(body, &format!("body:{message_id}")).await?;
        sqlx::query(
            "INSERT INTO message_bodies (message_id, session_id, body_enc, stored_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(message_id) DO UPDATE SET body_enc = excluded.body_enc, stored_at = excluded.stored_at",
        )
        .bind(message_id)
        .bind(session_id)
        .bind(sealed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn body(&self, message_id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let sealed: Option<String> =
            sqlx::query_scalar("SELECT body_enc FROM message_bodies WHERE message_id = ?")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        match sealed {
            Some(s) => Ok(Some(self.vault.open(&s, &format!("body:{message_id}")).await?)),
            None => Ok(None),
        }
    }

    pub async fn save_ratchet(&self, session_id: &str, snapshot: &RatchetSnapshot) -> Result<(), StoreError> {
        let json = Zeroizing::new(serde_json::to_vec(snapshot)?);
        let sealed = self.vault.seal(&json, &format!("ratchet:{session_id}")).await?;
        sqlx::query(
            "INSERT INTO ratchet_states (session_id, snapshot_enc, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET snapshot_enc = excluded.snapshot_enc, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(sealed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_ratchet(&self, session_id: &str) -> Result<Option<RatchetSnapshot>, StoreError> {
        let sealed: Option<String> =
            sqlx::query_scalar("SELECT snapshot_enc FROM ratchet_states WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        match sealed {
            Some(s) => {
                let json = self.vault.open(&s, &format!("ratchet:{session_id}")).await?;
                Ok(Some(serde_json::from_slice(&json)?))
            }
            None => Ok(None),
        }
    }

    // ── Sync state ───────────────────────────────────────────────────────────

    pub async fn load_sync_state(&self, session_id: &str) -> Result<SyncState, StoreError> {
        let json: Option<String> = sqlx::query_scalar("SELECT state_json FROM sync_state WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Ok(SyncState::default()),
        }
    }

    pub async fn save_sync_state(&self, session_id: &str, state: &SyncState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (session_id, state_json, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(serde_json::to_string(state)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Insert unless the id already exists. Returns whether a row was written.
async fn insert_row(conn: &mut sqlx::SqliteConnection, record: &StoredMessage) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "INSERT INTO messages (id, session_id, sender_id, recipient_id, dh_public_key, \
         previous_chain_length, message_index, nonce, ciphertext, key_version, sent_at, status, \
         hlc_millis, hlc_counter, hlc_node, origin, expires_at_ms, undecryptable) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(&record.id)
    .bind(&record.session_id)
    .bind(&record.sender_id)
    .bind(&record.recipient_id)
    .bind(&record.dh_public_key)
    .bind(record.previous_chain_length as i64)
    .bind(record.message_index as i64)
    .bind(&record.nonce)
    .bind(&record.ciphertext)
    .bind(i64::from(record.key_version))
    .bind(record.sent_at)
    .bind(record.status.as_str())
    .bind(record.hlc.millis as i64)
    .bind(i64::from(record.hlc.counter))
    .bind(i64::from(record.hlc.node))
    .bind(origin_str(record.origin))
    .bind(record.expires_at.map(|t| t.timestamp_millis()))
    .bind(record.undecryptable)
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}
