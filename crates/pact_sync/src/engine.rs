//! Per-session sync engine.
//!
//! Owns the connection state, the bounded offline queue and the mirrored
//! index for one session. Outbound frames go through a [`ByteChannel`];
//! inbound frames arrive via [`SyncEngine::handle_inbound`]. Everything the
//! application should react to is reported as a [`SyncEvent`].
//!
//! The state lock is a `parking_lot::Mutex` and is never held across an
//! await. Sends are serialised by a separate async lock so queued frames
//! leave in order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use pact_proto::{codec, Hlc, MessageStatus, StoredMessage, SyncFrame, SyncMessage};
use pact_store::{Store, StoreError, SyncState};

use crate::{
    channel::{ByteChannel, ChannelError},
    config::SyncConfig,
    error::SyncError,
    index::SyncIndex,
};

/// Records per sync-response frame.
const RESPONSE_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the transport failed for good.
    Error,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer-authored record was inserted or updated by reconciliation.
    Record(StoredMessage),
    Typing(bool),
    ConnectionChanged(ConnectionState),
    StatusChanged { id: String, status: MessageStatus },
    /// A local record left the outbound queue.
    Transmitted { id: String },
    /// Queued frames keep failing; the user should trigger a re-sync.
    ResyncRequired { pending: Vec<String> },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transmit {
    Sent,
    Queued,
}

struct Queued {
    message: SyncMessage,
    attempts: u32,
}

impl Queued {
    fn record_id(&self) -> Option<&str> {
        match &self.message {
            SyncMessage::Message { record } => Some(&record.id),
            _ => None,
        }
    }
}

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<dyn ByteChannel>>,
    /// Bumped on every connect; identifies which channel a loss or send
    /// failure belongs to.
    generation: u64,
    outbound: VecDeque<Queued>,
    index: SyncIndex,
    sync_state: SyncState,
    resync_flagged: bool,
}

impl Inner {
    fn live_channel(&self) -> Option<(Arc<dyn ByteChannel>, u64)> {
        match (self.state, &self.channel) {
            (ConnectionState::Connected, Some(channel)) => Some((channel.clone(), self.generation)),
            _ => None,
        }
    }
}

pub struct SyncEngine {
    session_id: String,
    local_id: String,
    store: Store,
    config: SyncConfig,
    inner: Mutex<Inner>,
    send_lock: tokio::sync::Mutex<()>,
    typing_gen: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncEngine {
    /// Load the index and sync state for `session_id`. `local_id` is this
    /// replica's sender id; records carrying it are never surfaced.
    pub async fn open(
        session_id: &str,
        local_id: &str,
        store: Store,
        config: SyncConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncEvent>), SyncError> {
        let index = SyncIndex::from_entries(store.index_entries(session_id).await?);
        let sync_state = store.load_sync_state(session_id).await?;
        let (events, rx) = mpsc::unbounded_channel();
        tracing::info!(session = %session_id, records = index.len(), "sync engine opened");

        let engine = Self {
            session_id: session_id.to_string(),
            local_id: local_id.to_string(),
            store,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                channel: None,
                generation: 0,
                outbound: VecDeque::new(),
                index,
                sync_state,
                resync_flagged: false,
            }),
            send_lock: tokio::sync::Mutex::new(()),
            typing_gen: Arc::new(AtomicU64::new(0)),
            events,
        };
        Ok((engine, rx))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().outbound.len()
    }

    pub fn digest(&self) -> String {
        self.inner.lock().index.digest()
    }

    pub fn last_reconciled(&self) -> Option<Hlc> {
        self.inner.lock().sync_state.last_reconciled
    }

    fn emit(&self, event: SyncEvent) {
        // Receiver gone means the owner is shutting down
        let _ = self.events.send(event);
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            inner.state = state;
            self.emit(SyncEvent::ConnectionChanged(state));
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Attach a channel, flush the offline queue, then ask the peer for
    /// everything after the last reconciled HLC.
    ///
    /// Returns the channel generation. Whatever drives the inbound side
    /// passes it back to [`SyncEngine::on_channel_lost`].
    pub async fn connect(&self, channel: Arc<dyn ByteChannel>) -> Result<u64, SyncError> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Error {
                return Err(SyncError::Terminal);
            }
            inner.generation += 1;
            self.set_state(&mut inner, ConnectionState::Connecting);
            inner.channel = Some(channel);
            self.set_state(&mut inner, ConnectionState::Connected);
            inner.generation
        };
        tracing::info!(session = %self.session_id, generation, queued = self.queued(), "sync channel connected");
        self.flush().await?;
        self.request_sync().await?;
        Ok(generation)
    }

    /// Stop transmitting. Queued frames are kept for the next connection.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.channel = None;
        if inner.state != ConnectionState::Error {
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
        tracing::info!(session = %self.session_id, queued = inner.outbound.len(), "sync channel disconnected");
    }

    /// Inbound side of the channel attached as `generation` closed. A
    /// channel replaced by a later connect no longer affects the state.
    pub fn on_channel_lost(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!(session = %self.session_id, generation, "superseded channel closed");
            return;
        }
        if matches!(inner.state, ConnectionState::Connected | ConnectionState::Connecting) {
            inner.channel = None;
            self.set_state(&mut inner, ConnectionState::Disconnected);
            tracing::warn!(session = %self.session_id, "sync channel lost");
        }
    }

    fn on_send_failure(&self, generation: u64, err: &ChannelError) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!(session = %self.session_id, generation, "send failed on superseded channel: {err}");
            return;
        }
        inner.channel = None;
        match err {
            ChannelError::Closed => {
                if inner.state != ConnectionState::Error {
                    self.set_state(&mut inner, ConnectionState::Disconnected);
                }
                tracing::warn!(session = %self.session_id, "send failed, channel closed");
            }
            ChannelError::Fatal(reason) => {
                self.set_state(&mut inner, ConnectionState::Error);
                tracing::error!(session = %self.session_id, "channel failed: {reason}");
                self.emit(SyncEvent::Error(format!("channel failed: {reason}")));
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    fn encode(&self, message: &SyncMessage) -> Result<Vec<u8>, SyncError> {
        Ok(codec::encode_frame(&SyncFrame::new(&self.session_id, message)?)?)
    }

    /// Send immediately if connected. Returns `false` when offline.
    async fn send_now(&self, message: &SyncMessage) -> Result<bool, SyncError> {
        let bytes = self.encode(message)?;
        let _guard = self.send_lock.lock().await;
        let Some((channel, generation)) = self.inner.lock().live_channel() else {
            return Ok(false);
        };
        match channel.send(bytes).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.on_send_failure(generation, &e);
                Err(e.into())
            }
        }
    }

    fn enqueue(&self, message: SyncMessage) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        if inner.outbound.len() >= self.config.max_outbound {
            tracing::warn!(session = %self.session_id, "outbound queue full");
            return Err(SyncError::QueueFull {
                limit: self.config.max_outbound,
            });
        }
        inner.outbound.push_back(Queued { message, attempts: 0 });
        Ok(())
    }

    fn note_failed_attempt(&self) {
        let mut inner = self.inner.lock();
        let Some(front) = inner.outbound.front_mut() else {
            return;
        };
        front.attempts += 1;
        if front.attempts >= self.config.max_send_attempts && !inner.resync_flagged {
            inner.resync_flagged = true;
            let pending: Vec<String> = inner
                .outbound
                .iter()
                .filter_map(|q| q.record_id().map(str::to_string))
                .collect();
            tracing::warn!(session = %self.session_id, pending = pending.len(), "send attempts exhausted, re-sync required");
            self.emit(SyncEvent::ResyncRequired { pending });
        }
    }

    /// Send queued frames in order until the queue drains or a send fails.
    /// Returns how many left the queue.
    pub async fn flush(&self) -> Result<usize, SyncError> {
        let _guard = self.send_lock.lock().await;
        let mut sent = 0;
        loop {
            let (channel, generation, message) = {
                let inner = self.inner.lock();
                let Some((channel, generation)) = inner.live_channel() else {
                    break;
                };
                let Some(front) = inner.outbound.front() else {
                    break;
                };
                (channel, generation, front.message.clone())
            };

            let bytes = match self.encode(&message) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Cannot ever be encoded; drop it so the queue keeps moving
                    self.inner.lock().outbound.pop_front();
                    tracing::error!(session = %self.session_id, "dropping unencodable frame: {e}");
                    self.emit(SyncEvent::Error(e.to_string()));
                    continue;
                }
            };

            match channel.send(bytes).await {
                Ok(()) => {
                    self.inner.lock().outbound.pop_front();
                    sent += 1;
                    if let SyncMessage::Message { record } = &message {
                        self.emit(SyncEvent::Transmitted { id: record.id.clone() });
                    }
                }
                Err(e) => {
                    self.note_failed_attempt();
                    self.on_send_failure(generation, &e);
                    return Err(e.into());
                }
            }
        }
        if sent > 0 {
            tracing::debug!(session = %self.session_id, sent, "outbound queue flushed");
        }
        Ok(sent)
    }

    fn is_queued(&self, id: &str) -> bool {
        self.inner.lock().outbound.iter().any(|q| q.record_id() == Some(id))
    }

    async fn push(&self, message: SyncMessage, id: Option<&str>) -> Result<Transmit, SyncError> {
        let before = self.queued();
        self.enqueue(message)?;
        match self.flush().await {
            Ok(_) | Err(SyncError::Channel(_)) => {}
            Err(e) => return Err(e),
        }
        let still_queued = match id {
            Some(id) => self.is_queued(id),
            None => self.queued() > before,
        };
        Ok(if still_queued { Transmit::Queued } else { Transmit::Sent })
    }

    /// Hand a locally created record to the peer, queueing it while offline.
    pub async fn transmit(&self, record: StoredMessage) -> Result<Transmit, SyncError> {
        self.inner.lock().index.upsert(&record.id, record.hlc);
        let id = record.id.clone();
        let outcome = self.push(SyncMessage::Message { record }, Some(&id)).await?;
        tracing::debug!(session = %self.session_id, id = %id, ?outcome, "record handed to sync");
        Ok(outcome)
    }

    /// Re-queue a record that is not already waiting to go out.
    pub async fn requeue(&self, record: StoredMessage) -> Result<Transmit, SyncError> {
        if self.is_queued(&record.id) {
            return Ok(Transmit::Queued);
        }
        self.transmit(record).await
    }

    /// Confirm receipt of a peer record.
    pub async fn acknowledge(&self, id: &str, status: MessageStatus) -> Result<Transmit, SyncError> {
        self.push(
            SyncMessage::Ack {
                id: id.to_string(),
                status,
            },
            None,
        )
        .await
    }

    pub async fn send_status(&self, id: &str, status: MessageStatus) -> Result<Transmit, SyncError> {
        self.push(
            SyncMessage::StatusUpdate {
                id: id.to_string(),
                status,
            },
            None,
        )
        .await
    }

    /// Typing indicators are never queued. Returns whether it went out.
    pub async fn send_typing(&self, typing: bool) -> Result<bool, SyncError> {
        match self.send_now(&SyncMessage::Typing { typing }).await {
            Err(SyncError::Channel(_)) => Ok(false),
            other => other,
        }
    }

    pub async fn request_sync(&self) -> Result<(), SyncError> {
        let (last_hlc, digest) = {
            let inner = self.inner.lock();
            (inner.sync_state.last_reconciled, inner.index.digest())
        };
        if self
            .send_now(&SyncMessage::SyncRequest {
                last_hlc,
                digest: Some(digest),
            })
            .await?
        {
            tracing::debug!(session = %self.session_id, ?last_hlc, "sync requested");
        }
        Ok(())
    }

    /// Manual re-sync: reset attempt counters, retry the queue and pull
    /// from the peer again.
    pub async fn resync(&self) -> Result<(), SyncError> {
        {
            let mut inner = self.inner.lock();
            inner.resync_flagged = false;
            for q in inner.outbound.iter_mut() {
                q.attempts = 0;
            }
        }
        self.flush().await?;
        self.request_sync().await
    }

    /// Drop ids the store deleted (expiry, wipe).
    pub fn forget(&self, ids: &[String]) {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.index.remove(id);
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub async fn handle_inbound(&self, bytes: &[u8]) -> Result<(), SyncError> {
        let frame = codec::decode_frame(bytes)?;
        if frame.session_id != self.session_id {
            return Err(SyncError::SessionMismatch {
                expected: self.session_id.clone(),
                got: frame.session_id,
            });
        }
        tracing::debug!(session = %self.session_id, kind = ?frame.kind, "inbound frame");
        match frame.decode()? {
            SyncMessage::SyncRequest { last_hlc, digest } => self.answer_sync_request(last_hlc, digest).await,
            SyncMessage::SyncResponse { records } => self.reconcile(records).await,
            SyncMessage::Message { record } => self.reconcile(vec![record]).await,
            SyncMessage::Ack { id, status } | SyncMessage::StatusUpdate { id, status } => {
                self.apply_status(&id, status).await
            }
            SyncMessage::Typing { typing } => {
                self.peer_typing(typing);
                Ok(())
            }
        }
    }

    async fn answer_sync_request(&self, last_hlc: Option<Hlc>, digest: Option<String>) -> Result<(), SyncError> {
        let ours = self.digest();
        let records = if digest.as_deref() == Some(ours.as_str()) {
            Vec::new()
        } else {
            self.store.since(&self.session_id, last_hlc).await?
        };
        tracing::debug!(session = %self.session_id, records = records.len(), "answering sync request");

        if records.is_empty() {
            self.send_now(&SyncMessage::SyncResponse { records }).await?;
            return Ok(());
        }
        for batch in records.chunks(RESPONSE_BATCH) {
            let message = SyncMessage::SyncResponse {
                records: batch.to_vec(),
            };
            if !self.send_now(&message).await? {
                break;
            }
        }
        Ok(())
    }

    async fn reconcile(&self, records: Vec<StoredMessage>) -> Result<(), SyncError> {
        let mut progressed = false;
        for record in records {
            if record.session_id != self.session_id {
                tracing::warn!(session = %self.session_id, id = %record.id, "record for another session skipped");
                continue;
            }
            let outcome = self.store.merge(&record).await?;
            if !outcome.changed() {
                continue;
            }
            {
                let mut inner = self.inner.lock();
                inner.index.upsert(&record.id, record.hlc);
                inner.sync_state.observe(record.hlc, &record.sender_id);
            }
            progressed = true;

            if record.sender_id != self.local_id {
                let stored = self.store.get(&record.id).await?.unwrap_or(record);
                self.emit(SyncEvent::Record(stored));
            }
        }

        if progressed {
            let state = self.inner.lock().sync_state.clone();
            self.store.save_sync_state(&self.session_id, &state).await?;
        }
        Ok(())
    }

    async fn apply_status(&self, id: &str, status: MessageStatus) -> Result<(), SyncError> {
        match self.store.update_status(id, status).await {
            Ok(true) => {
                self.emit(SyncEvent::StatusChanged {
                    id: id.to_string(),
                    status,
                });
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(session = %self.session_id, id = %id, "status for unknown record ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn peer_typing(&self, typing: bool) {
        let generation = self.typing_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(SyncEvent::Typing(typing));
        if !typing {
            return;
        }
        let current = self.typing_gen.clone();
        let events = self.events.clone();
        let timeout = Duration::from_millis(self.config.typing_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if current.load(Ordering::SeqCst) == generation {
                let _ = events.send(SyncEvent::Typing(false));
            }
        });
    }
}
