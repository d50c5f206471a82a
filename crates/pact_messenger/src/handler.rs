//! Per-session message handler.
//!
//! Wires one [`RatchetEngine`], the shared [`Store`] and one [`SyncEngine`]
//! together:
//!
//! - send: pad → encrypt → persist `pending` → hand to sync → `sent`
//! - receive: peer record → decrypt → sealed body → `delivered` → ack
//!
//! Ratchet snapshots are written after every encrypt and successful
//! decrypt, so a restart resumes the session where it stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use zeroize::Zeroizing;

use pact_crypto::{ExchangeKeyHandle, ExchangePublicKey, KeyProvider, RatchetEngine};
use pact_proto::{codec, MessagePayload, MessageStatus, StoredMessage};
use pact_store::Store;
use pact_sync::{spawn_inbound_pump, ByteChannel, ConnectionState, SyncEngine, SyncError, SyncEvent, Transmit};

use crate::{config::MessengerConfig, error::MessengerError, events::HandlerEvent};

const EVENT_CAPACITY: usize = 256;

/// Who is talking to whom in a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub local_id: String,
    pub peer_id: String,
}

/// How the ratchet comes up on [`MessageHandler::start`].
pub enum RatchetBootstrap {
    /// Fresh session; this side sends first.
    Initiator {
        shared_secret: Zeroizing<[u8; 32]>,
        peer_public: ExchangePublicKey,
    },
    /// Fresh session; `own_pair` is the pre-generated key the initiator used.
    Responder {
        shared_secret: Zeroizing<[u8; 32]>,
        own_pair: Arc<dyn ExchangeKeyHandle>,
    },
    /// Continue from the snapshot in the store.
    Resume,
}

/// A stored record with its decrypted payload, when one is held locally.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub record: StoredMessage,
    pub payload: Option<MessagePayload>,
}

pub struct MessageHandler {
    params: SessionParams,
    config: MessengerConfig,
    store: Store,
    ratchet: RatchetEngine,
    sync: Arc<SyncEngine>,
    events: broadcast::Sender<HandlerEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serialises decrypts so a record is never opened twice.
    receive_lock: tokio::sync::Mutex<()>,
}

impl MessageHandler {
    /// Bring the session up and start the event pump and expiry sweeper.
    /// A snapshot already in the store always wins over `bootstrap`.
    pub async fn start(
        params: SessionParams,
        store: Store,
        provider: Arc<dyn KeyProvider>,
        bootstrap: RatchetBootstrap,
        config: MessengerConfig,
    ) -> Result<Arc<Self>, MessengerError> {
        let ratchet = RatchetEngine::new(params.session_id.as_str(), provider, config.ratchet.clone());
        match (store.load_ratchet(&params.session_id).await?, bootstrap) {
            (Some(snapshot), _) => ratchet.restore(snapshot)?,
            (None, RatchetBootstrap::Initiator { shared_secret, peer_public }) => {
                ratchet.init_as_initiator(*shared_secret, &peer_public)?;
                store.save_ratchet(&params.session_id, &ratchet.snapshot()?).await?;
            }
            (None, RatchetBootstrap::Responder { shared_secret, own_pair }) => {
                ratchet.init_as_responder(*shared_secret, own_pair);
                store.save_ratchet(&params.session_id, &ratchet.snapshot()?).await?;
            }
            (None, RatchetBootstrap::Resume) => return Err(MessengerError::SessionNotInitialized),
        }

        let (sync, sync_events) =
            SyncEngine::open(&params.session_id, &params.local_id, store.clone(), config.sync.clone()).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler = Arc::new(Self {
            params,
            config,
            store,
            ratchet,
            sync: Arc::new(sync),
            events,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            receive_lock: tokio::sync::Mutex::new(()),
        });

        let pump = spawn_event_pump(handler.clone(), sync_events, shutdown_rx.clone());
        let sweeper = spawn_sweeper(handler.clone(), shutdown_rx);
        handler.tasks.lock().extend([pump, sweeper]);
        tracing::info!(session = %handler.params.session_id, "message handler started");
        Ok(handler)
    }

    /// Stop background tasks, detach from the channel and persist the
    /// ratchet. The store is left open for its owner.
    pub async fn shutdown(&self) -> Result<(), MessengerError> {
        let _ = self.shutdown_tx.send(true);
        self.sync.disconnect();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        if self.ratchet.is_initialized() {
            self.store
                .save_ratchet(&self.params.session_id, &self.ratchet.snapshot()?)
                .await?;
        }
        tracing::info!(session = %self.params.session_id, "message handler stopped");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionParams {
        &self.params
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sync.state()
    }

    fn emit(&self, event: HandlerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Attach an established channel. `inbound` carries frames from the peer.
    pub async fn connect(
        &self,
        channel: Arc<dyn ByteChannel>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), MessengerError> {
        let generation = self.sync.connect(channel).await?;
        let pump = spawn_inbound_pump(self.sync.clone(), inbound, generation);
        self.tasks.lock().push(pump);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.sync.disconnect();
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    pub async fn send_message(
        &self,
        text: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<StoredMessage, MessengerError> {
        self.send_payload(MessagePayload::text(text).with_metadata(metadata)).await
    }

    /// Encrypt and persist as `pending`, then hand to sync. Offline sends are
    /// queued and reported as `pending`; the record is `sent` once it leaves.
    pub async fn send_payload(&self, payload: MessagePayload) -> Result<StoredMessage, MessengerError> {
        let session = &self.params.session_id;
        let body = Zeroizing::new(payload.to_bytes()?);
        let padded = Zeroizing::new(self.config.padding.pad(&body));
        let envelope = self.ratchet.encrypt(&padded)?;

        let expires_at = self
            .config
            .disappear_after_secs
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
        let draft = StoredMessage::draft(session, &self.params.local_id, &self.params.peer_id, &envelope, expires_at);
        let record = self.store.create(draft).await?;
        self.store.save_ratchet(session, &self.ratchet.snapshot()?).await?;
        self.store.put_body(&record.id, session, &body).await?;

        match self.sync.transmit(record.clone()).await {
            Ok(Transmit::Sent) => self.set_status(&record.id, MessageStatus::Sent).await?,
            Ok(Transmit::Queued) => {
                tracing::debug!(session = %session, id = %record.id, "message queued while offline");
            }
            Err(e @ SyncError::QueueFull { .. }) => {
                self.set_status(&record.id, MessageStatus::Failed).await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.store.get(&record.id).await?.unwrap_or(record))
    }

    async fn set_status(&self, id: &str, status: MessageStatus) -> Result<(), MessengerError> {
        if self.store.update_status(id, status).await? {
            self.emit(HandlerEvent::StatusChanged {
                id: id.to_string(),
                status,
            });
        }
        Ok(())
    }

    pub async fn send_typing(&self, typing: bool) -> Result<bool, MessengerError> {
        Ok(self.sync.send_typing(typing).await?)
    }

    /// Mark every delivered peer message read and tell the peer.
    pub async fn mark_as_read(&self) -> Result<Vec<String>, MessengerError> {
        let ids = self
            .store
            .mark_read(&self.params.session_id, &self.params.local_id)
            .await?;
        for id in &ids {
            self.emit(HandlerEvent::StatusChanged {
                id: id.clone(),
                status: MessageStatus::Read,
            });
            if let Err(e) = self.sync.send_status(id, MessageStatus::Read).await {
                tracing::warn!(session = %self.params.session_id, id = %id, "read receipt not queued: {e}");
            }
        }
        Ok(ids)
    }

    /// Re-queue every local record that never left, then pull from the peer.
    pub async fn resync(&self) -> Result<usize, MessengerError> {
        let unsent = self
            .store
            .unsent(&self.params.session_id, &self.params.local_id)
            .await?;
        let count = unsent.len();
        for record in unsent {
            self.sync.requeue(record).await?;
        }
        match self.sync.resync().await {
            Ok(()) | Err(SyncError::Channel(_)) => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(session = %self.params.session_id, requeued = count, "manual re-sync");
        Ok(count)
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Decrypt a peer record already merged into the store. Own records and
    /// records that already have a body are skipped (`Ok(None)`). A record
    /// that fails to decrypt is tagged undecryptable and kept.
    pub async fn receive(&self, record: &StoredMessage) -> Result<Option<MessagePayload>, MessengerError> {
        if record.sender_id == self.params.local_id {
            return Ok(None);
        }
        let _guard = self.receive_lock.lock().await;
        if self.store.body(&record.id).await?.is_some() {
            return Ok(None);
        }

        let padded = match self.ratchet.decrypt(&record.envelope()) {
            Ok(padded) => padded,
            Err(e) => {
                let e = MessengerError::from(e);
                if !matches!(e, MessengerError::SessionNotInitialized) {
                    self.store.tag_undecryptable(&record.id, true).await?;
                }
                tracing::warn!(session = %self.params.session_id, id = %record.id, "record kept undecryptable: {e}");
                self.emit(HandlerEvent::Error {
                    id: Some(record.id.clone()),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        let (payload, body) = match open_payload(&padded) {
            Ok(opened) => opened,
            Err(e) => {
                // The message key is spent, so a retry can never succeed
                self.store
                    .save_ratchet(&self.params.session_id, &self.ratchet.snapshot()?)
                    .await?;
                tracing::warn!(session = %self.params.session_id, id = %record.id, "decrypted record is malformed: {e}");
                self.emit(HandlerEvent::Error {
                    id: Some(record.id.clone()),
                    error: format!("{e} (message key consumed, not retryable)"),
                });
                return Err(e);
            }
        };

        let session = &self.params.session_id;
        self.store.save_ratchet(session, &self.ratchet.snapshot()?).await?;
        self.store.put_body(&record.id, session, &body).await?;
        if record.undecryptable {
            self.store.tag_undecryptable(&record.id, false).await?;
        }
        self.set_status(&record.id, MessageStatus::Delivered).await?;
        if let Err(e) = self.sync.acknowledge(&record.id, MessageStatus::Delivered).await {
            tracing::warn!(session = %session, id = %record.id, "delivery ack not queued: {e}");
        }

        self.emit(HandlerEvent::Message {
            id: record.id.clone(),
            sender_id: record.sender_id.clone(),
            sent_at: record.sent_at,
            hlc: record.hlc,
            payload: payload.clone(),
        });
        Ok(Some(payload))
    }

    /// Try every undecryptable record again. Returns how many now decrypt.
    pub async fn retry_undecryptable(&self) -> Result<usize, MessengerError> {
        let mut recovered = 0;
        for record in self.store.undecryptable(&self.params.session_id).await? {
            if self.receive(&record).await.is_ok_and(|p| p.is_some()) {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // ── History and expiry ───────────────────────────────────────────────────

    pub async fn history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, MessengerError> {
        let records = self.store.range(&self.params.session_id, from, to, limit, 0).await?;
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let payload = match self.store.body(&record.id).await? {
                Some(body) => MessagePayload::from_bytes(&body).ok(),
                None => None,
            };
            entries.push(HistoryEntry { record, payload });
        }
        Ok(entries)
    }

    /// Delete expired records and stale skipped keys. Returns deleted ids.
    pub async fn sweep_expired(&self) -> Result<Vec<String>, MessengerError> {
        let ids = self.store.delete_expired(Utc::now()).await?;
        if !ids.is_empty() {
            self.sync.forget(&ids);
            self.emit(HandlerEvent::Expired { ids: ids.clone() });
        }
        if self.ratchet.purge_expired() > 0 {
            self.store
                .save_ratchet(&self.params.session_id, &self.ratchet.snapshot()?)
                .await?;
        }
        Ok(ids)
    }

    async fn on_sync_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::Record(record) => {
                // Failures are reported through the event stream by receive()
                let _ = self.receive(&record).await;
            }
            SyncEvent::Transmitted { id } => {
                if let Err(e) = self.set_status(&id, MessageStatus::Sent).await {
                    tracing::warn!(session = %self.params.session_id, id = %id, "status update failed: {e}");
                }
            }
            SyncEvent::StatusChanged { id, status } => self.emit(HandlerEvent::StatusChanged { id, status }),
            SyncEvent::Typing(typing) => self.emit(HandlerEvent::Typing(typing)),
            SyncEvent::ConnectionChanged(state) => self.emit(HandlerEvent::ConnectionChanged(state)),
            SyncEvent::ResyncRequired { pending } => {
                for id in &pending {
                    if let Err(e) = self.set_status(id, MessageStatus::Failed).await {
                        tracing::warn!(session = %self.params.session_id, id = %id, "status update failed: {e}");
                    }
                }
                self.emit(HandlerEvent::ResyncRequired { pending });
            }
            SyncEvent::Error(error) => self.emit(HandlerEvent::Error { id: None, error }),
        }
    }
}

/// Strip padding and parse the plaintext of an authenticated record.
fn open_payload(padded: &[u8]) -> Result<(MessagePayload, Zeroizing<Vec<u8>>), MessengerError> {
    let body = Zeroizing::new(codec::unpad(padded)?);
    let payload = MessagePayload::from_bytes(&body)?;
    Ok((payload, body))
}

fn spawn_event_pump(
    handler: Arc<MessageHandler>,
    mut events: mpsc::UnboundedReceiver<SyncEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => handler.on_sync_event(event).await,
                    None => return,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_sweeper(handler: Arc<MessageHandler>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    let interval = Duration::from_secs(handler.config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("expiry sweeper shutting down");
                        return;
                    }
                }
            }
            if let Err(e) = handler.sweep_expired().await {
                tracing::warn!(session = %handler.params.session_id, "expiry sweep failed: {e}");
            }
        }
    })
}
