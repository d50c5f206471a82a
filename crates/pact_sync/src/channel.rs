//! Byte channel abstraction.
//!
//! Transport establishment is outside this crate: whatever reliable,
//! ordered byte-stream the application negotiates is wrapped in a
//! [`ByteChannel`] for outbound frames, and its inbound side feeds
//! [`crate::SyncEngine::handle_inbound`] (see [`spawn_inbound_pump`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::engine::SyncEngine;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Link dropped; queue and retry on the next connection.
    #[error("channel closed")]
    Closed,
    /// Transport is unusable for good.
    #[error("channel failed: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait ByteChannel: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError>;
}

/// In-process channel end. Both ends of a pair share one link flag, so
/// [`LoopbackChannel::sever`] cuts both directions at once.
#[derive(Clone)]
pub struct LoopbackChannel {
    tx: mpsc::Sender<Vec<u8>>,
    link: Arc<AtomicBool>,
}

pub type LoopbackEnd = (LoopbackChannel, mpsc::Receiver<Vec<u8>>);

impl LoopbackChannel {
    /// Two connected ends; frames sent on one arrive on the other's receiver.
    pub fn pair(capacity: usize) -> (LoopbackEnd, LoopbackEnd) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let link = Arc::new(AtomicBool::new(true));
        (
            (
                LoopbackChannel {
                    tx: b_tx,
                    link: link.clone(),
                },
                a_rx,
            ),
            (LoopbackChannel { tx: a_tx, link }, b_rx),
        )
    }

    pub fn sever(&self) {
        self.link.store(false, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteChannel for LoopbackChannel {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if !self.is_up() {
            return Err(ChannelError::Closed);
        }
        self.tx.send(frame).await.map_err(|_| ChannelError::Closed)
    }
}

/// Drive inbound frames into the engine until the receiver closes, then
/// report the channel attached as `generation` as lost.
pub fn spawn_inbound_pump(
    engine: Arc<SyncEngine>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            if let Err(e) = engine.handle_inbound(&frame).await {
                tracing::warn!(session = %engine.session_id(), "inbound frame rejected: {e}");
            }
        }
        engine.on_channel_lost(generation);
    })
}
