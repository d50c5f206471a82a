//! Two handlers talking over an in-process channel, or exchanging records
//! out of band through their stores.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::timeout;

use pact_crypto::{KeyProvider, RatchetConfig, RatchetEngine, SoftwareKeyProvider};
use pact_messenger::{HandlerEvent, MessageHandler, MessengerConfig, MessengerError, RatchetBootstrap, SessionParams};
use pact_proto::{MessagePayload, MessageStatus, PaddingMode, StoredMessage};
use pact_store::{Store, Vault};
use pact_sync::{ConnectionState, LoopbackChannel};

const SESSION: &str = "pact-1";

struct Peer {
    handler: Arc<MessageHandler>,
    events: broadcast::Receiver<HandlerEvent>,
    store: Store,
    keys: Arc<dyn KeyProvider>,
}

async fn store() -> Store {
    let vault = Vault::new();
    vault.unlock_with_key([9u8; 32]).await;
    Store::open_in_memory(vault).await.unwrap()
}

fn params(local: &str, peer: &str) -> SessionParams {
    SessionParams {
        session_id: SESSION.to_string(),
        local_id: local.to_string(),
        peer_id: peer.to_string(),
    }
}

async fn pair(config: MessengerConfig) -> (Peer, Peer) {
    let alice_keys: Arc<dyn KeyProvider> = Arc::new(SoftwareKeyProvider::in_memory());
    let bob_keys: Arc<dyn KeyProvider> = Arc::new(SoftwareKeyProvider::in_memory());
    let alice_exchange = alice_keys.generate_exchange_pair().unwrap();
    let bob_prekey = bob_keys.generate_exchange_pair().unwrap();
    let alice_secret = alice_exchange.derive_secret(&bob_prekey.public_key()).unwrap();
    let bob_secret = bob_prekey.derive_secret(&alice_exchange.public_key()).unwrap();

    let alice_store = store().await;
    let alice = MessageHandler::start(
        params("alice", "bob"),
        alice_store.clone(),
        alice_keys.clone(),
        RatchetBootstrap::Initiator {
            shared_secret: alice_secret,
            peer_public: bob_prekey.public_key(),
        },
        config.clone(),
    )
    .await
    .unwrap();

    let bob_store = store().await;
    let bob = MessageHandler::start(
        params("bob", "alice"),
        bob_store.clone(),
        bob_keys.clone(),
        RatchetBootstrap::Responder {
            shared_secret: bob_secret,
            own_pair: bob_prekey,
        },
        config,
    )
    .await
    .unwrap();

    (
        Peer {
            events: alice.subscribe(),
            handler: alice,
            store: alice_store,
            keys: alice_keys,
        },
        Peer {
            events: bob.subscribe(),
            handler: bob,
            store: bob_store,
            keys: bob_keys,
        },
    )
}

/// Connect `b` first, then `a`.
async fn link(a: &Peer, b: &Peer) -> LoopbackChannel {
    let ((a_end, a_rx), (b_end, b_rx)) = LoopbackChannel::pair(64);
    let handle = a_end.clone();
    b.handler.connect(Arc::new(b_end), b_rx).await.unwrap();
    a.handler.connect(Arc::new(a_end), a_rx).await.unwrap();
    handle
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<HandlerEvent>,
    mut pick: impl FnMut(HandlerEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for handler event")
}

async fn next_message(events: &mut broadcast::Receiver<HandlerEvent>) -> (String, String) {
    wait_for(events, |event| match event {
        HandlerEvent::Message { id, payload, .. } => Some((id, payload.body().unwrap_or_default().to_string())),
        _ => None,
    })
    .await
}

async fn wait_status(events: &mut broadcast::Receiver<HandlerEvent>, want_id: &str, want: MessageStatus) {
    wait_for(events, |event| match event {
        HandlerEvent::StatusChanged { id, status } if id == want_id && status == want => Some(()),
        _ => None,
    })
    .await
}

/// Carry a record from one replica to the other without a channel.
async fn deliver(from: &Peer, to: &Peer, id: &str) -> StoredMessage {
    let record = from.store.get(id).await.unwrap().unwrap();
    to.store.merge(&record).await.unwrap();
    to.store.get(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn conversation_reaches_read() {
    let (mut alice, mut bob) = pair(MessengerConfig::default()).await;
    link(&alice, &bob).await;
    assert_eq!(alice.handler.connection_state(), ConnectionState::Connected);

    let hello = alice.handler.send_message("hello bob", BTreeMap::new()).await.unwrap();
    assert_ne!(hello.status, MessageStatus::Pending);

    let (id, body) = next_message(&mut bob.events).await;
    assert_eq!(id, hello.id);
    assert_eq!(body, "hello bob");
    wait_status(&mut alice.events, &hello.id, MessageStatus::Delivered).await;

    let reply = bob.handler.send_message("hi alice", BTreeMap::new()).await.unwrap();
    let (id, body) = next_message(&mut alice.events).await;
    assert_eq!(id, reply.id);
    assert_eq!(body, "hi alice");

    assert!(alice.handler.send_typing(true).await.unwrap());
    wait_for(&mut bob.events, |event| matches!(event, HandlerEvent::Typing(true)).then_some(())).await;

    let read = bob.handler.mark_as_read().await.unwrap();
    assert_eq!(read, vec![hello.id.clone()]);
    wait_status(&mut alice.events, &hello.id, MessageStatus::Read).await;
    let stored = alice.store.get(&hello.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Read);

    let now = Utc::now();
    let history = alice
        .handler
        .history(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1), 50)
        .await
        .unwrap();
    let bodies: Vec<&str> = history
        .iter()
        .filter_map(|entry| entry.payload.as_ref().and_then(|p| p.body()))
        .collect();
    assert_eq!(bodies, vec!["hello bob", "hi alice"]);
}

#[tokio::test]
async fn offline_sends_flush_on_connect() {
    let (mut alice, mut bob) = pair(MessengerConfig::default()).await;
    assert_eq!(alice.handler.connection_state(), ConnectionState::Disconnected);

    let one = alice.handler.send_message("one", BTreeMap::new()).await.unwrap();
    let two = alice.handler.send_message("two", BTreeMap::new()).await.unwrap();
    assert_eq!(one.status, MessageStatus::Pending);
    assert_eq!(two.status, MessageStatus::Pending);

    link(&alice, &bob).await;

    assert_eq!(next_message(&mut bob.events).await, (one.id.clone(), "one".to_string()));
    assert_eq!(next_message(&mut bob.events).await, (two.id.clone(), "two".to_string()));
    wait_status(&mut alice.events, &two.id, MessageStatus::Delivered).await;
}

#[tokio::test]
async fn delayed_hello_decrypts_after_world() {
    let (alice, bob) = pair(MessengerConfig::default()).await;

    let hello = alice.handler.send_message("hello", BTreeMap::new()).await.unwrap();
    let world = alice.handler.send_message("world", BTreeMap::new()).await.unwrap();

    let late = deliver(&alice, &bob, &world.id).await;
    let payload = bob.handler.receive(&late).await.unwrap().unwrap();
    assert_eq!(payload.body(), Some("world"));

    let early = deliver(&alice, &bob, &hello.id).await;
    let payload = bob.handler.receive(&early).await.unwrap().unwrap();
    assert_eq!(payload.body(), Some("hello"));

    // Already opened: nothing to do the second time
    assert!(bob.handler.receive(&early).await.unwrap().is_none());
    let stored = bob.store.get(&hello.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn tampered_record_is_kept_undecryptable() {
    let (alice, mut bob) = pair(MessengerConfig::default()).await;

    let sent = alice.handler.send_message("secret", BTreeMap::new()).await.unwrap();
    let mut forged = alice.store.get(&sent.id).await.unwrap().unwrap();
    let first = if forged.ciphertext.starts_with('A') { "B" } else { "A" };
    forged.ciphertext.replace_range(0..1, first);
    bob.store.merge(&forged).await.unwrap();
    let forged = bob.store.get(&sent.id).await.unwrap().unwrap();

    assert!(bob.handler.receive(&forged).await.is_err());
    let error_id = wait_for(&mut bob.events, |event| match event {
        HandlerEvent::Error { id, .. } => id,
        _ => None,
    })
    .await;
    assert_eq!(error_id, sent.id);

    let kept = bob.store.undecryptable(SESSION).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].id, sent.id);
    assert_eq!(bob.handler.retry_undecryptable().await.unwrap(), 0);

    // The failed attempt left the session usable
    let next = alice.handler.send_message("still here", BTreeMap::new()).await.unwrap();
    let record = deliver(&alice, &bob, &next.id).await;
    let payload = bob.handler.receive(&record).await.unwrap().unwrap();
    assert_eq!(payload.body(), Some("still here"));
}

#[tokio::test]
async fn disappearing_messages_are_swept() {
    let config = MessengerConfig {
        disappear_after_secs: Some(0),
        ..MessengerConfig::default()
    };
    let (mut alice, _bob) = pair(config).await;

    let sent = alice.handler.send_message("gone soon", BTreeMap::new()).await.unwrap();
    assert!(sent.expires_at.is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let swept = alice.handler.sweep_expired().await.unwrap();
    assert_eq!(swept, vec![sent.id.clone()]);
    assert!(alice.store.get(&sent.id).await.unwrap().is_none());
    assert!(alice.store.body(&sent.id).await.unwrap().is_none());

    let expired = wait_for(&mut alice.events, |event| match event {
        HandlerEvent::Expired { ids } => Some(ids),
        _ => None,
    })
    .await;
    assert_eq!(expired, vec![sent.id]);
}

#[tokio::test]
async fn session_resumes_after_shutdown() {
    let (alice, bob) = pair(MessengerConfig::default()).await;

    let first = alice.handler.send_message("before restart", BTreeMap::new()).await.unwrap();
    let record = deliver(&alice, &bob, &first.id).await;
    bob.handler.receive(&record).await.unwrap();
    bob.handler.shutdown().await.unwrap();

    let resumed = MessageHandler::start(
        params("bob", "alice"),
        bob.store.clone(),
        bob.keys.clone(),
        RatchetBootstrap::Resume,
        MessengerConfig::default(),
    )
    .await
    .unwrap();

    let second = alice.handler.send_message("after restart", BTreeMap::new()).await.unwrap();
    let record = deliver(&alice, &bob, &second.id).await;
    let payload = resumed.receive(&record).await.unwrap().unwrap();
    assert_eq!(payload.body(), Some("after restart"));

    let unknown = SessionParams {
        session_id: "pact-unknown".to_string(),
        ..params("bob", "alice")
    };
    let fresh = MessageHandler::start(
        unknown,
        bob.store.clone(),
        bob.keys.clone(),
        RatchetBootstrap::Resume,
        MessengerConfig::default(),
    )
    .await;
    assert!(matches!(fresh, Err(MessengerError::SessionNotInitialized)));
}

#[tokio::test]
async fn reconnect_survives_old_link_closing() {
    let (alice, mut bob) = pair(MessengerConfig::default()).await;
    link(&alice, &bob).await;
    // Both ends of the first link are dropped here, ending its pumps
    link(&alice, &bob).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.handler.connection_state(), ConnectionState::Connected);
    assert_eq!(bob.handler.connection_state(), ConnectionState::Connected);

    let sent = alice.handler.send_message("second link", BTreeMap::new()).await.unwrap();
    assert_ne!(sent.status, MessageStatus::Pending);
    assert_eq!(next_message(&mut bob.events).await, (sent.id, "second link".to_string()));
}

#[tokio::test]
async fn malformed_plaintext_is_not_retried() {
    let sender_keys: Arc<dyn KeyProvider> = Arc::new(SoftwareKeyProvider::in_memory());
    let bob_keys: Arc<dyn KeyProvider> = Arc::new(SoftwareKeyProvider::in_memory());
    let sender_exchange = sender_keys.generate_exchange_pair().unwrap();
    let bob_prekey = bob_keys.generate_exchange_pair().unwrap();
    let sender_secret = sender_exchange.derive_secret(&bob_prekey.public_key()).unwrap();
    let bob_secret = bob_prekey.derive_secret(&sender_exchange.public_key()).unwrap();

    // A raw ratchet lets the sender seal bytes that are not a payload
    let sender = RatchetEngine::new(SESSION, sender_keys, RatchetConfig::default());
    sender.init_as_initiator(*sender_secret, &bob_prekey.public_key()).unwrap();
    let bob_store = store().await;
    let bob = MessageHandler::start(
        params("bob", "alice"),
        bob_store.clone(),
        bob_keys,
        RatchetBootstrap::Responder {
            shared_secret: bob_secret,
            own_pair: bob_prekey,
        },
        MessengerConfig::default(),
    )
    .await
    .unwrap();
    let mut events = bob.subscribe();

    let outside = store().await;
    let seal = |plaintext: &[u8]| {
        let envelope = sender.encrypt(&PaddingMode::Buckets.pad(plaintext)).unwrap();
        StoredMessage::draft(SESSION, "alice", "bob", &envelope, None)
    };
    let junk = outside.create(seal(b"not a payload")).await.unwrap();
    let good = outside.create(seal(&MessagePayload::text("fine").to_bytes().unwrap())).await.unwrap();
    bob_store.merge(&junk).await.unwrap();
    bob_store.merge(&good).await.unwrap();

    assert!(matches!(bob.receive(&junk).await, Err(MessengerError::Payload(_))));
    let error = wait_for(&mut events, |event| match event {
        HandlerEvent::Error { id, error } if id.as_deref() == Some(junk.id.as_str()) => Some(error),
        _ => None,
    })
    .await;
    assert!(error.contains("not retryable"));
    assert!(bob_store.undecryptable(SESSION).await.unwrap().is_empty());

    let payload = bob.receive(&good).await.unwrap().unwrap();
    assert_eq!(payload.body(), Some("fine"));
}
