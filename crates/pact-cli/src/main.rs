use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::RngCore;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pact_crypto::{
    kdf::generate_salt, keys::exchange_key_to_b64, provider::StaticPresence, KeyProvider, PublicKeyBytes,
    SoftwareKeyProvider,
};
use pact_messenger::{HandlerEvent, MessageHandler, MessengerConfig, RatchetBootstrap, SessionParams};
use pact_proto::{MessagePayload, MessageStatus};
use pact_store::{Store, Vault};
use pact_sync::LoopbackChannel;

const DEMO_SESSION: &str = "demo";
const EVENT_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "Pact Secure Channel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a long-term identity and print its fingerprint
    Keygen {
        /// Keep the private halves in the OS keyring under this service name
        #[arg(long)]
        keyring: Option<String>,
    },
    /// Print the display fingerprint of a base64url public key
    Fingerprint { public_key: String },
    /// Run two peers in-process over a loopback channel
    Demo {
        /// Persist both message stores here instead of in memory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Store password, required with --data-dir
        #[arg(long)]
        password: Option<String>,
        /// Messenger config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "3")]
        messages: usize,
    },
    /// Print the history a demo run left in a data directory
    Log {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        password: String,
        /// Which replica to read: alice or bob
        #[arg(long, default_value = "alice")]
        peer: String,
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen { keyring } => keygen_command(keyring),
        Commands::Fingerprint { public_key } => fingerprint_command(&public_key),
        Commands::Demo {
            data_dir,
            password,
            config,
            messages,
        } => demo_command(data_dir, password, config, messages).await,
        Commands::Log {
            data_dir,
            password,
            peer,
            limit,
        } => log_command(&data_dir, &password, &peer, limit).await,
    }
}

fn keygen_command(keyring: Option<String>) -> Result<()> {
    let provider = match keyring {
        Some(service) => SoftwareKeyProvider::with_keyring(&service, Arc::new(StaticPresence(true)))?,
        None => SoftwareKeyProvider::in_memory(),
    };
    let identity = provider.generate_identity()?;
    println!("Signing key:  {}", identity.signing.key_id());
    println!("  public:     {}", identity.signing.public_key().to_b64());
    println!("Exchange key: {}", identity.exchange.key_id());
    println!("  public:     {}", exchange_key_to_b64(&identity.exchange.public_key()));
    println!("Fingerprint:  {}", identity.fingerprint());
    Ok(())
}

fn fingerprint_command(public_key: &str) -> Result<()> {
    let key = PublicKeyBytes::from_b64(public_key)?;
    println!("{}", key.fingerprint());
    Ok(())
}

// ── Stores ───────────────────────────────────────────────────────────────────

/// Per-directory Argon2 salt, created on first use.
fn load_or_create_salt(dir: &Path) -> Result<[u8; 16]> {
    let path = dir.join("salt");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let bytes = hex::decode(raw.trim()).with_context(|| format!("corrupt salt file {}", path.display()))?;
        return bytes
            .try_into()
            .map_err(|_| anyhow!("salt file {} must hold 16 bytes", path.display()));
    }
    let salt = generate_salt();
    std::fs::write(&path, hex::encode(salt))?;
    Ok(salt)
}

async fn open_store(data_dir: Option<&Path>, password: Option<&str>, name: &str) -> Result<Store> {
    let vault = Vault::new();
    match data_dir {
        Some(dir) => {
            let password = password.ok_or_else(|| anyhow!("--password is required with --data-dir"))?;
            std::fs::create_dir_all(dir)?;
            let salt = load_or_create_salt(dir)?;
            vault.unlock(password.as_bytes(), &salt).await?;
            Ok(Store::open(&dir.join(format!("{name}.db")), vault).await?)
        }
        None => {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            vault.unlock_with_key(key).await;
            Ok(Store::open_in_memory(vault).await?)
        }
    }
}

// ── Demo ─────────────────────────────────────────────────────────────────────

async fn wait_for<T>(
    events: &mut broadcast::Receiver<HandlerEvent>,
    mut pick: impl FnMut(HandlerEvent) -> Option<T>,
) -> Result<T> {
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return Ok(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(e) => return Err(anyhow!("event stream closed: {e}")),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for peer"))?
}

async fn expect_message(events: &mut broadcast::Receiver<HandlerEvent>, who: &str) -> Result<()> {
    let (sender, body) = wait_for(events, |event| match event {
        HandlerEvent::Message { sender_id, payload, .. } => {
            Some((sender_id, payload.body().unwrap_or("<media>").to_string()))
        }
        _ => None,
    })
    .await?;
    println!("[{who}] {sender}: {body}");
    Ok(())
}

async fn demo_command(
    data_dir: Option<PathBuf>,
    password: Option<String>,
    config: Option<PathBuf>,
    messages: usize,
) -> Result<()> {
    let config = match config {
        Some(path) => MessengerConfig::load(&path)?,
        None => MessengerConfig::default(),
    };

    let alice_store = open_store(data_dir.as_deref(), password.as_deref(), "alice").await?;
    let bob_store = open_store(data_dir.as_deref(), password.as_deref(), "bob").await?;
    // Keys are ephemeral, so a previous run's ratchet cannot be resumed
    alice_store.wipe_session(DEMO_SESSION).await?;
    bob_store.wipe_session(DEMO_SESSION).await?;

    let alice_keys: Arc<dyn KeyProvider> = Arc::new(SoftwareKeyProvider::in_memory());
    let bob_keys: Arc<dyn KeyProvider> = Arc::new(SoftwareKeyProvider::in_memory());
    let alice_exchange = alice_keys.generate_exchange_pair()?;
    let bob_prekey = bob_keys.generate_exchange_pair()?;
    let alice_secret = alice_exchange.derive_secret(&bob_prekey.public_key())?;
    let bob_secret = bob_prekey.derive_secret(&alice_exchange.public_key())?;
    let peer_public = bob_prekey.public_key();

    let alice = MessageHandler::start(
        SessionParams {
            session_id: DEMO_SESSION.into(),
            local_id: "alice".into(),
            peer_id: "bob".into(),
        },
        alice_store.clone(),
        alice_keys,
        RatchetBootstrap::Initiator {
            shared_secret: alice_secret,
            peer_public,
        },
        config.clone(),
    )
    .await?;
    let bob = MessageHandler::start(
        SessionParams {
            session_id: DEMO_SESSION.into(),
            local_id: "bob".into(),
            peer_id: "alice".into(),
        },
        bob_store.clone(),
        bob_keys,
        RatchetBootstrap::Responder {
            shared_secret: bob_secret,
            own_pair: bob_prekey,
        },
        config,
    )
    .await?;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let ((alice_end, alice_rx), (bob_end, bob_rx)) = LoopbackChannel::pair(64);
    bob.connect(Arc::new(bob_end), bob_rx).await?;
    alice.connect(Arc::new(alice_end), alice_rx).await?;
    info!("peers connected");

    let mut last_sent = None;
    for n in 1..=messages {
        let sent = alice
            .send_payload(
                MessagePayload::text(format!("ping {n}")).with_metadata(BTreeMap::from([("seq".to_string(), n.to_string())])),
            )
            .await?;
        expect_message(&mut bob_events, "bob").await?;
        bob.send_message(&format!("pong {n}"), BTreeMap::new()).await?;
        expect_message(&mut alice_events, "alice").await?;
        last_sent = Some(sent.id);
    }

    let read = bob.mark_as_read().await?;
    if let Some(id) = last_sent {
        wait_for(&mut alice_events, |event| match event {
            HandlerEvent::StatusChanged { id: changed, status } if changed == id && status == MessageStatus::Read => {
                Some(())
            }
            _ => None,
        })
        .await?;
    }
    println!("bob read {} message(s)", read.len());

    alice.shutdown().await?;
    bob.shutdown().await?;
    alice_store.close().await;
    bob_store.close().await;
    Ok(())
}

// ── Log ──────────────────────────────────────────────────────────────────────

async fn log_command(data_dir: &Path, password: &str, peer: &str, limit: u32) -> Result<()> {
    let db = data_dir.join(format!("{peer}.db"));
    if !db.exists() {
        return Err(anyhow!("no store at {}", db.display()));
    }
    let store = open_store(Some(data_dir), Some(password), peer).await?;
    let from = Utc::now() - chrono::Duration::days(365 * 30);
    let to = Utc::now() + chrono::Duration::days(1);
    for record in store.range(DEMO_SESSION, from, to, limit, 0).await? {
        let body = match store.body(&record.id).await? {
            Some(bytes) => MessagePayload::from_bytes(&bytes)
                .ok()
                .and_then(|p| p.body().map(str::to_string))
                .unwrap_or_else(|| "<media>".to_string()),
            None if record.undecryptable => "<undecryptable>".to_string(),
            None => "<no body>".to_string(),
        };
        println!(
            "{} {:<9} {:<6} {}",
            record.hlc,
            record.status.as_str(),
            record.sender_id,
            body
        );
    }
    store.close().await;
    Ok(())
}
