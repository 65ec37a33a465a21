//! # groop-sim
//!
//! Scripted multi-device run of the Groop chat core against the in-process
//! store. Useful for eyeballing logs and the rendered view.
//!
//! Env:
//! - `RUST_LOG` log filter (default `info,groop_chat=debug`)
//! - `GROOP_SIM_JSON=1` print the final view of every device as JSON
//! - every `GROOP_*` variable read by `ChatConfig::from_env`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use groop_chat::{
    ChatConfig, ChatContext, ChatSession, GroopRecord, KeyManager, MemoryStore, RemoteStore,
    SessionUser, UserRecord,
};
use groop_shared::{GroopId, UserId};

struct Device {
    user: SessionUser,
    ctx: Arc<ChatContext>,
}

fn register(
    store: &Arc<MemoryStore>,
    config: &ChatConfig,
    id: &str,
    name: &str,
    persistent: bool,
) -> anyhow::Result<Device> {
    let mut record = UserRecord::new(UserId::from(id), name);
    record.push_tokens = vec![format!("push-{id}")];
    store.put_user(record);

    let remote: Arc<dyn RemoteStore> = store.clone();
    let ctx = if persistent {
        ChatContext::open(config.clone(), remote).context("opening key database")?
    } else {
        ChatContext::new(config.clone(), remote, Arc::new(KeyManager::in_memory()?))
    };
    Ok(Device {
        user: SessionUser::new(id, name),
        ctx,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,groop_chat=debug")),
        )
        .init();

    info!("Starting Groop simulator v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ChatConfig::from_env();
    info!(?config, "Loaded configuration");
    let print_json = std::env::var("GROOP_SIM_JSON").is_ok_and(|v| v == "1");

    // -----------------------------------------------------------------------
    // 3. Seed the store with one trip group
    // -----------------------------------------------------------------------
    let store = Arc::new(MemoryStore::new());

    // Only the first device uses the configured key database
    let alice = register(&store, &config, "alice", "Alice", config.key_db_path.is_some())?;
    let bob = register(&store, &config, "bob", "Bob", false)?;
    let carol = register(&store, &config, "carol", "Carol", false)?;

    let groop = GroopId::generate();
    store.create_groop(GroopRecord::new(
        groop.clone(),
        "Road trip",
        vec![alice.user.id.clone(), bob.user.id.clone()],
    ));

    // -----------------------------------------------------------------------
    // 4. Enable encryption and hand the key to bob
    // -----------------------------------------------------------------------
    bob.ctx.key_exchange.ensure_user_keypair(&bob.user.id).await?;
    let created = alice
        .ctx
        .key_exchange
        .setup_group_encryption(&groop, &alice.user.id)
        .await?;
    info!(created, "Group encryption set up");

    let report = alice
        .ctx
        .key_exchange
        .distribute_group_key(&groop, &alice.user.id)
        .await?;
    info!(shared = report.shared.len(), failed = report.failed.len(), "Initial key distribution");

    // -----------------------------------------------------------------------
    // 5. Chat
    // -----------------------------------------------------------------------
    let alice_session = ChatSession::open(alice.ctx.clone(), groop.clone(), alice.user.clone()).await?;
    let bob_session = ChatSession::open(bob.ctx.clone(), groop.clone(), bob.user.clone()).await?;

    alice_session.send_message("Who is driving the first leg?", None).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let question = bob_session
        .snapshot()
        .messages
        .last()
        .cloned()
        .context("bob never received alice's message")?;
    bob_session
        .send_message("I will, coffee stop at noon", Some((&question).into()))
        .await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    if let Some(reply) = alice_session.snapshot().messages.last().cloned() {
        alice_session.toggle_reaction(&reply.id, "☕").await?;
    }

    // -----------------------------------------------------------------------
    // 6. Carol joins late and rotation runs with a member missing a key
    // -----------------------------------------------------------------------
    store.add_member(&groop, &carol.user.id)?;
    let served_by = alice
        .ctx
        .key_exchange
        .handle_new_member_joined(&groop, &carol.user.id, &[alice.user.id.clone()])
        .await;
    if served_by.is_none() {
        warn!(member = %carol.user.id, "New member is waiting for a key");
    }

    let carol_session = ChatSession::open(carol.ctx.clone(), groop.clone(), carol.user.clone()).await?;

    let rotation = alice
        .ctx
        .key_exchange
        .rotate_group_key(&groop, &alice.user.id)
        .await?;
    info!(
        version = rotation.version,
        complete = rotation.is_complete(),
        "Key rotated"
    );
    alice_session.send_message("New key, same road", None).await?;

    // Give the optimistic grace window time to run out
    tokio::time::sleep(config.optimistic_grace + Duration::from_millis(50)).await;

    // -----------------------------------------------------------------------
    // 7. Report
    // -----------------------------------------------------------------------
    for (name, session) in [("alice", &alice_session), ("bob", &bob_session), ("carol", &carol_session)] {
        let view = session.snapshot();
        info!(
            device = name,
            messages = view.messages.len(),
            items = view.items.len(),
            pending = view.pending.len(),
            "Final view"
        );
        for message in &view.messages {
            info!(device = name, sender = %message.sender_name, text = %message.text, "  message");
        }
        if print_json {
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    info!(notifications = store.notifications().len(), "Notifications queued");

    for session in [&alice_session, &bob_session, &carol_session] {
        session.close();
    }
    Ok(())
}
