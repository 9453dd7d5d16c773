//! Delayed tasks example
//!
//! This example demonstrates how to:
//! 1. Schedule a task to run after a delay
//! 2. Coalesce repeated requests for the same identifier into one run
//! 3. Guard a critical section with a named lock
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example delayed_tasks

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tasker::{
    Backend, Engine, EngineConfig, HandlerRegistry, KeyNamespace, LockManager, RedisBackend,
    StoreConfig, TaskClient,
};
use tracing::{info, warn, Level};

#[derive(Debug, Deserialize)]
struct ReindexArgs {
    user: String,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    full: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting delayed tasks example");

    let store = StoreConfig::from_env()?;
    let backend: Arc<dyn Backend> = Arc::new(RedisBackend::connect(&store).await?);
    let keys = KeyNamespace::new(store.key_prefix.clone());
    let locks = LockManager::new(backend.clone(), keys.clone());

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("reindex", move |args: ReindexArgs| {
        let locks = locks.clone();
        async move {
            let lock_name = format!("reindex:{}", args.user);
            let Some(token) = locks.acquire(&lock_name, Duration::from_secs(5)).await? else {
                anyhow::bail!("could not lock {}", lock_name);
            };

            info!(
                "Reindexing {} (fields: {:?}, full: {})",
                args.user, args.fields, args.full
            );
            tokio::time::sleep(Duration::from_millis(200)).await;

            locks.release(&lock_name, &token).await?;
            Ok::<(), anyhow::Error>(())
        }
    });

    let engine = Engine::new(backend.clone(), store, handlers, EngineConfig::default()).await?;
    let shutdown = engine.shutdown_handle();
    let client = TaskClient::new(backend, &keys);

    info!("=== Several edits to the same user within the delay window ===");
    client
        .delay_unique("reindex", "user:42", &json!({"user": "42", "fields": ["name"]}), Duration::from_secs(2))
        .await?;
    client
        .delay_unique("reindex", "user:42", &json!({"fields": ["name", "email"]}), Duration::from_secs(2))
        .await?;
    let due_at = client
        .delay_unique("reindex", "user:42", &json!({"full": true}), Duration::from_secs(2))
        .await?;
    info!(
        "Pending delayed tasks: {} (due at {:.0})",
        client.pending_delayed().await?,
        due_at
    );

    info!("=== A different user is scheduled separately ===");
    client
        .delay_unique_default("reindex", "user:7", &json!({"user": "7"}))
        .await?;
    info!("Pending delayed tasks: {}", client.pending_delayed().await?);

    // Stop after the second user's default delay has passed
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.shutdown();
    });

    if let Err(e) = engine.run().await {
        warn!("Engine stopped with error: {}", e);
    }

    info!("Delayed tasks example completed");
    Ok(())
}
