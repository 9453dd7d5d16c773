//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Register handlers for task types, both async and blocking
//! 2. Start an engine that pulls tasks from the shared queue
//! 3. Stop it cleanly with Ctrl-C
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example simple_worker
//! 3. In another terminal: cargo run --example task_client

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tasker::{
    Engine, EngineConfig, HandlerRegistry, RedisBackend, StoreConfig, TaskData, TaskHandler,
    HandlerResult,
};
use tracing::{info, Level};

#[derive(Debug, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct MessageArgs {
    message: String,
    #[serde(default)]
    uppercase: bool,
}

/// Handler implemented as a type rather than a closure
struct AuditHandler;

#[async_trait::async_trait]
impl TaskHandler for AuditHandler {
    async fn handle(&self, data: Option<&TaskData>) -> HandlerResult {
        match data {
            Some(data) => info!("Audit: message task with {} fields", data.len()),
            None => info!("Audit: message task without data"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting simple worker example");

    let store = StoreConfig::from_env()?;
    let backend = Arc::new(RedisBackend::connect(&store).await?);

    let mut handlers = HandlerRegistry::new();
    handlers
        .register_fn("add", |args: AddArgs| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            info!("Adding {} + {} = {}", args.a, args.b, args.a + args.b);
            Ok(())
        })
        .register_fn("message", |args: MessageArgs| async move {
            let result = if args.uppercase {
                args.message.to_uppercase()
            } else {
                args.message.to_lowercase()
            };
            info!("Processed message: '{}' -> '{}'", args.message, result);
            Ok(())
        })
        .register("message", AuditHandler)
        .register_blocking("fibonacci", |args: TaskData| {
            let n = args.get("n").and_then(|v| v.as_u64()).unwrap_or(10);
            let (mut a, mut b) = (0u64, 1u64);
            for _ in 0..n {
                (a, b) = (b, a.wrapping_add(b));
            }
            info!("fib({}) = {}", n, a);
            Ok(())
        })
        .register_fn("fail", |_: TaskData| async move {
            anyhow::bail!("this task always fails")
        });

    let config = EngineConfig {
        worker_count: 2,
        ..Default::default()
    };

    let engine = Engine::new(backend, store, handlers, config).await?;
    info!("Worker {} started. Press Ctrl+C to stop.", engine.worker_id());

    engine.run_until_ctrl_c().await?;

    info!("Simple worker example completed");
    Ok(())
}
