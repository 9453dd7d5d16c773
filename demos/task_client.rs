//! Task client example
//!
//! This example demonstrates how to:
//! 1. Submit tasks to the queue
//! 2. Jump the queue with prioritized tasks
//! 3. Submit tasks in batches
//! 4. Inspect the backlog
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Make sure a worker is running (run simple_worker example)
//! 3. Run: cargo run --example task_client

use serde::Serialize;
use serde_json::json;
use tasker::{StoreConfig, TaskClient};
use tracing::{info, Level};

#[derive(Debug, Serialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting task client example");

    let store = StoreConfig::from_env()?;
    let client = TaskClient::connect(&store).await?;

    info!("=== Example 1: Regular tasks ===");
    for i in 0..5 {
        let key = client.create("add", &AddArgs { a: i, b: i * 2 }).await?;
        info!("Submitted add task {}: {} + {}", key, i, i * 2);
    }

    info!("=== Example 2: Prioritized task ===");
    let key = client
        .prioritize("message", &json!({"message": "Urgent", "uppercase": true}))
        .await?;
    info!("Submitted prioritized message task {}", key);

    info!("=== Example 3: Batch submission ===");
    let batch: Vec<_> = (10..20).map(|n| json!({"n": n})).collect();
    let keys = client.create_batch("fibonacci", &batch).await?;
    info!("Submitted {} fibonacci tasks", keys.len());

    info!("=== Example 4: Task without arguments ===");
    client.create("message", &()).await?;

    info!("=== Example 5: Failing task ===");
    client.create("fail", &()).await?;

    info!("=== Example 6: Task nobody handles ===");
    client.create("unregistered", &json!({"ignored": true})).await?;

    info!("Backlog: {} tasks", client.backlog().await?);
    info!("Task client example completed");
    Ok(())
}
