//! Publishes a few order events and handles them locally.
//!
//! Needs a Redis server; set `REDIS_URL` to override
//! `redis://127.0.0.1:6379`. Set `RUST_LOG=eda_runtime=debug` for poll-loop
//! detail.

use std::time::Duration;

use eda_runtime::{
    EdaRuntime, EventEnvelope, EventHandler, HandlerError, HandlerRegistry, Observation, Topic,
};
use tracing_subscriber::EnvFilter;

struct PrintOrder;

#[tonic::async_trait]
impl EventHandler for PrintOrder {
    async fn handle(
        &self,
        event: &EventEnvelope,
        observer_id: Option<&str>,
    ) -> Result<(), HandlerError> {
        match observer_id {
            Some(observer) => println!("{observer} saw {} on {}", event.name, event.partition_key),
            None => println!("{} for {}: {:?}", event.name, event.partition_key, event.payload),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("eda_runtime=info")),
        )
        .init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let handlers = HandlerRegistry::builder()
        .handler("OrderPlaced", |_scope| PrintOrder)
        .handler("OrderShipped", |_scope| PrintOrder)
        .observer("Customer", "Order", "OrderShipped", |_scope| PrintOrder)
        .build()?;

    let runtime = EdaRuntime::builder("demo")
        .redis_url(url)
        .topic(Topic::builder("orders").partitions(4).build()?)
        .topic(Topic::builder("observers").partitions(2).build()?)
        .observer_topic("observers")
        .handlers(handlers)
        .build()
        .await?;

    runtime
        .observe(&Observation {
            observer_type: "Customer".to_string(),
            observer_id: "customer-1".to_string(),
            observable_type: "Order".to_string(),
            observable_id: "order-1".to_string(),
            event_type: "OrderShipped".to_string(),
        })
        .await?;
    runtime.start().await?;

    for order in ["order-1", "order-2", "order-3"] {
        runtime
            .publish(
                "orders",
                vec![
                    EventEnvelope::new("OrderPlaced", order)
                        .with_field("total", serde_json::json!(42)),
                    EventEnvelope::new("OrderShipped", order).observed_as("Order", order),
                ],
            )
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    runtime.dispose().await;
    Ok(())
}
