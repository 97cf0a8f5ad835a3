use anyhow::Context;
use rabbit_resilience::message::ReceivedMessage;
use rabbit_resilience::rabbitmq::{handler_fn, ConnectionEvent, ConsumerSpec, DebugSpec, QueueSpec};
use rabbit_resilience::{ConnectionConfig, PublishRequest, Rabbit};
use std::env;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ENV_DEMO_QUEUE: &str = "RABBITMQ_DEMO_QUEUE";
const DEFAULT_DEMO_QUEUE: &str = "demo.greetings";

/// Log records already reach tracing through the notifier.
fn is_lifecycle(event: &ConnectionEvent) -> bool {
    matches!(event, ConnectionEvent::Connected | ConnectionEvent::Reconnected)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ConnectionConfig::from_env().context("invalid RabbitMQ settings")?;
    info!(uri = %config.redacted_uri(), "starting");

    let rabbit = Rabbit::new(config)?;

    let mut events = rabbit.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if is_lifecycle(&event) => info!(event = ?event, "connection event"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let queue_name = env::var(ENV_DEMO_QUEUE).unwrap_or_else(|_| DEFAULT_DEMO_QUEUE.to_string());
    let queue = QueueSpec::new(&queue_name);

    let handler = handler_fn(|message: ReceivedMessage| async move {
        info!(
            routing_key = %message.fields.routing_key,
            redelivered = message.fields.redelivered,
            "received: {}",
            message.content
        );
        Ok(())
    });

    rabbit
        .subscribe(
            ConsumerSpec::new(queue.clone(), handler)
                .debug(DebugSpec::enabled())
                .on_ready(|| info!("consumer ready")),
        )
        .await
        .context("subscribe failed")?;

    rabbit
        .publish(PublishRequest::to_queue(queue, "Hello from rabbit-resilience"))
        .await
        .context("publish failed")?;

    info!("waiting for messages, press Ctrl+C to stop");
    rabbit.run_until_interrupted().await?;
    Ok(())
}
