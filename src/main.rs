use async_trait::async_trait;
use durohost::bus::{Delivery, InMemoryBus, Message, MessageHandler, Publisher, SubscriptionBinder, SubscriptionSpec};
use durohost::runtime::catalog::{DefinitionCatalog, ProcessDefinition, Step};
use durohost::runtime::{LoggingConfig, Orchestrator, init_logging};
use durohost::CORRELATION_HEADER;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct StartGreeting {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct GreetingRequested {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct GreetingReply {
    text: String,
}

#[derive(Serialize, Deserialize)]
struct Greeting {
    name: String,
}

/// Answers every greeting request, echoing the correlation header back.
struct Responder {
    bus: InMemoryBus,
}

#[async_trait]
impl MessageHandler for Responder {
    async fn handle(&self, message: Message) -> Delivery {
        let Ok(request) = message.decode::<GreetingRequested>() else {
            return Delivery::Reject;
        };
        let Some(token) = message.header(CORRELATION_HEADER) else {
            return Delivery::Reject;
        };
        let reply = GreetingReply {
            text: format!("Hello, {}!", request.name),
        };
        let Ok(reply) = Message::json("GreetingReply", &reply) else {
            return Delivery::Reject;
        };
        match self
            .bus
            .publish(reply.with_header(CORRELATION_HEADER, token), Some("Greeter"))
            .await
        {
            Ok(()) => Delivery::Ack,
            Err(_) => Delivery::Requeue,
        }
    }
}

fn greeter() -> Result<DefinitionCatalog, durohost::OrchestratorError> {
    let greeter = ProcessDefinition::builder("Greeter", "demo", "1.0.0")
        .on_start("StartGreeting", |ctx, input: StartGreeting| async move {
            ctx.publish_correlated("GreetingRequested", &GreetingRequested { name: input.name.clone() }, Some("Responder"))?;
            Ok(Step::await_message("GreetingReply", &Greeting { name: input.name })?.with_delay(Duration::from_secs(5)))
        })
        .on_resume("GreetingReply", |ctx, state: Greeting, reply: GreetingReply| async move {
            tracing::info!(instance_id = %ctx.instance_id(), name = %state.name, text = %reply.text, "Greeting received");
            Ok(Step::Complete)
        })
        .on_timer(|ctx, state: Greeting| async move {
            tracing::warn!(instance_id = %ctx.instance_id(), name = %state.name, "No reply in time");
            Ok(Step::Cancel)
        })
        .build()?;
    DefinitionCatalog::builder().register(greeter).build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LoggingConfig::default())?;

    let bus = InMemoryBus::new();
    let _responder = bus
        .bind(
            SubscriptionSpec {
                subscription_id: "Responder".to_string(),
                type_tag: "GreetingRequested".to_string(),
                topic: Some("Responder".to_string()),
                prefetch: 10,
            },
            std::sync::Arc::new(Responder { bus: bus.clone() }),
        )
        .await?;

    let orchestrator = Orchestrator::builder("Greeter", greeter()?).bus(bus.clone()).build()?;
    orchestrator.start().await?;

    for name in ["Alice", "Bob", "Carol"] {
        let start = Message::json("StartGreeting", &StartGreeting { name: name.to_string() })?;
        bus.publish(start, Some("Greeter")).await?;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.stop(Duration::from_secs(5)).await;

    let metrics = orchestrator.metrics();
    tracing::info!(
        started = metrics.started,
        completed = metrics.completed,
        canceled = metrics.canceled,
        "Demo finished"
    );
    Ok(())
}
