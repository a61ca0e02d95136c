//! Round-trips a few events through the manager over the loopback transport,
//! with outgoing validation and a small drop-oldest buffer.
//!
//! Run with: `cargo run --example echo_roundtrip`

use eventwire_transport::{
    BackpressureConfig, BackpressureStrategy, CancellationTokenSource, GenericEvent,
    LoopbackTransport, ManagerOptions, TransportManager, ValidationConfig,
};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("echo_roundtrip=info,eventwire_transport=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let manager = TransportManager::new(ManagerOptions {
        backpressure: BackpressureConfig {
            strategy: BackpressureStrategy::DropOldest,
            buffer_size: 16,
            ..BackpressureConfig::default()
        },
        ..ManagerOptions::default()
    });

    manager
        .set_validation_config(Some(ValidationConfig {
            allowed_event_types: HashSet::from(["greeting".to_string()]),
            required_fields: vec!["who".to_string()],
            fail_fast: true,
            ..ValidationConfig::default()
        }))
        .await?;

    manager
        .set_transport(Some(Arc::new(LoopbackTransport::new("loopback"))))
        .await;

    let (_source, token) = CancellationTokenSource::new();
    manager.start(&token).await?;

    let mut events = manager.receive();

    for who in ["world", "crew", "future"] {
        let event = GenericEvent::new("greeting").with_field("who", who);
        manager.send(&token, &event).await?;
    }

    // a malformed event is rejected before it touches the wire
    if let Err(error) = manager.send(&token, &GenericEvent::new("greeting")).await {
        tracing::info!(%error, "rejected as expected");
    }

    for _ in 0..3 {
        if let Some(envelope) = events.next().await {
            tracing::info!(
                id = envelope.id(),
                transport = %envelope.metadata.transport,
                passed = envelope.validation_passed(),
                "received"
            );
        }
    }

    let metrics = manager.backpressure_metrics();
    tracing::info!(
        delivered = metrics.events_delivered,
        dropped = metrics.events_dropped,
        "backpressure summary"
    );

    manager.stop(&token).await?;
    Ok(())
}
