use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_batch_consumer::batch_processor::RecordHandler;
use kafka_batch_consumer::config::Config;
use kafka_batch_consumer::consumer_loop::{ConsumerHandle, ConsumerLoop};
use kafka_batch_consumer::kafka_client::{ConsumerConfigBuilder, KafkaConsumerClient};
use kafka_batch_consumer::offset_tracker::OffsetTracker;
use kafka_batch_consumer::rebalance_coordinator::RebalanceCoordinator;
use kafka_batch_consumer::serve::{health_router, serve};
use kafka_batch_consumer::types::Record;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

/// Payload shape the demo producer emits: an event name plus arbitrary
/// extra properties.
#[derive(Debug, Deserialize)]
struct DemoEvent {
    #[serde(default)]
    event: String,

    #[serde(flatten)]
    properties: serde_json::Map<String, serde_json::Value>,
}

/// Demo handler: decodes the payload as JSON and sleeps a configurable
/// interval per record, standing in for real downstream work that can
/// easily outrun the group's liveness deadline.
struct JsonLoggingHandler {
    delay: Duration,
}

#[async_trait]
impl RecordHandler for JsonLoggingHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        let payload = record
            .payload
            .as_deref()
            .context("record has no payload")?;
        let event: DemoEvent =
            serde_json::from_slice(payload).context("payload is not valid JSON")?;

        debug!(
            partition = %record.partition(),
            offset = record.offset(),
            event = %event.event,
            properties = event.properties.len(),
            "Handled record"
        );
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn spawn_consumer(
    config: &Config,
    handler: Arc<JsonLoggingHandler>,
    index: usize,
) -> Result<(String, ConsumerHandle, tokio::task::JoinHandle<Result<()>>)> {
    let client_id = format!("{}-{}", config.client_id_prefix, index);

    let tracker = Arc::new(OffsetTracker::new());
    let coordinator = Arc::new(RebalanceCoordinator::new(
        Arc::clone(&tracker),
        client_id.clone(),
    ));

    let kafka_config = ConsumerConfigBuilder::new(&config.kafka_hosts, &config.kafka_consumer_group)
        .with_client_id(&client_id)
        .with_tls(config.kafka_tls)
        .with_auto_offset_reset(&config.auto_offset_reset)
        .with_max_partition_fetch_bytes(config.max_partition_fetch_bytes)
        .with_session_timeout_ms(config.session_timeout_ms)
        .with_heartbeat_interval_ms(config.heartbeat_interval_ms)
        .with_max_poll_interval_ms(config.max_poll_interval_ms)
        .build();

    let client = KafkaConsumerClient::subscribe(
        kafka_config,
        Arc::clone(&coordinator),
        &config.topics(),
        config.fetch_max_records,
        client_id.clone(),
    )
    .with_context(|| format!("failed to create consumer {client_id}"))?;

    let consumer = ConsumerLoop::new(
        client,
        handler,
        tracker,
        coordinator,
        config.loop_settings(),
        client_id.clone(),
    );
    let handle = consumer.handle();
    let join = tokio::spawn(consumer.run());

    Ok((client_id, handle, join))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting kafka batch consumer");

    let config = Config::init_with_defaults()
        .context("failed to load configuration from environment variables")?;
    config.validate()?;
    info!(
        hosts = %config.kafka_hosts,
        group = %config.kafka_consumer_group,
        topics = ?config.topics(),
        consumers = config.consumer_count,
        "Configuration loaded"
    );

    // Health and metrics server
    let bind = config.bind_address();
    let server_handle = tokio::task::spawn(async move {
        serve(health_router(), &bind)
            .await
            .expect("failed to start health server");
    });
    info!("Health server listening on {}", config.bind_address());

    let handler = Arc::new(JsonLoggingHandler {
        delay: config.process_delay(),
    });

    let mut consumers = Vec::with_capacity(config.consumer_count);
    for index in 0..config.consumer_count {
        consumers.push(spawn_consumer(&config, Arc::clone(&handler), index)?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, closing consumers");

    for (client_id, handle, _) in consumers.iter_mut() {
        info!(client_id = %client_id, "Closing consumer");
        handle.close().await;
    }

    for (client_id, _, join) in consumers {
        match join.await {
            Ok(Ok(())) => info!(client_id = %client_id, "Consumer exited cleanly"),
            Ok(Err(e)) => {
                error!(client_id = %client_id, error = format!("{e:#}"), "Consumer exited with error")
            }
            Err(e) => warn!(client_id = %client_id, error = %e, "Consumer task did not join"),
        }
    }

    server_handle.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use kafka_batch_consumer::types::Partition;

    use super::*;

    fn handler() -> JsonLoggingHandler {
        JsonLoggingHandler {
            delay: Duration::ZERO,
        }
    }

    fn record_with(payload: &[u8]) -> Record {
        Record::new(Partition::new("test-topic", 0), 0).with_payload(payload.to_vec())
    }

    #[tokio::test]
    async fn handler_accepts_json_payloads() {
        let record = record_with(br#"{"event":"pageview","url":"/","count":3}"#);
        assert!(handler().handle(&record).await.is_ok());
    }

    #[tokio::test]
    async fn handler_rejects_non_json_payloads() {
        let record = record_with(b"not json at all");
        assert!(handler().handle(&record).await.is_err());
    }

    #[tokio::test]
    async fn handler_rejects_missing_payloads() {
        let record = Record::new(Partition::new("test-topic", 0), 0);
        assert!(handler().handle(&record).await.is_err());
    }

    #[test]
    fn demo_event_tolerates_missing_event_name() {
        let event: DemoEvent = serde_json::from_str(r#"{"url":"/pricing"}"#).unwrap();
        assert_eq!(event.event, "");
        assert_eq!(event.properties.len(), 1);
    }
}
