//! Production client over rdkafka's synchronous `BaseConsumer`.
//!
//! librdkafka invokes rebalance callbacks from inside poll/commit calls on
//! the calling thread; `GroupConsumerContext` forwards them straight to the
//! `RebalanceCoordinator` with the consumer handle wrapped as `OffsetOps`,
//! so flush-commits and seeks happen before the callback returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, CommitError, ConsumerClient, OffsetOps};
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::types::{Partition, Record, RecordBatch};

/// Bound on the blocking offset lookups and seeks issued from inside
/// rebalance callbacks.
const CALLBACK_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer configuration builder pinning the options this client relies
/// on: offsets are stored and committed manually, never automatically.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // Offset handling is the loop's job; the client must never commit
        // or store positions on its own.
        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    /// Enable TLS/SSL for the broker connection.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset:
    /// "earliest" or "latest".
    pub fn with_auto_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_max_partition_fetch_bytes(mut self, bytes: u32) -> Self {
        self.config
            .set("max.partition.fetch.bytes", bytes.to_string());
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Forwards librdkafka rebalance events to the coordinator.
pub struct GroupConsumerContext {
    coordinator: Arc<RebalanceCoordinator>,
}

impl GroupConsumerContext {
    pub fn new(coordinator: Arc<RebalanceCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl ClientContext for GroupConsumerContext {}

impl ConsumerContext for GroupConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // Cooperative-sticky sends empty revokes whenever group
                // membership changes without moving partitions.
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }

                let revoked: Vec<Partition> = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                info!(partitions = revoked.len(), "Rebalance revoking partitions");

                let ops = ConsumerOffsetOps {
                    consumer: base_consumer,
                    timeout: CALLBACK_OP_TIMEOUT,
                };
                self.coordinator.on_revoked(&ops, &revoked);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }

                let assigned: Vec<Partition> = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                info!(partitions = assigned.len(), "Rebalance assigned partitions");

                let ops = ConsumerOffsetOps {
                    consumer: base_consumer,
                    timeout: CALLBACK_OP_TIMEOUT,
                };
                self.coordinator.on_assigned(&ops, &assigned);
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!(error = %e, "Post-rebalance error");
            }
        }
    }
}

/// `OffsetOps` over the consumer handle librdkafka passes into the
/// rebalance callbacks. Lives only for the duration of one callback.
struct ConsumerOffsetOps<'a, C: ConsumerContext> {
    consumer: &'a BaseConsumer<C>,
    timeout: Duration,
}

impl<C: ConsumerContext> OffsetOps for ConsumerOffsetOps<'_, C> {
    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        let tpl = offsets_to_tpl(offsets).map_err(CommitError::classify)?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(CommitError::classify)
    }

    fn last_committed(&self, partition: &Partition) -> Result<Option<i64>, ClientError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(partition.topic(), partition.partition_number());
        let committed = self.consumer.committed_offsets(tpl, self.timeout)?;
        Ok(committed.elements().first().and_then(|elem| match elem.offset() {
            Offset::Offset(offset) => Some(offset),
            _ => None,
        }))
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.consumer.seek(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            self.timeout,
        )?;
        Ok(())
    }
}

fn offsets_to_tpl(offsets: &HashMap<Partition, i64>) -> Result<TopicPartitionList, KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*next_offset),
        )?;
    }
    Ok(tpl)
}

fn partitions_to_tpl(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

/// `ConsumerClient` over a synchronous `BaseConsumer`.
///
/// Blocking client calls are bounded and run inside `block_in_place`, so
/// instances must live on the multi-thread tokio runtime. The inner handle
/// is held in an `Option` to make `close` idempotent.
pub struct KafkaConsumerClient {
    consumer: Option<BaseConsumer<GroupConsumerContext>>,
    fetch_max_records: usize,
    client_id: String,
}

impl KafkaConsumerClient {
    /// Create the consumer and subscribe it to `topics`. The coordinator
    /// receives every rebalance callback from this point on.
    pub fn subscribe(
        config: ClientConfig,
        coordinator: Arc<RebalanceCoordinator>,
        topics: &[String],
        fetch_max_records: usize,
        client_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let client_id = client_id.into();
        let context = GroupConsumerContext::new(coordinator);
        let consumer: BaseConsumer<GroupConsumerContext> =
            config.create_with_context(context)?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        info!(client_id = %client_id, topics = ?topics, "Subscribed consumer");

        Ok(Self {
            consumer: Some(consumer),
            fetch_max_records,
            client_id,
        })
    }

    fn consumer(&self) -> Result<&BaseConsumer<GroupConsumerContext>, ClientError> {
        self.consumer.as_ref().ok_or(ClientError::Closed)
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn fetch(&mut self, max_wait: Duration) -> Result<RecordBatch, ClientError> {
        task::block_in_place(|| {
            let consumer = self.consumer()?;
            let mut records = Vec::new();

            match consumer.poll(max_wait) {
                None => return Ok(RecordBatch::default()),
                Some(Err(e)) => return Err(ClientError::Kafka(e)),
                Some(Ok(msg)) => records.push(Record::from(&msg)),
            }

            // Drain whatever else librdkafka already has queued locally,
            // without blocking again.
            while records.len() < self.fetch_max_records {
                match consumer.poll(Duration::ZERO) {
                    Some(Ok(msg)) => records.push(Record::from(&msg)),
                    Some(Err(e)) => {
                        warn!(client_id = %self.client_id, error = %e, "Error draining fetch queue");
                        break;
                    }
                    None => break,
                }
            }

            Ok(RecordBatch::new(records))
        })
    }

    fn pause(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer()?.pause(&partitions_to_tpl(partitions))?;
        Ok(())
    }

    fn resume(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer()?.resume(&partitions_to_tpl(partitions))?;
        Ok(())
    }

    async fn probe_liveness(&mut self) -> Result<(), ClientError> {
        task::block_in_place(|| {
            let consumer = self.consumer()?;
            // A zero-duration poll serves heartbeats and queued callbacks.
            // Paused partitions deliver nothing (librdkafka purges their
            // queues on pause), so a surfacing record means delivery was
            // not actually stopped; seek back to it instead of losing it.
            match consumer.poll(Duration::ZERO) {
                None => Ok(()),
                Some(Err(e)) => Err(ClientError::Kafka(e)),
                Some(Ok(msg)) => {
                    warn!(
                        client_id = %self.client_id,
                        topic = msg.topic(),
                        partition = msg.partition(),
                        offset = msg.offset(),
                        "Record surfaced during liveness probe, seeking back"
                    );
                    consumer.seek(
                        msg.topic(),
                        msg.partition(),
                        Offset::Offset(msg.offset()),
                        CALLBACK_OP_TIMEOUT,
                    )?;
                    Ok(())
                }
            }
        })
    }

    async fn commit(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        task::block_in_place(|| {
            let consumer = self
                .consumer
                .as_ref()
                .ok_or(CommitError::Connection(KafkaError::Canceled))?;
            let tpl = offsets_to_tpl(offsets).map_err(CommitError::classify)?;
            consumer.commit(&tpl, CommitMode::Sync).map_err(CommitError::classify)
        })
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if let Some(consumer) = self.consumer.take() {
            info!(client_id = %self.client_id, "Closing consumer, leaving group");
            consumer.unsubscribe();
            // Dropping the handle closes the underlying consumer and
            // finalizes the group departure.
            drop(consumer);
        }
        Ok(())
    }
}
