//! Per-topic producer with delivery accounting
//!
//! A [`Writer`] owns one producer connection for a (cluster, topic) pair. It
//! chooses the partition of each message itself and hands the producer an
//! explicit partition. Delivery reports are counted by the producer context;
//! a single background task drains those counters once per second into the
//! writer's own counters, which are published in the statistics registry.

use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::oauth::TokenProvider;
use crate::partitioner::{Partitioner, Partitioning};
use crate::stats::StatsRegistry;
use parking_lot::Mutex;
use rdkafka::client::OAuthToken;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::{ClientContext, Message};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Statistic name of writer counters
pub const STAT_NAME: &str = "kafka";
/// Messages delivered
pub const STAT_WRITE_MESSAGES: &str = "write_messages";
/// Messages that failed delivery
pub const STAT_WRITE_ERRORS: &str = "write_errors";

// Client-side only; brokers take the principal from the token
const OAUTH_PRINCIPAL: &str = "kafka-alerts";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const PARTITION_COUNT_TTL: Duration = Duration::from_secs(300);

/// Counters drained from a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub messages: i64,
    pub errors: i64,
    pub last_error: Option<String>,
}

/// Optional one-shot notification of a message's delivery
pub struct DeliveryAck(Option<oneshot::Sender<KafkaResult<(i32, i64)>>>);

impl DeliveryAck {
    /// Fire-and-forget
    pub fn none() -> Self {
        DeliveryAck(None)
    }

    /// An ack plus the receiver that resolves with `(partition, offset)`
    pub fn channel() -> (Self, oneshot::Receiver<KafkaResult<(i32, i64)>>) {
        let (tx, rx) = oneshot::channel();
        (DeliveryAck(Some(tx)), rx)
    }

    /// Resolve the ack, if anyone is waiting
    pub fn complete(self, result: KafkaResult<(i32, i64)>) {
        if let Some(tx) = self.0 {
            let _ = tx.send(result);
        }
    }
}

/// Delivery counters shared by the producer contexts. Reading them resets
/// them, so only the writer's poller calls [`DeliveryCounters::take`].
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    messages: AtomicI64,
    errors: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl DeliveryCounters {
    fn record(&self, result: &DeliveryResult<'_>, ack: DeliveryAck) {
        match result {
            Ok(message) => {
                self.messages.fetch_add(1, Ordering::Relaxed);
                ack.complete(Ok((message.partition(), message.offset())));
            }
            Err((err, message)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some(err.to_string());
                debug!(
                    topic = message.topic(),
                    partition = message.partition(),
                    error = %err,
                    "Message delivery failed"
                );
                ack.complete(Err(err.clone()));
            }
        }
    }

    /// Read and reset the counters
    pub fn take(&self) -> WriterStats {
        WriterStats {
            messages: self.messages.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
            last_error: self.last_error.lock().take(),
        }
    }
}

fn log_librdkafka(level: RDKafkaLogLevel, fac: &str, log_message: &str) {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => {
            error!(target: "librdkafka", "{} {}", fac, log_message)
        }
        RDKafkaLogLevel::Warning => warn!(target: "librdkafka", "{} {}", fac, log_message),
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
            info!(target: "librdkafka", "{} {}", fac, log_message)
        }
        RDKafkaLogLevel::Debug => debug!(target: "librdkafka", "{} {}", fac, log_message),
    }
}

/// Producer context that counts deliveries
#[derive(Debug, Default)]
pub struct WriterContext {
    counters: DeliveryCounters,
}

impl ClientContext for WriterContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        log_librdkafka(level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(target: "librdkafka", error = %error, "{}", reason);
    }
}

impl ProducerContext for WriterContext {
    type DeliveryOpaque = Box<DeliveryAck>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, ack: Self::DeliveryOpaque) {
        self.counters.record(delivery_result, *ack);
    }
}

/// Producer context for OAUTHBEARER clusters, hands librdkafka tokens from a
/// [`TokenProvider`]
pub struct OAuthWriterContext {
    counters: DeliveryCounters,
    token_provider: Arc<dyn TokenProvider>,
}

impl OAuthWriterContext {
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            counters: DeliveryCounters::default(),
            token_provider,
        }
    }
}

impl ClientContext for OAuthWriterContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        log_librdkafka(level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(target: "librdkafka", error = %error, "{}", reason);
    }

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> std::result::Result<OAuthToken, Box<dyn std::error::Error>> {
        let token = self.token_provider.token()?;
        Ok(OAuthToken {
            lifetime_ms: token.lifetime_ms(),
            token: token.token,
            principal_name: OAUTH_PRINCIPAL.to_string(),
        })
    }
}

impl ProducerContext for OAuthWriterContext {
    type DeliveryOpaque = Box<DeliveryAck>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, ack: Self::DeliveryOpaque) {
        self.counters.record(delivery_result, *ack);
    }
}

/// Producer contexts usable by a [`Writer`]
pub trait DeliveryContext: ProducerContext<DeliveryOpaque = Box<DeliveryAck>> + 'static {
    fn counters(&self) -> &DeliveryCounters;
}

impl DeliveryContext for WriterContext {
    fn counters(&self) -> &DeliveryCounters {
        &self.counters
    }
}

impl DeliveryContext for OAuthWriterContext {
    fn counters(&self) -> &DeliveryCounters {
        &self.counters
    }
}

/// The producer operations a [`Writer`] needs
pub trait ProducerConnection: Send + Sync {
    /// Queue a message for `partition`. Does not wait for delivery.
    fn enqueue(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
        ack: DeliveryAck,
    ) -> Result<()>;

    /// Number of partitions of `topic`. Blocks for up to `timeout`.
    fn partition_count(&self, topic: &str, timeout: Duration) -> Result<i32>;

    /// Read and reset the delivery counters
    fn take_stats(&self) -> WriterStats;

    /// Flush queued messages. Blocks for up to `timeout`.
    fn close(&self, timeout: Duration);
}

impl<C: DeliveryContext> ProducerConnection for ThreadedProducer<C> {
    fn enqueue(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
        ack: DeliveryAck,
    ) -> Result<()> {
        let mut record =
            BaseRecord::<[u8], [u8], Box<DeliveryAck>>::with_opaque_to(topic, Box::new(ack))
                .partition(partition)
                .payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.send(record).map_err(|(err, _)| Error::KafkaError(err))
    }

    fn partition_count(&self, topic: &str, timeout: Duration) -> Result<i32> {
        let metadata = self.client().fetch_metadata(Some(topic), timeout)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| Error::MetadataError(format!("no metadata for topic {:?}", topic)))?;
        if let Some(err) = topic_metadata.error() {
            return Err(Error::MetadataError(format!(
                "topic {:?}: {:?}",
                topic, err
            )));
        }
        Ok(topic_metadata.partitions().len() as i32)
    }

    fn take_stats(&self) -> WriterStats {
        self.context().counters().take()
    }

    fn close(&self, timeout: Duration) {
        if let Err(err) = self.flush(timeout) {
            warn!(error = %err, "Failed to flush producer");
        }
    }
}

/// Create a producer from `settings`
pub fn connect(settings: crate::config::ProducerSettings) -> Result<Arc<dyn ProducerConnection>> {
    match settings.token_provider {
        None => {
            let producer: ThreadedProducer<WriterContext> = settings
                .client_config
                .create_with_context(WriterContext::default())?;
            Ok(Arc::new(producer))
        }
        Some(provider) => {
            let producer: ThreadedProducer<OAuthWriterContext> = settings
                .client_config
                .create_with_context(OAuthWriterContext::new(provider))?;
            Ok(Arc::new(producer))
        }
    }
}

struct Poller {
    stats_key: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Writes messages for one (cluster, topic) pair
pub struct Writer {
    cluster: String,
    topic: String,
    connection: Arc<dyn ProducerConnection>,
    timeout: Duration,
    batch_timeout: Duration,
    partitioners: Mutex<HashMap<Partitioning, Box<dyn Partitioner>>>,
    partition_count: Mutex<Option<(i32, Instant)>>,
    message_count: Arc<AtomicI64>,
    error_count: Arc<AtomicI64>,
    stats: Arc<StatsRegistry>,
    diag: Arc<dyn Diagnostic>,
    poller: Mutex<Option<Poller>>,
    closed: AtomicBool,
}

impl Writer {
    pub fn new(
        cluster: impl Into<String>,
        topic: impl Into<String>,
        connection: Arc<dyn ProducerConnection>,
        timeout: Duration,
        batch_timeout: Duration,
        stats: Arc<StatsRegistry>,
        diag: Arc<dyn Diagnostic>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            topic: topic.into(),
            connection,
            timeout,
            batch_timeout,
            partitioners: Mutex::new(HashMap::new()),
            partition_count: Mutex::new(None),
            message_count: Arc::new(AtomicI64::new(0)),
            error_count: Arc::new(AtomicI64::new(0)),
            stats,
            diag,
            poller: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish the counters and start the poller. Must run inside a tokio
    /// runtime.
    pub fn open(&self) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }

        let tags = BTreeMap::from([
            ("cluster".to_string(), self.cluster.clone()),
            ("topic".to_string(), self.topic.clone()),
        ]);
        let (stats_key, stat_map) = self.stats.new_statistic(STAT_NAME, tags);
        stat_map.set(STAT_WRITE_MESSAGES, self.message_count.clone());
        stat_map.set(STAT_WRITE_ERRORS, self.error_count.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let drain = Drain {
            connection: Arc::clone(&self.connection),
            message_count: Arc::clone(&self.message_count),
            error_count: Arc::clone(&self.error_count),
            diag: Arc::clone(&self.diag),
        };
        let task = tokio::spawn(drain.run(shutdown_rx));

        debug!(cluster = %self.cluster, topic = %self.topic, "Opened Kafka writer");
        *poller = Some(Poller {
            stats_key,
            shutdown,
            task,
        });
    }

    /// Stop the poller, flush and release the connection, and remove the
    /// statistic. Returns once the poller has exited.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = self.poller.lock().take();

        if let Some(poller) = &poller {
            let _ = poller.shutdown.send(true);
        }
        let stats_key = match poller {
            Some(poller) => {
                if let Err(err) = poller.task.await {
                    warn!(error = %err, topic = %self.topic, "Stats poller exited abnormally");
                }
                Some(poller.stats_key)
            }
            None => None,
        };

        let connection = Arc::clone(&self.connection);
        let timeout = self.timeout;
        if let Err(err) = tokio::task::spawn_blocking(move || connection.close(timeout)).await {
            warn!(error = %err, topic = %self.topic, "Failed to close producer");
        }

        // Deliveries reported during the flush
        Drain {
            connection: Arc::clone(&self.connection),
            message_count: Arc::clone(&self.message_count),
            error_count: Arc::clone(&self.error_count),
            diag: Arc::clone(&self.diag),
        }
        .drain();

        if let Some(key) = stats_key {
            self.stats.delete_statistic(&key);
        }
        debug!(cluster = %self.cluster, topic = %self.topic, "Closed Kafka writer");
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Messages delivered so far, as of the last poll
    pub fn message_count(&self) -> i64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Failed deliveries so far, as of the last poll
    pub fn error_count(&self) -> i64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Queue a message. Delivery failures only show up in the error count.
    pub async fn write_message(
        &self,
        partitioning: Partitioning,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<()> {
        self.enqueue(partitioning, key, value, DeliveryAck::none())
            .await
    }

    /// Write a message and wait for its delivery report, for at most the
    /// network timeout plus the batch timeout. Returns `(partition, offset)`.
    pub async fn write_message_sync(
        &self,
        partitioning: Partitioning,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<(i32, i64)> {
        let (ack, delivered) = DeliveryAck::channel();
        self.enqueue(partitioning, key, value, ack).await?;

        let wait = self.timeout + self.batch_timeout;
        match tokio::time::timeout(wait, delivered).await {
            Ok(report) => Ok(report??),
            Err(_) => Err(Error::Timeout(format!(
                "no delivery report for topic {:?} after {:?}",
                self.topic, wait
            ))),
        }
    }

    async fn enqueue(
        &self,
        partitioning: Partitioning,
        key: Option<&[u8]>,
        value: &[u8],
        ack: DeliveryAck,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::WriterClosed(self.topic.clone()));
        }

        let partitions = self.partition_count().await?;
        let partition = {
            let mut partitioners = self.partitioners.lock();
            partitioners
                .entry(partitioning)
                .or_insert_with(|| partitioning.new_partitioner())
                .partition(key, partitions)?
        };
        self.connection
            .enqueue(&self.topic, partition, key, value, ack)
    }

    async fn partition_count(&self) -> Result<i32> {
        if let Some((count, fetched)) = *self.partition_count.lock() {
            if fetched.elapsed() < PARTITION_COUNT_TTL {
                return Ok(count);
            }
        }

        let connection = Arc::clone(&self.connection);
        let topic = self.topic.clone();
        let timeout = self.timeout;
        let count =
            tokio::task::spawn_blocking(move || connection.partition_count(&topic, timeout))
                .await??;
        if count > 0 {
            *self.partition_count.lock() = Some((count, Instant::now()));
        }
        Ok(count)
    }
}

/// Moves connection counters into the writer counters
struct Drain {
    connection: Arc<dyn ProducerConnection>,
    message_count: Arc<AtomicI64>,
    error_count: Arc<AtomicI64>,
    diag: Arc<dyn Diagnostic>,
}

impl Drain {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain(),
                _ = shutdown.changed() => break,
            }
        }
    }

    fn drain(&self) {
        let stats = self.connection.take_stats();
        self.message_count
            .fetch_add(stats.messages, Ordering::Relaxed);
        self.error_count.fetch_add(stats.errors, Ordering::Relaxed);
        if stats.errors > 0 {
            let err = Error::DeliveryError {
                count: stats.errors,
                last_error: stats.last_error.unwrap_or_default(),
            };
            self.diag.error("failed to write messages to kafka", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::MemoryDiagnostic;
    use crate::partitioner::PartitionAlgorithm;

    #[derive(Default)]
    struct FakeConnection {
        partitions: i32,
        sent: Mutex<Vec<(i32, Option<Vec<u8>>, Vec<u8>)>>,
        pending: Mutex<WriterStats>,
        metadata_requests: AtomicI64,
        closed: AtomicBool,
    }

    impl FakeConnection {
        fn with_partitions(partitions: i32) -> Arc<Self> {
            Arc::new(Self {
                partitions,
                ..Default::default()
            })
        }

        fn fail_next(&self, errors: i64, message: &str) {
            let mut pending = self.pending.lock();
            pending.errors += errors;
            pending.last_error = Some(message.to_string());
        }
    }

    impl ProducerConnection for FakeConnection {
        fn enqueue(
            &self,
            _topic: &str,
            partition: i32,
            key: Option<&[u8]>,
            value: &[u8],
            ack: DeliveryAck,
        ) -> Result<()> {
            let mut sent = self.sent.lock();
            sent.push((partition, key.map(|k| k.to_vec()), value.to_vec()));
            self.pending.lock().messages += 1;
            ack.complete(Ok((partition, sent.len() as i64 - 1)));
            Ok(())
        }

        fn partition_count(&self, _topic: &str, _timeout: Duration) -> Result<i32> {
            self.metadata_requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.partitions)
        }

        fn take_stats(&self) -> WriterStats {
            std::mem::take(&mut *self.pending.lock())
        }

        fn close(&self, _timeout: Duration) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn writer(
        connection: Arc<FakeConnection>,
        stats: Arc<StatsRegistry>,
        diag: &MemoryDiagnostic,
    ) -> Writer {
        Writer::new(
            "cluster",
            "alerts",
            connection,
            Duration::from_secs(1),
            Duration::from_millis(10),
            stats,
            Arc::new(diag.clone()),
        )
    }

    #[tokio::test]
    async fn test_open_publishes_and_close_removes_statistic() {
        let stats = Arc::new(StatsRegistry::new());
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(3);
        let writer = writer(connection.clone(), stats.clone(), &diag);

        writer.open();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "kafka");
        assert_eq!(snapshot[0].tags["cluster"], "cluster");
        assert_eq!(snapshot[0].tags["topic"], "alerts");
        assert_eq!(snapshot[0].values[STAT_WRITE_MESSAGES], 0);

        writer.close().await;
        assert!(stats.is_empty());
        assert!(connection.closed.load(Ordering::SeqCst));
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_final_counts_and_reports_errors() {
        let stats = Arc::new(StatsRegistry::new());
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(3);
        let writer = writer(connection.clone(), stats, &diag);
        writer.open();

        writer
            .write_message(Partitioning::RoundRobin, Some(b"k"), b"v")
            .await
            .unwrap();
        connection.fail_next(2, "broker transport failure");
        writer.close().await;

        assert_eq!(writer.message_count(), 1);
        assert_eq!(writer.error_count(), 2);
        assert_eq!(diag.errors(), vec!["failed to write messages to kafka"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poller_accumulates_counts() {
        let stats = Arc::new(StatsRegistry::new());
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(1);
        let writer = writer(connection.clone(), stats.clone(), &diag);
        writer.open();

        for _ in 0..3 {
            writer
                .write_message(Partitioning::RoundRobin, None, b"v")
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(writer.message_count(), 3);
        assert_eq!(stats.snapshot()[0].values[STAT_WRITE_MESSAGES], 3);
        assert!(diag.errors().is_empty());

        writer.close().await;
    }

    #[tokio::test]
    async fn test_sync_write_returns_position() {
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(1000);
        let writer = writer(connection.clone(), Arc::new(StatsRegistry::new()), &diag);
        writer.open();

        let crc32 = Partitioning::ByKey(PartitionAlgorithm::Crc32);
        let (partition, offset) = writer
            .write_message_sync(crc32, Some(b"hello"), b"body")
            .await
            .unwrap();
        assert_eq!(partition, 870);
        assert_eq!(offset, 0);

        let murmur2 = Partitioning::ByKey(PartitionAlgorithm::Murmur2);
        let (partition, _) = writer
            .write_message_sync(murmur2, Some(b"hello"), b"body")
            .await
            .unwrap();
        assert_eq!(partition, 229);

        // Cached partition count
        assert_eq!(connection.metadata_requests.load(Ordering::SeqCst), 1);
        writer.close().await;
    }

    #[tokio::test]
    async fn test_round_robin_spreads_messages() {
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(3);
        let writer = writer(connection.clone(), Arc::new(StatsRegistry::new()), &diag);

        for _ in 0..4 {
            writer
                .write_message(Partitioning::RoundRobin, Some(b"same"), b"v")
                .await
                .unwrap();
        }
        let partitions: Vec<i32> = connection.sent.lock().iter().map(|m| m.0).collect();
        assert_eq!(partitions, vec![0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_zero_partitions_is_an_error() {
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(0);
        let writer = writer(connection.clone(), Arc::new(StatsRegistry::new()), &diag);

        let err = writer
            .write_message(Partitioning::RoundRobin, None, b"v")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionError(_)));
        assert!(connection.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_writes() {
        let diag = MemoryDiagnostic::new();
        let connection = FakeConnection::with_partitions(1);
        let writer = writer(connection, Arc::new(StatsRegistry::new()), &diag);
        writer.open();
        writer.close().await;
        // Second close is a no-op
        writer.close().await;

        let err = writer
            .write_message(Partitioning::RoundRobin, None, b"v")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriterClosed(ref topic) if topic == "alerts"));
    }

    #[test]
    fn test_delivery_counters_reset_on_take() {
        let counters = DeliveryCounters::default();
        counters.messages.fetch_add(5, Ordering::Relaxed);
        counters.errors.fetch_add(1, Ordering::Relaxed);
        *counters.last_error.lock() = Some("timed out".into());

        assert_eq!(
            counters.take(),
            WriterStats {
                messages: 5,
                errors: 1,
                last_error: Some("timed out".into()),
            }
        );
        assert_eq!(counters.take(), WriterStats::default());
    }
}
