//! One configured Kafka cluster and its per-topic writers

use crate::config::{Config, WriteTarget};
use crate::diagnostic::{Diagnostic, KeyValue};
use crate::error::{Error, Result};
use crate::oauth::TokenProvider;
use crate::stats::StatsRegistry;
use crate::writer::{self, Writer};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A Kafka cluster. Writers are created lazily, one per topic, on the first
/// write to that topic.
pub struct Cluster {
    config: ArcSwap<Config>,
    writers: RwLock<HashMap<String, Arc<Writer>>>,
    stats: Arc<StatsRegistry>,
    diag: Arc<dyn Diagnostic>,
    token_provider: Mutex<Option<Arc<dyn TokenProvider>>>,
    closed: AtomicBool,
}

impl Cluster {
    pub fn new(config: Config, stats: Arc<StatsRegistry>, diag: Arc<dyn Diagnostic>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            writers: RwLock::new(HashMap::new()),
            stats,
            diag,
            token_provider: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Cluster ID
    pub fn id(&self) -> String {
        self.config.load().id.clone()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Number of open writers
    pub fn writer_count(&self) -> usize {
        self.writers.read().len()
    }

    /// Queue a message for `target`. Delivery failures are reported through
    /// the writer's error counter, not returned.
    pub async fn write_message(&self, target: &WriteTarget, key: &[u8], message: &[u8]) -> Result<()> {
        let partitioning = target.partitioning()?;
        self.with_writer(target, |writer| async move {
            writer.write_message(partitioning, Some(key), message).await
        })
        .await
    }

    /// Write a message and wait for its delivery report.
    /// Returns `(partition, offset)`.
    pub async fn write_message_sync(
        &self,
        target: &WriteTarget,
        key: &[u8],
        message: &[u8],
    ) -> Result<(i32, i64)> {
        let partitioning = target.partitioning()?;
        self.with_writer(target, |writer| async move {
            writer.write_message_sync(partitioning, Some(key), message).await
        })
        .await
    }

    /// Run `write` against the writer of `target`, once more on a fresh
    /// writer if the first one was closed underneath it.
    async fn with_writer<T, F, Fut>(&self, target: &WriteTarget, write: F) -> Result<T>
    where
        F: Fn(Arc<Writer>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let writer = self.writer(target)?;
        match write(Arc::clone(&writer)).await {
            Err(Error::WriterClosed(_)) if !self.is_closed() => {
                self.evict(&target.topic, &writer);
                write(self.writer(target)?).await
            }
            result => result,
        }
    }

    /// Drop `writer` from the cache unless it was already replaced
    fn evict(&self, topic: &str, writer: &Arc<Writer>) {
        let mut writers = self.writers.write();
        if writers.get(topic).is_some_and(|cached| Arc::ptr_eq(cached, writer)) {
            writers.remove(topic);
            debug!(cluster = %self.id(), topic, "Evicted closed Kafka writer");
        }
    }

    pub(crate) fn writer(&self, target: &WriteTarget) -> Result<Arc<Writer>> {
        if self.is_closed() {
            return Err(Error::ClusterClosed(self.id()));
        }
        if let Some(writer) = self.writers.read().get(&target.topic) {
            return Ok(Arc::clone(writer));
        }

        let mut writers = self.writers.write();
        // close() may have drained the map while we waited for the lock
        if self.is_closed() {
            return Err(Error::ClusterClosed(self.id()));
        }
        // Another caller may have created it while we waited for the lock
        if let Some(writer) = writers.get(&target.topic) {
            return Ok(Arc::clone(writer));
        }

        let config = self.config.load();
        let token_provider = self.shared_token_provider(&config)?;
        let connection = writer::connect(config.writer_config(target, token_provider)?)?;
        let diag = self.diag.with_context(&[
            KeyValue::new("cluster", config.id.clone()),
            KeyValue::new("topic", target.topic.clone()),
        ]);
        let writer = Arc::new(Writer::new(
            config.id.clone(),
            target.topic.clone(),
            connection,
            config.timeout,
            config.batch_timeout,
            Arc::clone(&self.stats),
            diag,
        ));
        writer.open();
        writers.insert(target.topic.clone(), Arc::clone(&writer));
        debug!(cluster = %config.id, topic = %target.topic, "Created Kafka writer");
        Ok(writer)
    }

    /// The OAUTHBEARER provider shared by every writer, built on first use.
    /// Callers hold the writers lock.
    fn shared_token_provider(&self, config: &Config) -> Result<Option<Arc<dyn TokenProvider>>> {
        let mut provider = self.token_provider.lock();
        if provider.is_none() {
            *provider = config.token_provider()?;
        }
        Ok(provider.clone())
    }

    #[cfg(test)]
    pub(crate) fn current_token_provider(&self) -> Option<Arc<dyn TokenProvider>> {
        self.token_provider.lock().clone()
    }

    /// Swap in a new configuration. Writers are closed and rebuilt on next use
    /// only when connection settings changed.
    pub async fn update(&self, config: Config) -> Result<()> {
        config.validate()?;

        let (evicted, provider): (Vec<Arc<Writer>>, _) = {
            let mut writers = self.writers.write();
            let changed = self.config.load().connection_changed(&config);
            self.config.store(Arc::new(config));
            if changed {
                (
                    writers.drain().map(|(_, writer)| writer).collect(),
                    self.token_provider.lock().take(),
                )
            } else {
                (Vec::new(), None)
            }
        };

        if !evicted.is_empty() {
            info!(
                cluster = %self.id(),
                writers = evicted.len(),
                "Connection settings changed, closing writers"
            );
        }
        futures::future::join_all(evicted.iter().map(|writer| writer.close())).await;
        if let Some(provider) = provider {
            provider.close();
        }
        Ok(())
    }

    /// Close every writer. Later writes fail with [`Error::ClusterClosed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let (writers, provider): (Vec<Arc<Writer>>, _) = {
            let mut writers = self.writers.write();
            (
                writers.drain().map(|(_, writer)| writer).collect(),
                self.token_provider.lock().take(),
            )
        };
        futures::future::join_all(writers.iter().map(|writer| writer.close())).await;
        if let Some(provider) = provider {
            provider.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
