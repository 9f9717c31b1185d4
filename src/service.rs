//! Registry of Kafka clusters and the alert handler that writes to them

use crate::alert::{Data, Event, Handler};
use crate::cluster::Cluster;
use crate::config::{self, Config, WriteTarget};
use crate::diagnostic::{Diagnostic, KeyValue};
use crate::error::{Error, Result};
use crate::stats::StatsRegistry;
use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const TEMPLATE_NAME: &str = "kafka alert template";

/// Arguments of [`Service::test`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestOptions {
    pub cluster: String,
    pub topic: String,
    pub key: String,
    pub message: String,
}

/// Per-handler settings of the Kafka alert handler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HandlerConfig {
    pub cluster: String,
    pub topic: String,
    /// Handlebars template for the message body, JSON when empty
    pub template: String,
    pub partition_by_id: bool,
    pub partition_algorithm: String,
}

impl HandlerConfig {
    fn target(&self) -> WriteTarget {
        WriteTarget {
            topic: self.topic.clone(),
            partition_by_id: self.partition_by_id,
            partition_algorithm: self.partition_algorithm.clone(),
        }
    }
}

/// Kafka alert service: every configured cluster, keyed by ID
pub struct Service {
    clusters: Mutex<HashMap<String, Arc<Cluster>>>,
    stats: Arc<StatsRegistry>,
    diag: Arc<dyn Diagnostic>,
}

impl Service {
    /// Build one cluster per config with a fresh statistics registry
    pub fn new(configs: &[Config], diag: Arc<dyn Diagnostic>) -> Self {
        Self::with_stats(configs, diag, Arc::new(StatsRegistry::new()))
    }

    /// Build one cluster per config, publishing writer statistics to `stats`
    pub fn with_stats(
        configs: &[Config],
        diag: Arc<dyn Diagnostic>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let mut clusters = HashMap::with_capacity(configs.len());
        for config in configs {
            if config.insecure_skip_verify {
                diag.insecure_skip_verify();
            }
            clusters.insert(
                config.id.clone(),
                Arc::new(Cluster::new(
                    config.clone(),
                    Arc::clone(&stats),
                    Arc::clone(&diag),
                )),
            );
        }
        Self {
            clusters: Mutex::new(clusters),
            stats,
            diag,
        }
    }

    pub async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Close and remove every cluster
    pub async fn close(&self) -> Result<()> {
        let clusters: Vec<Arc<Cluster>> = self
            .clusters
            .lock()
            .await
            .drain()
            .map(|(_, cluster)| cluster)
            .collect();
        futures::future::join_all(clusters.iter().map(|cluster| cluster.close())).await;
        Ok(())
    }

    /// Statistics published by this service's writers
    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub async fn cluster(&self, id: &str) -> Option<Arc<Cluster>> {
        self.clusters.lock().await.get(id).cloned()
    }

    /// IDs of the known clusters, sorted
    pub async fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clusters.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconcile the clusters with `configs`: create new ones, update existing
    /// ones, and remove those that are disabled or absent. Every config is
    /// validated first, so a rejected update changes nothing.
    pub async fn update(&self, configs: &[Config]) -> Result<()> {
        config::validate_all(configs)?;

        let mut removed = Vec::new();
        {
            let mut clusters = self.clusters.lock().await;
            let mut seen = HashSet::with_capacity(configs.len());

            for config in configs {
                if !config.enabled {
                    if let Some(cluster) = clusters.remove(&config.id) {
                        removed.push(cluster);
                    }
                    continue;
                }

                if config.insecure_skip_verify {
                    self.diag.insecure_skip_verify();
                }
                match clusters.get(&config.id) {
                    Some(cluster) => cluster.update(config.clone()).await?,
                    None => {
                        clusters.insert(
                            config.id.clone(),
                            Arc::new(Cluster::new(
                                config.clone(),
                                Arc::clone(&self.stats),
                                Arc::clone(&self.diag),
                            )),
                        );
                    }
                }
                seen.insert(config.id.as_str());
            }

            clusters.retain(|id, cluster| {
                if seen.contains(id.as_str()) {
                    true
                } else {
                    removed.push(Arc::clone(cluster));
                    false
                }
            });
        }

        for cluster in &removed {
            info!(cluster = %cluster.id(), "Removing Kafka cluster");
            cluster.close().await;
        }
        Ok(())
    }

    /// Example arguments for [`Service::test`]
    pub fn test_options(&self) -> TestOptions {
        TestOptions {
            cluster: "example".to_string(),
            topic: "test".to_string(),
            key: "key".to_string(),
            message: "test kafka message".to_string(),
        }
    }

    /// Write one message synchronously to check connectivity
    pub async fn test(&self, options: &TestOptions) -> Result<()> {
        let cluster = self
            .cluster(&options.cluster)
            .await
            .ok_or_else(|| Error::UnknownCluster(options.cluster.clone()))?;
        cluster
            .write_message_sync(
                &WriteTarget::new(options.topic.clone()),
                options.key.as_bytes(),
                options.message.as_bytes(),
            )
            .await?;
        Ok(())
    }

    /// Build an alert handler writing to the configured cluster and topic
    pub async fn handler(&self, config: HandlerConfig, ctx: &[KeyValue]) -> Result<KafkaHandler> {
        let cluster = self
            .cluster(&config.cluster)
            .await
            .ok_or_else(|| Error::UnknownCluster(config.cluster.clone()))?;
        let target = config.target();
        target.validate()?;

        let template = if config.template.is_empty() {
            None
        } else {
            let mut registry = Handlebars::new();
            registry.register_escape_fn(handlebars::no_escape);
            registry
                .register_template_string(TEMPLATE_NAME, &config.template)
                .map_err(|e| Error::TemplateError(format!("failed to parse template: {}", e)))?;
            Some(registry)
        };

        Ok(KafkaHandler {
            cluster,
            target,
            template,
            diag: self.diag.with_context(ctx),
        })
    }
}

/// Alert handler that writes each event to a Kafka topic, keyed by alert ID
pub struct KafkaHandler {
    cluster: Arc<Cluster>,
    target: WriteTarget,
    template: Option<Handlebars<'static>>,
    diag: Arc<dyn Diagnostic>,
}

impl KafkaHandler {
    fn prepare_body(&self, data: &Data) -> Result<Vec<u8>> {
        match &self.template {
            Some(registry) => registry
                .render(TEMPLATE_NAME, data)
                .map(String::into_bytes)
                .map_err(|e| {
                    Error::TemplateError(format!("failed to execute alert template: {}", e))
                }),
            None => {
                let mut body = serde_json::to_vec(data)?;
                body.push(b'\n');
                Ok(body)
            }
        }
    }
}

#[async_trait]
impl Handler for KafkaHandler {
    async fn handle(&self, event: &Event) {
        // The event still goes out, with an empty body
        let body = self
            .prepare_body(&event.alert_data())
            .unwrap_or_else(|err| {
                self.diag.error("failed to prepare kafka message body", &err);
                Vec::new()
            });
        if let Err(err) = self
            .cluster
            .write_message(&self.target, event.state.id.as_bytes(), &body)
            .await
        {
            self.diag.error("failed to write message to kafka", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{EventState, Level};
    use crate::diagnostic::MemoryDiagnostic;
    use crate::kafkatest::Server;
    use std::time::Duration;

    fn enabled(id: &str) -> Config {
        Config {
            enabled: true,
            id: id.into(),
            brokers: vec!["127.0.0.1:1".into()],
            timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn service(configs: &[Config]) -> (Service, MemoryDiagnostic) {
        let diag = MemoryDiagnostic::new();
        (Service::new(configs, Arc::new(diag.clone())), diag)
    }

    #[tokio::test]
    async fn test_new_warns_once_per_insecure_cluster() {
        let insecure = Config {
            insecure_skip_verify: true,
            ..enabled("b")
        };
        let (service, diag) = service(&[enabled("a"), insecure]);
        assert_eq!(diag.insecure_warnings(), 1);
        assert_eq!(service.cluster_ids().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_update_removes_omitted_clusters() {
        let (service, _) = service(&[enabled("a"), enabled("b")]);
        let b = service.cluster("b").await.unwrap();

        service.update(&[enabled("a")]).await.unwrap();
        assert_eq!(service.cluster_ids().await, vec!["a"]);
        assert!(b.is_closed());

        let options = TestOptions {
            cluster: "b".into(),
            ..service.test_options()
        };
        let err = service.test(&options).await.unwrap_err();
        assert!(matches!(err, Error::UnknownCluster(ref id) if id == "b"));

        let handler_config = HandlerConfig {
            cluster: "b".into(),
            topic: "alerts".into(),
            ..Default::default()
        };
        assert!(matches!(
            service.handler(handler_config, &[]).await,
            Err(Error::UnknownCluster(_))
        ));
    }

    #[tokio::test]
    async fn test_update_creates_updates_and_disables() {
        let (service, diag) = service(&[enabled("a")]);
        let a = service.cluster("a").await.unwrap();

        let mut a2 = enabled("a");
        a2.batch_size = 7;
        let insecure = Config {
            insecure_skip_verify: true,
            ..enabled("c")
        };
        service.update(&[a2, insecure]).await.unwrap();
        assert_eq!(service.cluster_ids().await, vec!["a", "c"]);
        // Updated in place
        let same = service.cluster("a").await.unwrap();
        assert!(Arc::ptr_eq(&a, &same));
        assert_eq!(same.config().batch_size, 7);
        assert_eq!(diag.insecure_warnings(), 1);

        let disabled = Config {
            enabled: false,
            ..enabled("c")
        };
        service.update(&[enabled("a"), disabled]).await.unwrap();
        assert_eq!(service.cluster_ids().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_rejected_update_changes_nothing() {
        let (service, _) = service(&[enabled("a")]);

        let mut broken = enabled("b");
        broken.brokers.clear();
        assert!(service.update(&[enabled("c"), broken]).await.is_err());
        assert!(service
            .update(&[enabled("c"), enabled("c")])
            .await
            .unwrap_err()
            .to_string()
            .contains("duplicate"));
        assert_eq!(service.cluster_ids().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_handler_rejects_bad_template() {
        let (service, _) = service(&[enabled("a")]);
        let config = HandlerConfig {
            cluster: "a".into(),
            topic: "alerts".into(),
            template: "{{#if}}".into(),
            ..Default::default()
        };
        let err = service.handler(config, &[]).await.err().unwrap();
        assert!(matches!(err, Error::TemplateError(_)));
    }

    #[tokio::test]
    async fn test_handler_rejects_bad_partition_algorithm() {
        let (service, _) = service(&[enabled("a")]);
        let config = HandlerConfig {
            cluster: "a".into(),
            topic: "alerts".into(),
            partition_by_id: true,
            partition_algorithm: "md5".into(),
            ..Default::default()
        };
        let err = service.handler(config, &[]).await.err().unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_body_rendering() {
        let (service, _) = service(&[enabled("a")]);
        let event = Event {
            state: EventState {
                id: "cpu:host=a".into(),
                message: "cpu is high".into(),
                level: Level::Critical,
                ..Default::default()
            },
            ..Default::default()
        };

        let templated = service
            .handler(
                HandlerConfig {
                    cluster: "a".into(),
                    topic: "alerts".into(),
                    template: "{{id}} is {{level}}: <{{message}}>".into(),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();
        let body = templated.prepare_body(&event.alert_data()).unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), "cpu:host=a is CRITICAL: <cpu is high>");

        let json = service
            .handler(
                HandlerConfig {
                    cluster: "a".into(),
                    topic: "alerts".into(),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();
        let body = json.prepare_body(&event.alert_data()).unwrap();
        assert_eq!(body.last(), Some(&b'\n'));
        let decoded: Data = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, event.alert_data());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_render_failure_still_writes() {
        let server = Server::start().await.unwrap();
        let config = Config {
            brokers: vec![server.addr().to_string()],
            ..enabled("a")
        };
        let (service, diag) = service(&[config]);
        let handler = service
            .handler(
                HandlerConfig {
                    cluster: "a".into(),
                    topic: "alerts".into(),
                    template: "{{nohelper id}}".into(),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();

        let event = Event {
            state: EventState {
                id: "cpu:host=a".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        handler.handle(&event).await;
        service.close().await.unwrap();

        assert_eq!(diag.errors(), vec!["failed to prepare kafka message body"]);
        let messages = server.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some(&b"cpu:host=a"[..]));
        assert!(messages[0].value.as_deref().unwrap_or_default().is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_removes_all_clusters() {
        let (service, _) = service(&[enabled("a"), enabled("b")]);
        service.open().await.unwrap();
        let a = service.cluster("a").await.unwrap();
        service.close().await.unwrap();
        assert!(service.cluster_ids().await.is_empty());
        assert!(a.is_closed());
    }
}
