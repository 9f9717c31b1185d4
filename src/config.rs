//! Cluster configuration

use crate::error::{Error, Result};
use crate::oauth::TokenProvider;
use crate::partitioner::{PartitionAlgorithm, Partitioning};
use crate::sasl::{KafkaVersion, SaslAuth, SaslMechanism};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Cluster ID used when none is configured
pub const DEFAULT_ID: &str = "default";
/// Network timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Messages per produce batch
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Longest a message waits for its batch to fill
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection settings of one Kafka cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Whether alerts may be sent to this cluster
    pub enabled: bool,

    /// Unique cluster ID
    pub id: String,

    /// Broker addresses, `host:port`
    pub brokers: Vec<String>,

    /// Dial, read and write timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Messages per produce batch
    pub batch_size: usize,

    /// Longest a message waits for its batch to fill
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// TLS settings
    pub use_ssl: bool,
    pub ssl_ca: String,
    pub ssl_cert: String,
    pub ssl_key: String,
    pub insecure_skip_verify: bool,

    /// SASL settings
    #[serde(flatten)]
    pub sasl: SaslAuth,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            id: DEFAULT_ID.to_string(),
            brokers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            use_ssl: false,
            ssl_ca: String::new(),
            ssl_cert: String::new(),
            ssl_key: String::new(),
            insecure_skip_verify: false,
            sasl: SaslAuth::default(),
        }
    }
}

/// Settings needed to build a producer for one topic
pub struct ProducerSettings {
    /// librdkafka properties
    pub client_config: ClientConfig,
    /// Installed on the producer context for OAUTHBEARER
    pub token_provider: Option<Arc<dyn TokenProvider>>,
}

impl fmt::Debug for ProducerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSettings")
            .field("client_config", &self.client_config)
            .field("token_provider", &self.token_provider.is_some())
            .finish()
    }
}

fn millis(duration: Duration) -> u128 {
    duration.as_millis()
}

fn check_file(setting: &str, path: &str) -> Result<()> {
    if !Path::new(path).is_file() {
        return Err(Error::config(format!(
            "{} {:?} does not exist or is not a file",
            setting, path
        )));
    }
    Ok(())
}

impl Config {
    /// Check the settings without touching the network
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("id must not be empty"));
        }
        if self.enabled && self.brokers.is_empty() {
            return Err(Error::config(
                "no brokers specified, must provide at least one broker URL",
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch-size must be greater than 0"));
        }
        if self.ssl_cert.is_empty() != self.ssl_key.is_empty() {
            return Err(Error::config("ssl-cert and ssl-key must be set together"));
        }
        self.sasl.validate()
    }

    /// Sorted broker list, for order-insensitive comparison
    pub fn sorted_brokers(&self) -> Vec<String> {
        let mut brokers = self.brokers.clone();
        brokers.sort();
        brokers
    }

    /// Whether moving from `self` to `other` requires new connections
    pub fn connection_changed(&self, other: &Config) -> bool {
        self.sorted_brokers() != other.sorted_brokers()
            || self.use_ssl != other.use_ssl
            || self.ssl_ca != other.ssl_ca
            || self.ssl_cert != other.ssl_cert
            || self.ssl_key != other.ssl_key
            || self.insecure_skip_verify != other.insecure_skip_verify
            || self.sasl != other.sasl
    }

    fn security_protocol(&self) -> &'static str {
        match (self.use_ssl, self.sasl.enabled()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        }
    }

    /// OAUTHBEARER token provider to share between the cluster's writers
    pub fn token_provider(&self) -> Result<Option<Arc<dyn TokenProvider>>> {
        self.sasl.token_provider(self.timeout)
    }

    /// Build the producer settings for a writer of `target`. `token_provider`
    /// comes from [`Config::token_provider`] and is required for OAUTHBEARER.
    pub fn writer_config(
        &self,
        target: &WriteTarget,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<ProducerSettings> {
        target.validate()?;
        if token_provider.is_none() && self.sasl.mechanism()? == Some(SaslMechanism::OAuthBearer) {
            return Err(Error::config("OAUTHBEARER requires a token provider"));
        }

        // librdkafka rejects connection setup timeouts under one second
        let timeout_ms = millis(self.timeout).max(1000);
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("client.id", format!("kafka-alerts-{}", self.id))
            .set("socket.timeout.ms", timeout_ms.to_string())
            .set("request.timeout.ms", timeout_ms.to_string())
            .set("socket.connection.setup.timeout.ms", timeout_ms.to_string())
            .set(
                "message.timeout.ms",
                (timeout_ms + millis(self.batch_timeout)).to_string(),
            )
            .set("linger.ms", millis(self.batch_timeout).to_string())
            .set("batch.num.messages", self.batch_size.to_string())
            .set("security.protocol", self.security_protocol());

        if self.use_ssl {
            if !self.ssl_ca.is_empty() {
                check_file("ssl-ca", &self.ssl_ca)?;
                client_config.set("ssl.ca.location", &self.ssl_ca);
            }
            if !self.ssl_cert.is_empty() {
                check_file("ssl-cert", &self.ssl_cert)?;
                check_file("ssl-key", &self.ssl_key)?;
                client_config
                    .set("ssl.certificate.location", &self.ssl_cert)
                    .set("ssl.key.location", &self.ssl_key);
            }
            if self.insecure_skip_verify {
                client_config
                    .set("enable.ssl.certificate.verification", "false")
                    .set("ssl.endpoint.identification.algorithm", "none");
            }
        }

        self.sasl
            .set_sasl_config(&mut client_config, KafkaVersion::DEFAULT)?;

        Ok(ProducerSettings {
            client_config,
            token_provider,
        })
    }
}

/// Where and how a message is written
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WriteTarget {
    pub topic: String,
    /// Place messages by hashing their key instead of round-robin
    pub partition_by_id: bool,
    /// `""`, `crc32`, `murmur2`, `murmur3` or `fnv-1a`
    pub partition_algorithm: String,
}

impl WriteTarget {
    /// Round-robin target for `topic`
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Partition by key with `algorithm`
    pub fn partitioned_by_id(mut self, algorithm: impl Into<String>) -> Self {
        self.partition_by_id = true;
        self.partition_algorithm = algorithm.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::config("topic must not be empty"));
        }
        self.partitioning().map(|_| ())
    }

    /// Partitioning strategy selected by this target
    pub fn partitioning(&self) -> Result<Partitioning> {
        if !self.partition_by_id {
            return Ok(Partitioning::RoundRobin);
        }
        let algorithm: PartitionAlgorithm = self.partition_algorithm.parse()?;
        Ok(Partitioning::ByKey(algorithm))
    }
}

/// Validate every config and check that cluster IDs are unique
pub fn validate_all(configs: &[Config]) -> Result<()> {
    let mut seen = HashSet::new();
    for config in configs {
        config.validate()?;
        if !seen.insert(config.id.as_str()) {
            return Err(Error::config(format!(
                "duplicate cluster id {:?}",
                config.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    kafka: Vec<Config>,
}

/// All configured clusters, as loaded from a `[[kafka]]` TOML document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configs(pub Vec<Config>);

impl Configs {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(s)
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))?;
        Ok(Configs(file.kafka))
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Validate each cluster and check that IDs are unique
    pub fn validate(&self) -> Result<()> {
        validate_all(&self.0)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Config> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Config] {
        &self.0
    }
}
