//! Error types for the Kafka alert subsystem

use crate::partitioner::PartitionError;
use std::io;
use thiserror::Error;

/// Result type for Kafka alert operations
pub type Result<T> = std::result::Result<T, Error>;

/// Kafka alert error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kafka client errors
    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A cluster ID that is not configured
    #[error("unknown cluster {0:?}")]
    UnknownCluster(String),

    /// Partition selection errors
    #[error("Partition error: {0}")]
    PartitionError(#[from] PartitionError),

    /// Topic metadata could not be resolved
    #[error("Metadata error: {0}")]
    MetadataError(String),

    /// SASL/OAuth token errors
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Alert template errors
    #[error("Template error: {0}")]
    TemplateError(String),

    /// JSON encoding errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Asynchronous deliveries failed since the last poll
    #[error("{count} message(s) failed delivery, last error: {last_error}")]
    DeliveryError {
        /// Failed deliveries in the poll interval
        count: i64,
        /// Most recent failure reported by the producer
        last_error: String,
    },

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The cluster was closed or removed from configuration
    #[error("cluster {0:?} is closed")]
    ClusterClosed(String),

    /// The writer was closed by a config update or shutdown
    #[error("writer for topic {0:?} is closed")]
    WriterClosed(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Channel errors
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl Error {
    /// Whether the error was caused by invalid configuration rather than the
    /// network or the broker.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_) | Error::TemplateError(_) | Error::UnknownCluster(_)
        )
    }

    /// Shorthand for building a configuration error.
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::ConfigError(msg.into())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelError(format!("delivery report dropped: {}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::ChannelError(format!("background task failed: {}", err))
    }
}
