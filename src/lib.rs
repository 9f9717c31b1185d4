//! Kafka alert delivery
//!
//! This library manages the Kafka clusters that alert handlers write to: one
//! [`Cluster`] per configured ID, one [`writer::Writer`] per topic created on
//! first use, partitioners compatible with the Sarama and Java clients, and
//! SASL/OAuth authentication for the underlying librdkafka producers.
//!
//! # Example
//!
//! ```no_run
//! use kafka_alerts::{Configs, HandlerConfig, Service, TracingDiagnostic};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let configs = Configs::load("kafka.toml")?;
//! configs.validate()?;
//!
//! let service = Service::new(configs.as_slice(), Arc::new(TracingDiagnostic::new()));
//! service.open().await?;
//!
//! let handler = service
//!     .handler(
//!         HandlerConfig {
//!             cluster: "default".to_string(),
//!             topic: "alerts".to_string(),
//!             ..Default::default()
//!         },
//!         &[],
//!     )
//!     .await?;
//! # let _ = handler;
//!
//! service.close().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub use alert::{Data, Event, EventData, EventState, Handler, Level};
pub use cluster::Cluster;
pub use config::{Config, Configs, WriteTarget};
pub use diagnostic::{Diagnostic, KeyValue, TracingDiagnostic};
pub use error::{Error, Result};
pub use partitioner::{PartitionAlgorithm, Partitioner, Partitioning};
pub use service::{HandlerConfig, KafkaHandler, Service, TestOptions};
pub use stats::StatsRegistry;

/// Alert events and the handler interface
pub mod alert;

/// Cluster lifecycle and writer cache
pub mod cluster;

/// Cluster configuration and producer settings
pub mod config;

/// Reporting sinks for errors and insecure settings
pub mod diagnostic;

/// Error types
pub mod error;

/// Wire-protocol test broker
pub mod kafkatest;

/// OAuth bearer tokens
pub mod oauth;

/// Partition selection
pub mod partitioner;

/// SASL settings
pub mod sasl;

/// Service layer: cluster registry and alert handler
pub mod service;

/// Writer statistics
pub mod stats;

/// Per-topic producers
pub mod writer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
