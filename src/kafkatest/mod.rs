//! A single-broker Kafka stand-in for integration tests.
//!
//! The server understands just enough of the wire protocol for a producer:
//! ApiVersions, Metadata and Produce with uncompressed v2 record batches.
//! Produced messages are kept in memory for assertions.
//!
//! ```no_run
//! # async fn example() -> std::io::Result<()> {
//! let server = kafka_alerts::kafkatest::Server::start().await?;
//! let brokers = vec![server.addr().to_string()];
//! // ... write to `brokers` ...
//! server.close().await;
//! let messages = server.messages().expect("no protocol errors");
//! # Ok(())
//! # }
//! ```

pub mod protocol;
mod server;

pub use server::{Message, RecordedErrors, Server};
