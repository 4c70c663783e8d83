//! NATS JetStream management client
//!
//! A small client for the JetStream JSON API (`$JS.API.*`) used by the
//! JetStream controller to manage accounts, streams, consumers and stream
//! templates. Requests are plain NATS request/reply on top of an
//! `async_nats::Client`, so authentication, TLS and reconnection are handled
//! by the NATS connection itself.
//!
//! # Example
//!
//! ```no_run
//! use jetstream_client::{ConnectionConfig, JetStreamClient, JetStreamClientTrait, StreamConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new(vec!["nats://localhost:4222".to_string()]);
//! let client = JetStreamClient::connect(&config).await?;
//!
//! let stream = StreamConfig {
//!     name: "ORDERS".to_string(),
//!     subjects: vec!["orders.>".to_string()],
//!     ..StreamConfig::default()
//! };
//! if client.get_stream("ORDERS").await?.is_none() {
//!     client.create_stream(&stream).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod jetstream_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::JetStreamClient;
pub use config::ConnectionConfig;
pub use error::JetStreamError;
pub use jetstream_trait::JetStreamClientTrait;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{MockFailure, MockJetStreamClient, MockOp};
