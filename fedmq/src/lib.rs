#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use std::sync::Arc;
//!
//! use fedmq::gateway::Gateway;
//! use fedmq::settings::GatewayConfig;
//! use fedmq::transport::MqttConnector;
//!
//! #[tokio::main]
//! async fn main() -> fedmq::Result<()> {
//!     let connector = Arc::new(MqttConnector::new(Default::default())?);
//!     let mut gateway = Gateway::connect(GatewayConfig::default(), connector, 1000).await?;
//!     gateway.run(async { tokio::signal::ctrl_c().await.unwrap_or_default() }).await
//! }
//! ```

/// Routing Core
pub mod routing; // Topic-partition routing table
pub mod subscription; // Reference-counted subscription tracker
pub mod topic; // Topic grammar and helpers

/// Backend Brokers
pub mod broker; // One pooled backend connection
pub mod pool; // Backend connection pool
pub mod transport; // Broker client abstraction

/// Processes
pub mod dmb; // Distributed broker registrar
pub mod gateway; // Gateway event loop
pub mod manager; // Broker table coordinator

/// Support
pub mod error; // Error types
pub mod logger; // log facade backed by slog
pub mod stats; // Request counters
pub mod types; // Wire types and control topics

pub use error::FedError;

pub type Result<T, E = FedError> = std::result::Result<T, E>;

/// External Crate Re-exports
pub use anyhow;
pub use fedmq_conf as settings;
pub use fedmq_utils as utils;
pub use log;
pub use serde_json;
pub use structopt;
pub use tokio;
