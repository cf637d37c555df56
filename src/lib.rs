//! Durable, polling-based message broker backed by SQLite.
//!
//! Producers append JSON messages tagged with a queue name; one consumer
//! loop per queue claims the oldest unprocessed message, runs the
//! registered handler, and records the outcome. Delivery is at-least-once,
//! FIFO within a queue; failed messages are parked until an operator
//! retries them. Nothing is deleted: processed and failed messages remain
//! in the store as an audit trail.
//!
//! ```no_run
//! use relayq::{broker::Broker, config::Config};
//!
//! # async fn demo() -> Result<(), relayq::error::Error> {
//! let broker = Broker::connect_with(Config::default()).await?;
//!
//! broker
//!     .register_consumer("orders", |payload| async move {
//!         tracing::info!("processing order: {payload}");
//!         Ok(())
//!     })
//!     .await?;
//!
//! broker
//!     .publish("orders", serde_json::json!({"order_id": 123}))
//!     .await?;
//!
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod message;
pub mod store;

pub use broker::Broker;
pub use config::Config;
pub use error::Error;
pub use message::{Message, QueueStatus};
