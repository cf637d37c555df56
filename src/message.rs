//! Message types and status accounting for the broker.
//!
//! A message is the unit of work: an opaque JSON payload tagged with a
//! queue name, plus the lifecycle bookkeeping the consumer loops maintain.
//!
//! # Message lifecycle
//!
//! 1. Messages are created pending (`processed = false`, `processing = false`)
//! 2. A consumer loop claims one (`processing = true`) and runs the handler
//! 3. On success they move to processed (`processed = true`, terminal)
//! 4. On handler failure they move to failed (`error` set) and stay parked
//!    until an operator retries them, which returns them to pending
//!
//! Messages are never deleted; processed and failed rows remain as an
//! audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// A persisted message.
///
/// `payload` is opaque structured data passed unmodified to the handler;
/// its schema is the producer's and handler's concern. `created_at` defines
/// claim ordering within a queue (FIFO by insertion) and is never reset,
/// so retried messages keep their original age.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Store-assigned identifier, immutable once created.
    pub id: i64,
    /// Name of the logical queue this message belongs to.
    pub queue: String,
    /// The message content, delivered as-is to the handler.
    #[sqlx(json)]
    pub payload: serde_json::Value,
    /// Publish timestamp; claim order within the queue.
    pub created_at: DateTime<Utc>,

    /// True only after a handler completed without error.
    pub processed: bool,
    /// True while a consumer loop holds an active claim.
    pub processing: bool,
    /// Set when the current claim was taken. Advisory.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Set on successful completion.
    pub processed_at: Option<DateTime<Utc>>,

    /// Description of the most recent failed attempt, if any.
    pub error: Option<String>,
    /// When that attempt failed.
    pub error_at: Option<DateTime<Utc>>,
}

/// The count predicates `queue_status` reports on.
///
/// `Pending` excludes failed messages: a message with an `error` is parked
/// until retried and is not eligible for claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFilter {
    /// Awaiting a claim: not processed, not processing, no error.
    Pending,
    /// Currently claimed by a consumer loop.
    Processing,
    /// Successfully handled.
    Processed,
    /// Last attempt failed; waiting for an explicit retry.
    Failed,
}

/// Aggregate counts for one queue.
///
/// `total` is `pending + processing + processed`; failed messages are a
/// separate bucket and rejoin `pending` once retried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue: String,
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
}
