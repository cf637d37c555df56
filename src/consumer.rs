//! Per-queue consumer loop.
//!
//! Each registered queue gets one background task that repeatedly claims
//! the oldest pending message and runs the queue's handler on its payload.
//! Handler failures are recorded on the message and never stop the loop;
//! store failures are logged and retried after the idle interval so an
//! unavailable store does not turn into a tight error loop.
//!
//! Cancellation is cooperative: the token is observed at the top of every
//! iteration and during the idle sleep, so a loop exits within one idle
//! interval of shutdown (plus whatever handler call is already in flight,
//! which is allowed to finish normally).

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{message::Message, store::Store};

/// Caller-supplied processing logic for one queue.
///
/// Invoked with each claimed message's payload; the returned result decides
/// the message's terminal state. An `Err` is rendered into the message's
/// `error` field and goes no further.
pub type Handler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Handle to a running consumer loop, held by the broker's registry.
pub(crate) struct ConsumerHandle {
    pub(crate) queue: String,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) fn spawn(
    store: Store,
    queue: String,
    handler: Handler,
    idle_interval: Duration,
    stop: CancellationToken,
) -> ConsumerHandle {
    let task = tokio::spawn(run(store, queue.clone(), handler, idle_interval, stop));

    ConsumerHandle { queue, task }
}

async fn run(
    store: Store,
    queue: String,
    handler: Handler,
    idle_interval: Duration,
    stop: CancellationToken,
) {
    tracing::info!(queue, "Consumer loop started");

    loop {
        if stop.is_cancelled() {
            break;
        }

        match store.claim_next(&queue).await {
            Ok(Some(message)) => {
                if process(&store, &queue, &handler, message).await.is_ok() {
                    continue;
                }
                // Store write failed; pause before hammering it again.
                if idle(&stop, idle_interval).await {
                    break;
                }
            }
            Ok(None) => {
                // Queue empty; idle until the next poll or shutdown.
                if idle(&stop, idle_interval).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(queue, "Claim failed: {e}");
                if idle(&stop, idle_interval).await {
                    break;
                }
            }
        }
    }

    tracing::info!(queue, "Consumer loop stopped");
}

/// Runs the handler on one claimed message and records the outcome.
///
/// Handler failures are absorbed here: they land on the message's `error`
/// field and nothing else. A panicking handler is caught and treated the
/// same as a returned error, so the loop survives it and the claim is
/// released into the failed state. The returned error covers only the
/// store writes that record the outcome.
async fn process(
    store: &Store,
    queue: &str,
    handler: &Handler,
    message: Message,
) -> crate::error::Result<()> {
    let id = message.id;

    let outcome = AssertUnwindSafe((handler)(message.payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(eyre::eyre!("handler panicked: {}", panic_description(panic.as_ref())))
        });

    match outcome {
        Ok(()) => {
            if let Err(e) = store.mark_processed(id).await {
                tracing::error!(queue, id, "Failed to record completion: {e}");
                return Err(e);
            }
            tracing::debug!(queue, id, "Message processed");
        }
        Err(report) => {
            tracing::error!(queue, id, "Handler failed: {report:#}");
            if let Err(e) = store.mark_failed(id, format!("{report:#}")).await {
                tracing::error!(queue, id, "Failed to record failure: {e}");
                return Err(e);
            }
        }
    }

    Ok(())
}

fn panic_description(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Sleeps for the idle interval unless cancelled first. Returns true when
/// the loop should exit.
async fn idle(stop: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}
