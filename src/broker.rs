//! Broker: owns the store, the consumer registry, and shutdown.
//!
//! One broker is constructed at process start and passed by handle to
//! whatever needs to publish or query; there is no global instance. The
//! store connection is opened once here and closed exactly once by
//! [`Broker::shutdown`].

use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    consumer::{self, ConsumerHandle, Handler},
    error::{Error, Result},
    message::{MessageFilter, QueueStatus},
    store::Store,
};

/// Default cap on how many failed messages one `retry_failed` call resets.
pub const DEFAULT_RETRY_LIMIT: u64 = 100;

pub struct Broker {
    store: Store,
    config: Config,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    stop: CancellationToken,
}

impl Broker {
    pub async fn connect() -> Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self> {
        let store = Store::connect_with(&config).await?;

        Ok(Self {
            store,
            config,
            consumers: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Appends a message to `queue` and returns its store-assigned id.
    ///
    /// Store failures surface immediately as [`Error::StoreUnavailable`];
    /// publish is caller-driven and never retried internally.
    pub async fn publish(
        &self,
        queue: impl AsRef<str>,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let queue = valid_queue_name(queue.as_ref())?;

        let id = self.store.insert(queue, &payload).await?;

        tracing::debug!(queue, id, "Message published");

        Ok(id)
    }

    /// Starts a consumer loop for `queue` bound to `handler`.
    ///
    /// At most one loop per queue name: a second registration is rejected
    /// with [`Error::DuplicateQueue`] rather than racing two loops on the
    /// same queue.
    pub async fn register_consumer<F, Fut>(
        &self,
        queue: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let queue = queue.into();
        valid_queue_name(&queue)?;

        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));

        let mut consumers = self.consumers.lock().await;

        if consumers.contains_key(&queue) {
            return Err(Error::DuplicateQueue { queue });
        }

        let handle = consumer::spawn(
            self.store.clone(),
            queue.clone(),
            handler,
            self.config.idle_interval(),
            self.stop.child_token(),
        );

        consumers.insert(queue, handle);

        Ok(())
    }

    /// Aggregate counts for one queue. Read-only.
    pub async fn queue_status(&self, queue: impl AsRef<str>) -> Result<QueueStatus> {
        let queue = valid_queue_name(queue.as_ref())?;

        let pending = self.store.count(queue, MessageFilter::Pending).await?;
        let processing = self.store.count(queue, MessageFilter::Processing).await?;
        let processed = self.store.count(queue, MessageFilter::Processed).await?;
        let failed = self.store.count(queue, MessageFilter::Failed).await?;

        Ok(QueueStatus {
            queue: queue.to_owned(),
            pending,
            processing,
            processed,
            failed,
            total: pending + processing + processed,
        })
    }

    /// Returns up to `limit` (default 100) failed messages in `queue` to
    /// pending, clearing their errors. Returns how many were reset.
    pub async fn retry_failed(
        &self,
        queue: impl AsRef<str>,
        limit: Option<u64>,
    ) -> Result<u64> {
        let queue = valid_queue_name(queue.as_ref())?;

        let retried = self
            .store
            .clear_errors(queue, limit.unwrap_or(DEFAULT_RETRY_LIMIT))
            .await?;

        if retried > 0 {
            tracing::info!(queue, retried, "Failed messages returned to pending");
        }

        Ok(retried)
    }

    /// Signals every consumer loop to stop, waits (bounded per loop) for
    /// them to finish, then closes the store. Idempotent: a second call
    /// finds the registry empty and the token already cancelled.
    pub async fn shutdown(&self) {
        self.stop.cancel();

        let drained: Vec<ConsumerHandle> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().map(|(_, handle)| handle).collect()
        };

        for handle in drained {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(queue = handle.queue, "Consumer task panicked: {e}");
                }
                Err(_) => {
                    // Still inside a handler call; cancellation is
                    // cooperative, so leave it to finish detached.
                    tracing::warn!(
                        queue = handle.queue,
                        "Consumer did not stop within the shutdown timeout"
                    );
                }
            }
        }

        self.store.close().await;

        tracing::info!("Broker shut down");
    }
}

fn valid_queue_name(queue: &str) -> Result<&str> {
    if queue.is_empty() {
        return Err(Error::invalid_parameter("queue name must not be empty"));
    }

    Ok(queue)
}
