use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use relayq::{broker::Broker, config::Config, error::Error, message::QueueStatus};
use serde_json::json;
use tempfile::TempDir;

struct TmpBroker {
    broker: Broker,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpBroker {
    type Target = Broker;

    fn deref(&self) -> &Self::Target {
        &self.broker
    }
}

async fn setup() -> TmpBroker {
    relayq::logging::init();

    let tmpdir = tempfile::tempdir().unwrap();

    let config = Config {
        db_path: Some(
            tmpdir
                .path()
                .join("relayq.db")
                .to_string_lossy()
                .to_string(),
        ),
        idle_interval_ms: 20,
        shutdown_timeout_ms: 2000,
    };

    TmpBroker {
        broker: Broker::connect_with(config).await.unwrap(),
        tmpdir,
    }
}

async fn wait_for_status(
    broker: &Broker,
    queue: &str,
    cond: impl Fn(&QueueStatus) -> bool,
) -> QueueStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        let status = broker.queue_status(queue).await.unwrap();
        if cond(&status) {
            return status;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for queue status, last seen: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn publish_reports_pending() {
    let broker = setup().await;

    let id = broker
        .publish("orders", json!({"order_id": 123}))
        .await
        .unwrap();
    assert!(id > 0);

    let status = broker.queue_status("orders").await.unwrap();
    assert_eq!(
        status,
        QueueStatus {
            queue: "orders".to_owned(),
            pending: 1,
            processing: 0,
            processed: 0,
            failed: 0,
            total: 1,
        }
    );
}

#[tokio::test]
async fn consumer_processes_message() {
    let broker = setup().await;

    broker
        .publish("orders", json!({"order_id": 123}))
        .await
        .unwrap();

    broker
        .register_consumer("orders", |_payload| async move { Ok(()) })
        .await
        .unwrap();

    let status = wait_for_status(&broker, "orders", |s| s.processed == 1).await;
    assert_eq!(status.pending, 0);
    assert_eq!(status.processing, 0);
    assert_eq!(status.failed, 0);
    assert_eq!(status.total, 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn failed_message_is_parked_until_retried() {
    let broker = setup().await;

    broker
        .publish("payments", json!({"amount": 7}))
        .await
        .unwrap();

    let succeed = Arc::new(AtomicBool::new(false));
    let flag = succeed.clone();

    broker
        .register_consumer("payments", move |_payload| {
            let flag = flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(eyre::eyre!("card declined"))
                }
            }
        })
        .await
        .unwrap();

    let status = wait_for_status(&broker, "payments", |s| s.failed == 1).await;
    assert_eq!(status.processed, 0);
    assert_eq!(status.pending, 0);

    // Parked: the consumer keeps polling but must not reclaim it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = broker.queue_status("payments").await.unwrap();
    assert_eq!(status.failed, 1);
    assert_eq!(status.processed, 0);

    succeed.store(true, Ordering::SeqCst);

    let retried = broker.retry_failed("payments", None).await.unwrap();
    assert_eq!(retried, 1);

    let status = wait_for_status(&broker, "payments", |s| s.processed == 1).await;
    assert_eq!(status.failed, 0);
    assert_eq!(status.pending, 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn failure_description_is_recorded_and_cleared() {
    let broker = setup().await;

    let store = broker.store();
    let id = store.insert("jobs", &json!({"n": 1})).await.unwrap();

    let claimed = store.claim_next("jobs").await.unwrap().unwrap();
    assert_eq!(claimed.id, id);

    store.mark_failed(id, "boom").await.unwrap();

    // Not eligible while failed.
    assert!(store.claim_next("jobs").await.unwrap().is_none());

    assert_eq!(store.clear_errors("jobs", 100).await.unwrap(), 1);

    let reclaimed = store.claim_next("jobs").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.error, None);
    assert_eq!(reclaimed.error_at, None);

    store.mark_processed(id).await.unwrap();
    let status = broker.queue_status("jobs").await.unwrap();
    assert_eq!(status.processed, 1);
    assert_eq!(status.failed, 0);
}

#[tokio::test]
async fn fifo_within_a_queue() {
    let broker = setup().await;

    for n in 1..=5i64 {
        broker.publish("orders", json!({"order_id": n})).await.unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    broker
        .register_consumer("orders", move |payload| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .push(payload["order_id"].as_i64().unwrap());
                Ok(())
            }
        })
        .await
        .unwrap();

    wait_for_status(&broker, "orders", |s| s.processed == 5).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    broker.shutdown().await;
}

#[tokio::test]
async fn concurrent_claims_never_duplicate() {
    let broker = setup().await;
    let store = broker.store().clone();

    const MESSAGES: usize = 40;
    for n in 0..MESSAGES {
        store.insert("bulk", &json!({"n": n})).await.unwrap();
    }

    let claimed = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let claimed = claimed.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = store.claim_next("bulk").await.unwrap() {
                claimed.lock().unwrap().push(message.id);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut ids = claimed.lock().unwrap().clone();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), MESSAGES, "each message claimed exactly once");
}

#[tokio::test]
async fn mark_processed_is_idempotent() {
    let broker = setup().await;
    let store = broker.store();

    let id = store.insert("orders", &json!({"order_id": 1})).await.unwrap();
    store.claim_next("orders").await.unwrap().unwrap();

    store.mark_processed(id).await.unwrap();
    let first = store.find(id).await.unwrap().unwrap();
    assert!(first.processed_at.is_some());

    // The repeat call must leave the terminal state untouched, including
    // the completion timestamp.
    tokio::time::sleep(Duration::from_millis(25)).await;
    store.mark_processed(id).await.unwrap();
    let second = store.find(id).await.unwrap().unwrap();

    assert_eq!(second.processed_at, first.processed_at);
    assert!(second.processed);
    assert!(!second.processing);
    assert_eq!(second.error, None);

    let status = broker.queue_status("orders").await.unwrap();
    assert_eq!(status.processed, 1);
    assert_eq!(status.processing, 0);
    assert_eq!(status.total, 1);
}

#[tokio::test]
async fn unknown_message_id_is_not_found() {
    let broker = setup().await;

    let err = broker.store().mark_processed(9999).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { id: 9999 }));

    let err = broker.store().mark_failed(9999, "nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { id: 9999 }));
}

#[tokio::test]
async fn duplicate_consumer_is_rejected() {
    let broker = setup().await;

    broker
        .register_consumer("orders", |_| async move { Ok(()) })
        .await
        .unwrap();

    let err = broker
        .register_consumer("orders", |_| async move { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateQueue { .. }));

    broker.shutdown().await;
}

#[tokio::test]
async fn empty_queue_name_is_rejected() {
    let broker = setup().await;

    let err = broker.publish("", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));

    let err = broker
        .register_consumer("", |_| async move { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
}

#[tokio::test]
async fn claim_on_empty_queue_returns_none() {
    let broker = setup().await;

    assert!(broker.store().claim_next("empty").await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let broker = setup().await;

    broker
        .register_consumer("orders", |_| async move { Ok(()) })
        .await
        .unwrap();

    // Loop is idling on an empty queue; both calls must return promptly.
    tokio::time::timeout(Duration::from_secs(5), broker.shutdown())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), broker.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_consumer() {
    let broker = setup().await;

    let first = broker.publish("orders", json!({"order_id": 1})).await.unwrap();
    broker.publish("orders", json!({"order_id": 2})).await.unwrap();

    broker
        .register_consumer("orders", |payload| async move {
            if payload["order_id"] == 1 {
                panic!("malformed order");
            }
            Ok(())
        })
        .await
        .unwrap();

    // The panic must be recorded as a failure and the loop must go on to
    // process the second message.
    let status =
        wait_for_status(&broker, "orders", |s| s.failed == 1 && s.processed == 1).await;
    assert_eq!(status.pending, 0);
    assert_eq!(status.processing, 0);

    let message = broker.store().find(first).await.unwrap().unwrap();
    assert!(!message.processing);
    let error = message.error.unwrap();
    assert!(error.contains("panicked"), "unexpected error text: {error}");
    assert!(error.contains("malformed order"), "unexpected error text: {error}");

    broker.shutdown().await;
}

#[tokio::test]
async fn bad_message_does_not_stop_the_consumer() {
    let broker = setup().await;

    broker.publish("orders", json!({"order_id": 1})).await.unwrap();
    broker.publish("orders", json!({"order_id": 2})).await.unwrap();

    broker
        .register_consumer("orders", |payload| async move {
            if payload["order_id"] == 1 {
                Err(eyre::eyre!("downstream unavailable"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

    let status =
        wait_for_status(&broker, "orders", |s| s.failed == 1 && s.processed == 1).await;
    assert_eq!(status.pending, 0);

    broker.shutdown().await;
}
