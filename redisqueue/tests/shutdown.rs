//! Graceful shutdown tests
//!
//! - stop() waits for in-flight handlers
//! - Handlers observe cancellation cooperatively
//! - An optional bound on the drain
//! - Deliveries cut off by the bound, or by a lost consumer, are redelivered

mod common;

use common::{fast_subscriber, publisher, unique_queue, wait_until, RecordingHandler};
use redisqueue::lifecycle::Controller;
use redisqueue::processor::{handler_fn, Context};
use redisqueue::{Broker, Error, MemoryBroker, SubscriberState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_stop_waits_for_in_flight_handler() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("drain");
    let handler = RecordingHandler::slow(Duration::from_millis(300));

    let subscriber = Arc::new(
        fast_subscriber(&broker, &queue, 1)
            .handler(handler.clone())
            .build()
            .unwrap(),
    );
    let running = tokio::spawn({
        let subscriber = subscriber.clone();
        async move { subscriber.start().await }
    });

    publisher(&broker, 0)
        .publish(&Context::new(), &queue, &serde_json::json!({}))
        .await
        .unwrap();

    // Handler has started but not finished
    assert!(wait_until(Duration::from_secs(2), || handler.calls().len() == 1).await);
    assert_eq!(handler.count(), 0);

    subscriber.stop().await.unwrap();
    assert_eq!(handler.count(), 1);
    assert_eq!(subscriber.state(), SubscriberState::Stopped);

    assert!(running.await.unwrap().is_ok());
    assert_eq!(broker.queue_stats(&queue).await.unwrap().processed, 1);
}

#[tokio::test]
async fn test_handler_observes_cancellation() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("cooperative");
    let started = Arc::new(AtomicBool::new(false));

    let handler = {
        let started = started.clone();
        handler_fn(move |ctx: Context, _content| {
            let started = started.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                ctx.cancelled().await;
                Ok(())
            }
        })
    };

    let subscriber = fast_subscriber(&broker, &queue, 1)
        .handler(handler)
        .build()
        .unwrap();
    let controller = Controller::spawn(Arc::new(subscriber));

    publisher(&broker, 0)
        .publish(&Context::new(), &queue, &serde_json::json!({}))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst)).await);

    tokio::time::timeout(Duration::from_secs(2), controller.shutdown())
        .await
        .expect("shutdown should finish once the handler returns")
        .unwrap();

    assert_eq!(broker.queue_stats(&queue).await.unwrap().processed, 1);
}

#[tokio::test]
async fn test_shutdown_timeout_aborts_stuck_handlers() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("timeout");
    let handler = RecordingHandler::slow(Duration::from_secs(30));

    let subscriber = Arc::new(
        fast_subscriber(&broker, &queue, 1)
            .shutdown_timeout(Duration::from_millis(100))
            .handler(handler.clone())
            .build()
            .unwrap(),
    );
    let running = tokio::spawn({
        let subscriber = subscriber.clone();
        async move { subscriber.start().await }
    });

    publisher(&broker, 0)
        .publish(&Context::new(), &queue, &serde_json::json!({}))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || handler.calls().len() == 1).await);

    let stopped = subscriber.stop().await;
    assert!(matches!(stopped, Err(Error::ShutdownTimeout(_))));
    assert!(matches!(running.await.unwrap(), Err(Error::ShutdownTimeout(_))));
    assert_eq!(subscriber.state(), SubscriberState::Stopped);
    assert_eq!(handler.count(), 0);
}

#[tokio::test]
async fn test_fatal_broker_error_surfaces_from_start() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("fatal");

    let subscriber = Arc::new(
        fast_subscriber(&broker, &queue, 4)
            .handler(RecordingHandler::new())
            .build()
            .unwrap(),
    );
    let controller = Controller::spawn(subscriber.clone());

    let mut state = subscriber.watch_state();
    state
        .wait_for(|s| *s == SubscriberState::Running)
        .await
        .unwrap();
    broker.close();

    assert!(matches!(controller.wait().await, Err(Error::BrokerClosed)));
    assert_eq!(subscriber.state(), SubscriberState::Stopped);
}

#[tokio::test]
async fn test_aborted_delivery_is_redelivered_to_next_subscriber() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("abort-redeliver");
    let stuck = RecordingHandler::slow(Duration::from_secs(30));

    let first = Arc::new(
        fast_subscriber(&broker, &queue, 1)
            .shutdown_timeout(Duration::from_millis(100))
            .handler(stuck.clone())
            .build()
            .unwrap(),
    );
    let controller = Controller::spawn(first);

    publisher(&broker, 0)
        .publish(&Context::new(), &queue, &serde_json::json!({"n": 1}))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || stuck.calls().len() == 1).await);

    assert!(matches!(controller.shutdown().await, Err(Error::ShutdownTimeout(_))));

    let stats = broker.queue_stats(&queue).await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.pending, 1);

    let handler = RecordingHandler::new();
    let second = fast_subscriber(&broker, &queue, 1)
        .handler(handler.clone())
        .build()
        .unwrap();
    let controller = Controller::spawn(Arc::new(second));

    assert!(wait_until(Duration::from_secs(2), || handler.count() == 1).await);
    controller.shutdown().await.unwrap();

    assert_eq!(handler.calls()[0].content, br#"{"n":1}"#.to_vec());
    let stats = broker.queue_stats(&queue).await.unwrap();
    assert_eq!(stats.processed, 1);
    // Requeued without consuming the zero retry budget
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.dead, 0);
}

#[tokio::test]
async fn test_delivery_of_lost_consumer_is_recovered() {
    let broker = MemoryBroker::new()
        .with_retry_delay(Duration::ZERO)
        .with_lease(Duration::from_millis(50));
    let queue = unique_queue("lost-consumer");

    publisher(&broker, 1)
        .publish(&Context::new(), &queue, &serde_json::json!({}))
        .await
        .unwrap();

    // A consumer takes the delivery and disappears without reporting
    let lost = broker.dequeue(&queue, Duration::from_millis(50)).await.unwrap().unwrap();

    let handler = RecordingHandler::new();
    let subscriber = fast_subscriber(&broker, &queue, 1)
        .handler(handler.clone())
        .build()
        .unwrap();
    let controller = Controller::spawn(Arc::new(subscriber));

    assert!(wait_until(Duration::from_secs(2), || handler.count() == 1).await);
    controller.shutdown().await.unwrap();

    let stats = broker.queue_stats(&queue).await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
    assert!(matches!(broker.ack(&lost).await, Err(Error::TaskNotFound(_))));
}

#[tokio::test]
async fn test_slow_handler_keeps_its_lease() {
    let broker = MemoryBroker::new()
        .with_retry_delay(Duration::ZERO)
        .with_lease(Duration::from_millis(150));
    let queue = unique_queue("lease-renewal");
    let handler = RecordingHandler::slow(Duration::from_millis(600));

    let subscriber = fast_subscriber(&broker, &queue, 2)
        .handler(handler.clone())
        .build()
        .unwrap();
    let controller = Controller::spawn(Arc::new(subscriber));

    publisher(&broker, 3)
        .publish(&Context::new(), &queue, &serde_json::json!({}))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || handler.count() == 1).await);
    controller.shutdown().await.unwrap();

    assert_eq!(handler.calls().len(), 1);
    let stats = broker.queue_stats(&queue).await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);
}
