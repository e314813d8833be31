//! Worker pool concurrency tests

mod common;

use async_trait::async_trait;
use common::{fast_subscriber, publisher, unique_queue, wait_until};
use redisqueue::lifecycle::Controller;
use redisqueue::processor::{Context, Handler};
use redisqueue::{Broker, MemoryBroker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks how many invocations overlap
#[derive(Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
    events: Mutex<Vec<(u64, &'static str)>>,
}

#[async_trait]
impl Handler for Gauge {
    async fn handle(&self, _ctx: &Context, content: &[u8]) -> redisqueue::Result<()> {
        let id: u64 = serde_json::from_slice(content).unwrap_or_default();
        self.events.lock().unwrap().push((id, "start"));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(30)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push((id, "end"));
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_in_flight_never_exceeds_concurrency() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("concurrency");
    let gauge = Arc::new(Gauge::default());

    let subscriber = fast_subscriber(&broker, &queue, 3)
        .handler(gauge.clone())
        .build()
        .unwrap();
    let controller = Controller::spawn(Arc::new(subscriber));

    let publisher = publisher(&broker, 0);
    for i in 0..12u64 {
        publisher.publish(&Context::new(), &queue, &i).await.unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || gauge.done.load(Ordering::SeqCst) == 12).await);
    controller.shutdown().await.unwrap();

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak in-flight was {}", peak);
    assert_eq!(broker.queue_stats(&queue).await.unwrap().processed, 12);
}

#[tokio::test]
async fn test_single_slot_runs_back_to_back() {
    let broker = MemoryBroker::new();
    let queue = unique_queue("sequential");
    let gauge = Arc::new(Gauge::default());

    let subscriber = fast_subscriber(&broker, &queue, 1)
        .handler(gauge.clone())
        .build()
        .unwrap();
    let controller = Controller::spawn(Arc::new(subscriber));

    let publisher = publisher(&broker, 0);
    publisher.publish(&Context::new(), &queue, &1u64).await.unwrap();
    publisher.publish(&Context::new(), &queue, &2u64).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || gauge.done.load(Ordering::SeqCst) == 2).await);
    controller.shutdown().await.unwrap();

    // The second invocation starts only after the first has returned
    let events = gauge.events.lock().unwrap().clone();
    assert_eq!(events, vec![(1, "start"), (1, "end"), (2, "start"), (2, "end")]);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}
