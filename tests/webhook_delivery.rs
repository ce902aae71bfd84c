//! Webhook Delivery Integration Tests
//!
//! The durable queue, dispatcher and dead-letter path working together
//! against a scripted receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use palisade::core::circuit::{CircuitBreaker, CircuitConfig};
use palisade::domain::AttemptError;
use palisade::webhook::{
    DeliverySender, DeliveryStatus, DeliveryStore, WebhookConfig, WebhookDispatcher,
};

/// Receiver that fails a fixed number of times, then accepts.
struct FlakyReceiver {
    failures_before_success: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl DeliverySender for FlakyReceiver {
    async fn post(
        &self,
        _target: &str,
        _body: &[u8],
        _headers: &HashMap<String, String>,
    ) -> Result<u16, AttemptError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            Ok(500)
        } else {
            Ok(200)
        }
    }
}

fn immediate_retries() -> WebhookConfig {
    WebhookConfig {
        base_delay_ms: 0,
        max_delay_ms: 0,
        ..WebhookConfig::default()
    }
}

async fn setup(
    sender: Arc<dyn DeliverySender>,
    config: WebhookConfig,
) -> (WebhookDispatcher, Arc<DeliveryStore>, TempDir) {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(
        DeliveryStore::open(temp.path().join("deliveries.jsonl"))
            .await
            .unwrap(),
    );
    let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
    let dispatcher = WebhookDispatcher::new(store.clone(), sender, circuits, config);
    (dispatcher, store, temp)
}

#[tokio::test]
async fn test_flaky_receiver_eventually_delivered() {
    let receiver = Arc::new(FlakyReceiver {
        failures_before_success: 3,
        calls: AtomicUsize::new(0),
    });
    let (dispatcher, store, _temp) = setup(receiver.clone(), immediate_retries()).await;

    let id = store
        .enqueue(
            "https://client.example/hooks/content",
            "content_approved",
            serde_json::json!({"campaign_id": "c-42", "post_id": "p-7"}),
        )
        .await
        .unwrap();

    for _ in 0..4 {
        dispatcher.tick().await.unwrap();
    }

    let delivery = store.get(id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 4);
    assert_eq!(delivery.attempt_latencies_ms.len(), 4);
    assert!(delivery.delivered_at.is_some());
    assert_eq!(receiver.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_dead_receiver_is_dead_lettered_then_replayed() {
    let receiver = Arc::new(FlakyReceiver {
        failures_before_success: 5,
        calls: AtomicUsize::new(0),
    });
    let (dispatcher, store, _temp) = setup(receiver.clone(), immediate_retries()).await;

    let id = store
        .enqueue(
            "https://client.example/hooks/content",
            "content_published",
            serde_json::json!({"post_url": "https://social.example/p/1"}),
        )
        .await
        .unwrap();

    // Attempt budget is 5; extra ticks must not touch the receiver.
    for _ in 0..8 {
        dispatcher.tick().await.unwrap();
    }

    let delivery = store.get(id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::DeadLettered);
    assert_eq!(delivery.attempts, 5);
    assert_eq!(receiver.calls.load(Ordering::SeqCst), 5);
    assert_eq!(store.dead_letters().await.unwrap().len(), 1);

    // Replay grants a fresh budget; the receiver has recovered.
    store.replay_dead_letter(id).await.unwrap();
    dispatcher.tick().await.unwrap();

    let delivery = store.get(id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 1);
    assert!(store.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_state_survives_restart() {
    let receiver = Arc::new(FlakyReceiver {
        failures_before_success: 1,
        calls: AtomicUsize::new(0),
    });

    let temp = TempDir::new().unwrap();
    let path = temp.path().join("deliveries.jsonl");

    let id = {
        let store = Arc::new(DeliveryStore::open(path.clone()).await.unwrap());
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            receiver.clone(),
            circuits,
            immediate_retries(),
        );

        let id = store
            .enqueue("https://client.example/h", "evt", serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.tick().await.unwrap();
        id
    };

    // A fresh process sees the pending delivery with one failed attempt
    // already on record, and completes it.
    let store = Arc::new(DeliveryStore::open(path).await.unwrap());
    let delivery = store.get(id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempts, 1);

    let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
    let dispatcher =
        WebhookDispatcher::new(store.clone(), receiver, circuits, immediate_retries());
    dispatcher.tick().await.unwrap();

    let delivery = store.get(id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 2);
}

#[tokio::test]
async fn test_due_ordering_is_oldest_first() {
    let temp = TempDir::new().unwrap();
    let store = DeliveryStore::open(temp.path().join("deliveries.jsonl"))
        .await
        .unwrap();

    let first = store
        .enqueue("https://a.example/h", "evt", serde_json::json!({"n": 1}))
        .await
        .unwrap();
    let second = store
        .enqueue("https://b.example/h", "evt", serde_json::json!({"n": 2}))
        .await
        .unwrap();

    let due = store.due(Utc::now()).await.unwrap();
    assert_eq!(due.len(), 2);
    assert_eq!(due[0].id, first);
    assert_eq!(due[1].id, second);
}
