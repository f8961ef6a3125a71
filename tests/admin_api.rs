//! Admin API tests
//!
//! Requests go straight into the router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use ara_broker_core::broker::Broker;
use ara_broker_core::config::Settings;
use ara_broker_core::consumer::ChannelConsumer;
use ara_broker_core::delivery::TaskScheduler;
use ara_broker_core::message::Metadata;
use ara_broker_core::observe;
use ara_broker_core::server::{create_app, AppState};
use ara_broker_core::store::{MemoryStore, MessageStore};
use ara_broker_core::transaction::Xid;

fn create_broker(settings: &Settings) -> Arc<Broker> {
    let observer = observe::noop();
    let store = Arc::new(MessageStore::new(Arc::new(MemoryStore::new()), observer.clone()));
    let scheduler = Arc::new(TaskScheduler::new(&settings.delivery));
    Arc::new(Broker::new(
        store,
        scheduler,
        observer,
        &settings.broker,
        &settings.delivery,
    ))
}

fn create_test_app(broker: Arc<Broker>) -> Router {
    create_app(AppState::new(broker))
}

async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(app: Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, method, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_reports_store_and_queues() {
    let settings = Settings::default();
    let broker = create_broker(&settings);
    broker.declare_queue("orders", true, false).await.unwrap();
    let app = create_test_app(broker);

    let (status, body) = send_json(app, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"]["backend"], "memory");
    assert_eq!(body["queues"], 1);
    assert_eq!(body["scheduled_tasks"], 1);
}

#[tokio::test]
async fn test_list_and_get_queue() {
    let settings = Settings::default();
    let broker = create_broker(&settings);
    broker.declare_queue("b", false, false).await.unwrap();
    broker.declare_queue("a", true, false).await.unwrap();
    broker
        .publish(&["a"], Metadata::new("amq.direct", "a"), b"x".to_vec())
        .await
        .unwrap();
    let app = create_test_app(broker);

    let (status, body) = send_json(app.clone(), Method::GET, "/queues").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["queues"][0]["name"], "a");
    assert_eq!(body["queues"][1]["name"], "b");

    let (status, body) = send_json(app, Method::GET, "/queues/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["durable"], true);
    assert_eq!(body["size"], 1);
}

#[tokio::test]
async fn test_unknown_queue_is_not_found() {
    let settings = Settings::default();
    let app = create_test_app(create_broker(&settings));

    let (status, body) = send_json(app.clone(), Method::GET, "/queues/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send_json(app, Method::DELETE, "/queues/missing/messages").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_purge_rejected_while_consumers_attached() {
    let settings = Settings::default();
    let broker = create_broker(&settings);
    broker.declare_queue("q", false, false).await.unwrap();
    let (consumer, _rx) = ChannelConsumer::new("q", 1);
    consumer.set_flow(false);
    broker.add_consumer(Arc::new(consumer)).unwrap();
    let app = create_test_app(broker.clone());

    let (status, body) = send_json(app, Method::DELETE, "/queues/q/messages").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    broker.shutdown().await;
}

#[tokio::test]
async fn test_purge_discards_messages() {
    let settings = Settings::default();
    let broker = create_broker(&settings);
    broker.declare_queue("q", false, false).await.unwrap();
    for i in 0..3u8 {
        broker
            .publish(&["q"], Metadata::new("amq.direct", "q"), vec![i])
            .await
            .unwrap();
    }
    let app = create_test_app(broker.clone());

    let (status, body) = send_json(app, Method::DELETE, "/queues/q/messages").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"], "q");
    assert_eq!(body["discarded"], 3);
    assert!(broker.queue_handler("q").unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_exposes_broker_gauges() {
    let settings = Settings::default();
    let broker = create_broker(&settings);
    broker.declare_queue("metered", false, false).await.unwrap();
    let app = create_test_app(broker);

    let (status, body) = send(app, Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("ara_broker_queues_declared"));
    assert!(text.contains("ara_broker_queue_depth{queue=\"metered\"}"));
}

#[tokio::test]
async fn test_in_doubt_transactions_listed() {
    let settings = Settings::default();
    let broker = create_broker(&settings);
    broker.declare_queue("ledger", true, false).await.unwrap();
    let xid = Xid::new(1, b"gtrid".to_vec(), b"bqual".to_vec());
    broker
        .enqueue_in_transaction(&xid, &["ledger"], Metadata::new("amq.direct", "ledger"), b"x".to_vec())
        .unwrap();
    let app = create_test_app(broker.clone());

    let (_, body) = send_json(app.clone(), Method::GET, "/dtx/in-doubt").await;
    assert_eq!(body["total"], 0);

    broker.prepare(&xid).await.unwrap();
    let (status, body) = send_json(app, Method::GET, "/dtx/in-doubt").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["transactions"][0]["xid"], xid.to_string());
    assert_eq!(body["transactions"][0]["format"], 1);
    assert_eq!(body["transactions"][0]["recovered"], false);
}
