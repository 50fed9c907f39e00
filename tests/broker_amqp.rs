//! Broker session integration tests using testcontainers.
//!
//! Run with: cargo test --test broker_amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use billing_consumer::broker::{BrokerError, BrokerSession, MessageHandler, Result as BrokerResult};
use billing_consumer::config::{BrokerConfig, Config, StorageConfig};
use billing_consumer::logging::BestEffortLog;
use billing_consumer::service::ConsumerService;

const PAYLOAD: &str = r#"{"billId":"B-1","period":"2024-01","moId":"MO-7","previousVersion":"17246553","currentVersion":"17246554","differenceDetectedAt":"2024-01-15T10:30:00Z","changeType":"versionUpdated","metadata":{"source":"integration"}}"#;

/// Start RabbitMQ container.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String, u16) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host")
        .to_string();

    println!("RabbitMQ available at: {}:{}", host, port);

    (container, host, port)
}

fn broker_config(host: &str, port: u16, queue: &str) -> BrokerConfig {
    BrokerConfig {
        host: host.to_string(),
        port,
        queue: queue.to_string(),
        ..Default::default()
    }
}

/// Declare the queue and publish a payload through the default exchange.
async fn declare_and_publish(config: &BrokerConfig, payload: &[u8]) {
    let connection = Connection::connect_uri(config.amqp_uri(), ConnectionProperties::default())
        .await
        .expect("Failed to connect for publishing");
    let channel = connection
        .create_channel()
        .await
        .expect("Failed to open publish channel");

    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .expect("Failed to declare queue");

    channel
        .basic_publish(
            "",
            &config.queue,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default(),
        )
        .await
        .expect("Failed to publish")
        .await
        .expect("Publish confirmation failed");

    connection.close(200, "publisher done").await.ok();
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

fn unique_queue(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// End to end: a published message lands on disk verbatim and is acked.
#[tokio::test]
async fn test_consume_persist_ack() {
    let (_container, host, port) = start_rabbitmq().await;
    let broker = broker_config(&host, port, &unique_queue("bills"));
    declare_and_publish(&broker, PAYLOAD.as_bytes()).await;

    let output = tempfile::TempDir::new().unwrap();
    let config = Config {
        broker: broker.clone(),
        storage: StorageConfig {
            output_dir: output.path().to_path_buf(),
        },
    };

    let mut service = ConsumerService::start(&config, BestEffortLog::default())
        .await
        .expect("Failed to start consumer");

    let dir = output.path().to_path_buf();
    let stored = wait_until(Duration::from_secs(10), || {
        std::fs::read_dir(&dir).map(|d| d.count()).unwrap_or(0) == 1
    })
    .await;
    assert!(stored, "message was not persisted in time");

    let file = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap();
    let name = file.file_name().into_string().unwrap();
    assert!(name.starts_with("Bill_B-1_Per_2024-01_V17246554_"), "{}", name);
    assert_eq!(std::fs::read_to_string(file.path()).unwrap(), PAYLOAD);

    service.stop().await;
}

/// Handler that reports failure on the first delivery, success afterwards.
struct FlakyHandler {
    calls: Arc<AtomicUsize>,
}

impl MessageHandler for FlakyHandler {
    fn handle(&self, _payload: String) -> BoxFuture<'static, BrokerResult<bool>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(call > 0) })
    }
}

/// At-least-once: a nacked message is redelivered until the handler succeeds.
#[tokio::test]
async fn test_failed_handler_is_redelivered() {
    let (_container, host, port) = start_rabbitmq().await;
    let broker = broker_config(&host, port, &unique_queue("bills-retry"));
    declare_and_publish(&broker, PAYLOAD.as_bytes()).await;

    let session = BrokerSession::connect(broker.clone(), BestEffortLog::default())
        .await
        .expect("Failed to connect");

    let calls = Arc::new(AtomicUsize::new(0));
    session
        .start_consuming(Arc::new(FlakyHandler {
            calls: calls.clone(),
        }))
        .await
        .expect("Failed to start consuming");

    let seen = calls.clone();
    let redelivered = wait_until(Duration::from_secs(10), || seen.load(Ordering::SeqCst) >= 2).await;
    assert!(redelivered, "message was not redelivered after nack");

    session.close().await;
}

/// Disposal is idempotent: closing twice produces no fault.
#[tokio::test]
async fn test_close_is_idempotent() {
    let (_container, host, port) = start_rabbitmq().await;
    let broker = broker_config(&host, port, &unique_queue("bills-close"));

    let session = BrokerSession::connect(broker, BestEffortLog::default())
        .await
        .expect("Failed to connect");

    session.close().await;
    session.close().await;
}

/// The passive queue check makes a missing queue a startup fault.
#[tokio::test]
async fn test_missing_queue_is_fatal() {
    let (_container, host, port) = start_rabbitmq().await;
    let broker = broker_config(&host, port, &unique_queue("never-declared"));

    let session = BrokerSession::connect(broker, BestEffortLog::default())
        .await
        .expect("Failed to connect");

    struct NoopHandler;
    impl MessageHandler for NoopHandler {
        fn handle(&self, _payload: String) -> BoxFuture<'static, BrokerResult<bool>> {
            Box::pin(async { Ok(true) })
        }
    }

    let result = session.start_consuming(Arc::new(NoopHandler)).await;
    assert!(matches!(result, Err(BrokerError::Queue(_))));

    session.close().await;
}

/// Bad credentials are a construction-time fault, not a retry loop.
#[tokio::test]
async fn test_bad_credentials_are_fatal() {
    let (_container, host, port) = start_rabbitmq().await;
    let broker = BrokerConfig {
        username: "nobody".to_string(),
        password: "wrong".to_string(),
        ..broker_config(&host, port, "any")
    };

    let result = BrokerSession::connect(broker, BestEffortLog::default()).await;
    assert!(matches!(result, Err(BrokerError::Connection(_))));
}
