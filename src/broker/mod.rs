//! Broker session and delivery plumbing.
//!
//! This module contains:
//! - `BrokerError`: error taxonomy for broker operations
//! - `MessageHandler` trait: the per-message processing seam
//! - `DispositionSink` trait: ack/nack decisions flowing back to the broker
//! - `BrokerSession`: one connection + one channel with automatic recovery

pub mod session;

pub use session::BrokerSession;

use futures::future::BoxFuture;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid broker configuration: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel operation failed: {0}")]
    Channel(String),

    #[error("Queue check failed: {0}")]
    Queue(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Opaque per-delivery handle, used exactly once to ack or nack.
///
/// The epoch identifies the channel generation the delivery arrived on.
/// Delivery tags are channel-scoped, so after a recovery the session skips
/// dispositions carrying an older epoch; the broker redelivers everything
/// left unacknowledged on the dead channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub delivery_tag: u64,
    pub channel_epoch: u64,
}

/// One delivered message: raw payload plus its disposition handle.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub handle: DeliveryHandle,
}

/// Handler invoked once per delivered message.
///
/// `Ok(true)` means the message was processed and may be removed from the
/// queue; `Ok(false)` means it must be redelivered. An error is treated
/// exactly like `Ok(false)`, never as an acknowledgment.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: String) -> BoxFuture<'static, Result<bool>>;
}

/// Terminal disposition decisions flowing back to the broker.
///
/// Negative acknowledgment always requests requeue, never discard: losing a
/// message is worse than reprocessing it.
#[async_trait::async_trait]
pub trait DispositionSink: Send + Sync {
    async fn ack(&self, handle: DeliveryHandle);
    async fn nack_requeue(&self, handle: DeliveryHandle);
}
