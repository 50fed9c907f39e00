//! Broker session: one connection, one channel, bounded in-flight work.
//!
//! The session owns the only connection and channel in the process. All
//! mutating channel operations (ack, nack, close, recovery swap) serialize
//! through a single mutex because a channel handle must not be driven
//! concurrently. Prefetch is fixed at 1: the broker withholds delivery N+1
//! until delivery N has been acknowledged or negatively acknowledged, which
//! bounds the process to one in-flight message and makes processing strictly
//! sequential per channel.

use std::sync::Arc;

use backon::{BackoffBuilder, ConstantBuilder};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{BrokerError, DeliveryHandle, DispositionSink, InboundMessage, MessageHandler, Result};
use crate::config::BrokerConfig;
use crate::consumer;
use crate::logging::BestEffortLog;

/// Prefetch limit: the backpressure bound for the whole pipeline.
const PREFETCH_COUNT: u16 = 1;

/// AMQP reply-success code used when closing channel and connection.
const REPLY_SUCCESS: u16 = 200;

/// A single logical session against the broker.
pub struct BrokerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: BrokerConfig,
    log: BestEffortLog,
    /// The one serialization point for channel access. `None` once closed.
    link: Mutex<Option<Link>>,
}

/// Live connection + channel pair. Replaced wholesale on recovery.
struct Link {
    connection: Connection,
    channel: Channel,
    epoch: u64,
}

impl BrokerSession {
    /// Open the connection and channel and apply QoS.
    ///
    /// Construction-time faults (malformed config, bad credentials, TLS
    /// negotiation failure, unreachable host) are fatal and propagate;
    /// connection faults after construction are handled by recovery.
    pub async fn connect(config: BrokerConfig, log: BestEffortLog) -> Result<Self> {
        validate(&config)?;

        let link = open_link(&config, 0).await?;
        log.record(&format!(
            "Connected to {}:{} vhost '{}' as '{}'",
            config.host,
            config.port,
            config.vhost,
            config.client_name()
        ));
        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            tls = config.use_tls,
            "Connected to broker"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                log,
                link: Mutex::new(Some(link)),
            }),
        })
    }

    /// Verify the queue exists, then begin manual-acknowledgment consumption,
    /// invoking `handler` once per delivered message.
    ///
    /// Spawns the delivery pump (with its reconnect loop) and the processing
    /// task; returns once consumption is set up.
    pub async fn start_consuming(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let queue = self.inner.config.queue.clone();

        // Passive check: fatal if the queue is missing, no side effects on it.
        let pending = {
            let guard = self.inner.link.lock().await;
            let link = guard
                .as_ref()
                .ok_or_else(|| BrokerError::Channel("session is closed".to_string()))?;
            let state = link
                .channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Queue(format!("queue '{}' unavailable: {}", queue, e)))?;
            state.message_count()
        };

        self.inner
            .log
            .record(&format!("Queue '{}' has {} messages waiting", queue, pending));
        info!(queue = %queue, pending, "Starting consumption");

        // Bounded handoff between the delivery pump and the processing task.
        // Capacity matches the prefetch limit: at most one in-flight message.
        let (tx, rx) = mpsc::channel::<InboundMessage>(PREFETCH_COUNT as usize);

        let pump = Arc::clone(&self.inner);
        tokio::spawn(async move { pump.pump_deliveries(tx).await });

        let sink: Arc<dyn DispositionSink> = self.inner.clone();
        let log = self.inner.log.clone();
        tokio::spawn(async move { consumer::run(rx, sink, handler, log).await });

        Ok(())
    }

    /// Close channel then connection. Idempotent: safe to call repeatedly and
    /// after partially failed construction.
    pub async fn close(&self) {
        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.channel.close(REPLY_SUCCESS, "consumer stopping").await {
                debug!(error = %e, "Channel close reported an error");
            }
            if let Err(e) = link
                .connection
                .close(REPLY_SUCCESS, "consumer stopping")
                .await
            {
                debug!(error = %e, "Connection close reported an error");
            }
            self.inner.log.record("Broker session closed");
        }
    }
}

impl SessionInner {
    /// Pump deliveries from the broker into the bounded queue, re-establishing
    /// the connection at a fixed interval after faults.
    async fn pump_deliveries(self: Arc<Self>, tx: mpsc::Sender<InboundMessage>) {
        let recovery = ConstantBuilder::default().with_delay(self.config.recovery_interval());
        let mut delays = recovery.build();

        loop {
            let Some((channel, epoch)) = self.current_channel().await else {
                // Session closed.
                return;
            };

            match channel
                .basic_consume(
                    &self.config.queue,
                    &self.config.client_name(),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(mut deliveries) => {
                    debug!(queue = %self.config.queue, epoch, "Consumer registered");
                    while let Some(delivery) = deliveries.next().await {
                        match delivery {
                            Ok(delivery) => {
                                let message = InboundMessage {
                                    payload: delivery.data,
                                    handle: DeliveryHandle {
                                        delivery_tag: delivery.delivery_tag,
                                        channel_epoch: epoch,
                                    },
                                };
                                if tx.send(message).await.is_err() {
                                    // Processing task is gone; nothing left to feed.
                                    return;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }
                    info!(queue = %self.config.queue, "Consumer stream ended");
                }
                Err(e) => {
                    error!(error = %e, queue = %self.config.queue, "Failed to register consumer");
                }
            }

            if self.is_closed().await {
                return;
            }
            if !self.config.connection.automatic_recovery {
                warn!("Automatic recovery disabled, consumption stops here");
                return;
            }

            let delay = delays
                .next()
                .unwrap_or_else(|| self.config.recovery_interval());
            info!(delay_secs = delay.as_secs(), "Reconnecting after delay");
            tokio::time::sleep(delay).await;
            self.reopen_link().await;
        }
    }

    async fn current_channel(&self) -> Option<(Channel, u64)> {
        let guard = self.link.lock().await;
        guard.as_ref().map(|l| (l.channel.clone(), l.epoch))
    }

    async fn is_closed(&self) -> bool {
        self.link.lock().await.is_none()
    }

    /// Replace the connection and channel after a fault. A closed session is
    /// never resurrected.
    async fn reopen_link(&self) {
        let mut guard = self.link.lock().await;
        let Some(old) = guard.as_ref() else { return };
        let epoch = old.epoch + 1;

        match open_link(&self.config, epoch).await {
            Ok(link) => {
                self.log.record("Broker connection re-established");
                info!(epoch, "Reconnected to broker");
                *guard = Some(link);
            }
            Err(e) => {
                error!(error = %e, "Reconnect attempt failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl DispositionSink for SessionInner {
    async fn ack(&self, handle: DeliveryHandle) {
        let guard = self.link.lock().await;
        match guard.as_ref() {
            Some(link) if link.epoch == handle.channel_epoch => {
                if let Err(e) = link
                    .channel
                    .basic_ack(handle.delivery_tag, BasicAckOptions::default())
                    .await
                {
                    error!(error = %e, tag = handle.delivery_tag, "Failed to ack message");
                }
            }
            Some(_) => warn!(
                tag = handle.delivery_tag,
                "Dropping ack for a replaced channel; the broker will redeliver"
            ),
            None => warn!(tag = handle.delivery_tag, "Dropping ack after close"),
        }
    }

    async fn nack_requeue(&self, handle: DeliveryHandle) {
        let guard = self.link.lock().await;
        match guard.as_ref() {
            Some(link) if link.epoch == handle.channel_epoch => {
                if let Err(e) = link
                    .channel
                    .basic_nack(
                        handle.delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        },
                    )
                    .await
                {
                    error!(error = %e, tag = handle.delivery_tag, "Failed to nack message");
                }
            }
            Some(_) => warn!(
                tag = handle.delivery_tag,
                "Dropping nack for a replaced channel; the broker will redeliver"
            ),
            None => warn!(tag = handle.delivery_tag, "Dropping nack after close"),
        }
    }
}

fn validate(config: &BrokerConfig) -> Result<()> {
    if config.host.is_empty() {
        return Err(BrokerError::Configuration("host must not be empty".into()));
    }
    if config.port == 0 {
        return Err(BrokerError::Configuration("port must not be zero".into()));
    }
    if config.queue.is_empty() {
        return Err(BrokerError::Configuration("queue must not be empty".into()));
    }
    Ok(())
}

async fn open_link(config: &BrokerConfig, epoch: u64) -> Result<Link> {
    let connection = Connection::connect_uri(
        config.amqp_uri(),
        ConnectionProperties::default().with_connection_name(config.client_name().into()),
    )
    .await
    .map_err(|e| BrokerError::Connection(format!("failed to connect: {}", e)))?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::Connection(format!("failed to open channel: {}", e)))?;

    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
        .await
        .map_err(|e| BrokerError::Channel(format!("failed to set QoS: {}", e)))?;

    Ok(Link {
        connection,
        channel,
        epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_malformed_config() {
        let config = BrokerConfig {
            host: String::new(),
            ..Default::default()
        };
        let result = BrokerSession::connect(config, BestEffortLog::default()).await;
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_queue() {
        let config = BrokerConfig {
            queue: String::new(),
            ..Default::default()
        };
        let result = BrokerSession::connect(config, BestEffortLog::default()).await;
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }
}
