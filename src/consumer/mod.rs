//! Consumption loop: bridges delivered messages to the handler and converts
//! each outcome into a broker disposition.
//!
//! The loop pulls from a bounded queue fed by the broker session. Because the
//! queue capacity and the prefetch limit are both 1, at most one handler
//! invocation is outstanding at any time and dispositions depart in delivery
//! order. Every delivery gets exactly one terminal disposition: ack when the
//! handler reports success, nack+requeue on failure or fault.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use crate::broker::{DispositionSink, InboundMessage, MessageHandler};
use crate::logging::BestEffortLog;

/// Process deliveries until the queue closes.
pub async fn run(
    mut deliveries: mpsc::Receiver<InboundMessage>,
    sink: Arc<dyn DispositionSink>,
    handler: Arc<dyn MessageHandler>,
    log: BestEffortLog,
) {
    while let Some(message) = deliveries.recv().await {
        let text = String::from_utf8_lossy(&message.payload).into_owned();

        match handler.handle(text).await {
            Ok(true) => sink.ack(message.handle).await,
            Ok(false) => sink.nack_requeue(message.handle).await,
            Err(e) => {
                // A fault is never an ack: requeue so the message survives.
                log.record(&format!("Message handler fault: {}", e));
                error!(error = %e, tag = message.handle.delivery_tag, "Handler fault, requeueing");
                sink.nack_requeue(message.handle).await;
            }
        }
    }
}
