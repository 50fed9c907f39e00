//! Billing version-difference consumer.
//!
//! Pulls billing version-difference events from RabbitMQ and persists each
//! verbatim payload to disk, acknowledging only after the write succeeds.
//! Delivery is at-least-once: a failed write puts the message back on the
//! queue, so duplicates are possible and message loss is not.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod logging;
pub mod message;
pub mod persistence;
pub mod service;
