//! Broker connection configuration types.

use std::collections::HashMap;
use std::time::Duration;

use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;

use crate::message::EVENT_TYPE;

/// RabbitMQ connection and topology settings.
///
/// Immutable after load; shared read-only by the broker session. The
/// dead-letter names and queue arguments are carried for operational
/// configuration of the queue itself; the consumer never routes to them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Negotiate TLS (AMQPS) for the connection.
    pub use_tls: bool,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    /// Connection-tuning knobs.
    pub connection: ConnectionSettings,
    /// Arbitrary arguments attached to the queue declaration.
    pub queue_arguments: HashMap<String, serde_json::Value>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            use_tls: false,
            exchange: "billing".to_string(),
            queue: "billing.version-differences".to_string(),
            routing_key: EVENT_TYPE.to_string(),
            dead_letter_exchange: "billing.dlx".to_string(),
            dead_letter_queue: "billing.version-differences.dlq".to_string(),
            connection: ConnectionSettings::default(),
            queue_arguments: HashMap::new(),
        }
    }
}

/// Connection-tuning settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Re-establish the connection after transient network faults.
    pub automatic_recovery: bool,
    /// Fixed interval between recovery attempts.
    pub recovery_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub heartbeat_secs: u16,
    /// Prefix for the client-provided connection name shown in the broker
    /// management UI.
    pub client_name_prefix: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            automatic_recovery: true,
            recovery_interval_secs: 10,
            connection_timeout_secs: 30,
            heartbeat_secs: 60,
            client_name_prefix: "billing".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Build the connection URI, carrying heartbeat and timeout tuning.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.use_tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.connection.heartbeat_secs),
                // lapin expects milliseconds here
                connection_timeout: Some(self.connection.connection_timeout_secs * 1000),
                ..Default::default()
            },
        }
    }

    /// Client-provided connection name, so operators can tell consumers apart
    /// in the management UI.
    pub fn client_name(&self) -> String {
        format!("{}-consumer", self.connection.client_name_prefix)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.connection.recovery_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 5672);
        assert_eq!(config.routing_key, "billing.version.difference");
        assert!(config.connection.automatic_recovery);
        assert_eq!(config.recovery_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_uri_plain() {
        let config = BrokerConfig {
            host: "mq.internal".to_string(),
            port: 5673,
            username: "billing".to_string(),
            password: "secret".to_string(),
            vhost: "prod".to_string(),
            ..Default::default()
        };
        let uri = config.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "mq.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "billing");
        assert_eq!(uri.vhost, "prod");
        assert_eq!(uri.query.heartbeat, Some(60));
        assert_eq!(uri.query.connection_timeout, Some(30_000));
    }

    #[test]
    fn test_uri_tls() {
        let config = BrokerConfig {
            use_tls: true,
            ..Default::default()
        };
        assert_eq!(config.amqp_uri().scheme, AMQPScheme::AMQPS);
    }

    #[test]
    fn test_client_name() {
        let config = BrokerConfig::default();
        assert_eq!(config.client_name(), "billing-consumer");
    }
}
