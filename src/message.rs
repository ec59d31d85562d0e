//! The application message crossing the hub boundary in either direction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// MQTT quality of service recognized for telemetry publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery. The hub default.
    #[default]
    AtLeastOnce,
}

/// Per-message transport options. `qos` defaults to at-least-once when
/// unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOptions {
    pub qos: Option<Qos>,
}

/// A device-to-cloud or cloud-to-device message.
///
/// System properties travel URL-encoded in the topic name, not in the
/// payload; the payload itself is opaque to the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,

    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub to: Option<String>,
    /// Absolute expiry, formatted RFC 3339 in UTC on the wire.
    pub expiry_time: Option<DateTime<Utc>>,
    /// Set by the hub on inbound messages only.
    pub connection_device_id: Option<String>,

    /// Application properties. Keys are unique; wire ordering is not
    /// significant.
    pub properties: HashMap<String, String>,

    pub transport_options: TransportOptions,
}

impl Message {
    /// A message with the given payload and no properties.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// The QoS this message should be published at.
    pub fn qos(&self) -> Qos {
        self.transport_options.qos.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_defaults_to_at_least_once() {
        let msg = Message::new("hello");
        assert_eq!(msg.qos(), Qos::AtLeastOnce);
    }

    #[test]
    fn qos_option_is_honored() {
        let mut msg = Message::new("hello");
        msg.transport_options.qos = Some(Qos::AtMostOnce);
        assert_eq!(msg.qos(), Qos::AtMostOnce);
    }
}
