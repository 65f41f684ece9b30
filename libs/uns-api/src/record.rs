use std::borrow::Cow;

use chrono::{DateTime, Utc};

use crate::error::UnsError;

/// Raw delivery as produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Set when the broker replays a retained value on subscribe.
    pub retain: bool,
}

/// A message handed to bus handlers. Transient: lives only as long as the
/// consuming worker keeps it.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Payload as UTF-8 text; invalid sequences are replaced.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Payload parsed as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, UnsError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Payload as JSON when it parses, otherwise as a JSON string.
    pub fn payload_value(&self) -> serde_json::Value {
        self.payload_json()
            .unwrap_or_else(|_| serde_json::Value::String(self.payload_text().into_owned()))
    }
}

impl From<TransportMessage> for Message {
    fn from(raw: TransportMessage) -> Self {
        Message::new(raw.topic, raw.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_value_prefers_json() {
        let msg = Message::new("devices/a/nodes/b", br#"{"now":"2024-01-01T00:00:00Z"}"#.to_vec());
        assert_eq!(msg.payload_value()["now"], "2024-01-01T00:00:00Z");

        let msg = Message::new("devices/a/nodes/b", b"not json".to_vec());
        assert_eq!(msg.payload_value(), serde_json::json!("not json"));
    }

    #[test]
    fn payload_text_is_lossy() {
        let msg = Message::new("t", vec![b'o', b'k', 0xff]);
        assert_eq!(msg.payload_text(), "ok\u{fffd}");
    }
}
