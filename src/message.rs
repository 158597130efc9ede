//! Message types passed between the receiving edge, the forwarder and the
//! sending side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification posted by the receiving edge once a message is archived.
///
/// The raw bytes are not part of the event; they live in the archive under
/// `{prefix}/{message_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    /// Envelope sender (MAIL FROM).
    pub sender: String,
    /// Envelope recipients (RCPT TO) on the proxied domain.
    pub recipients: Vec<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        message_id: impl Into<String>,
        sender: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sender: sender.into(),
            recipients,
            received_at: Utc::now(),
        }
    }
}

/// A rewritten message ready for a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEnvelope {
    /// Envelope sender: the sending identity.
    pub from: String,
    /// Resolved destinations, de-duplicated, order of first appearance.
    pub to: Vec<String>,
    pub raw: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_event_without_timestamp_gets_one() {
        let event: InboundMessage = serde_json::from_str(
            r#"{"message_id":"abc","sender":"a@x.example","recipients":["b@proxy.example"]}"#,
        )
        .unwrap();
        assert_eq!(event.message_id, "abc");
        assert_eq!(event.recipients, vec!["b@proxy.example"]);
        assert!(event.received_at <= Utc::now());
    }
}
