use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::model::{Auth, LocalId, MessageType, OutboundMessage};

/// Body of the API's send-message call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub to: String,
    pub subject: String,
    pub content: String,
    pub local_id: LocalId,
    #[serde(rename = "queue_id", skip_serializing_if = "Option::is_none")]
    pub event_queue_id: Option<String>,
}

impl SendRequest {
    /// `to` is taken precomputed so a series of attempts reuses one value.
    pub fn for_message(message: &OutboundMessage, to: String, event_queue_id: Option<String>) -> Self {
        Self {
            message_type: message.message_type(),
            to,
            subject: message.subject.clone(),
            content: message.content.clone(),
            local_id: message.id,
            event_queue_id,
        }
    }
}

/// The API layer's send-message call.
///
/// Implementations report protocol failures as [`TransportError::Api`],
/// connection trouble as `Network`/`Timeout`, and anything else as
/// `Unexpected`.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_message(&self, auth: &Auth, request: &SendRequest) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_stream_message() {
        let message = OutboundMessage::stream(LocalId(1_517_975_087), "general", "lunch", "tacos?");
        let request = SendRequest::for_message(&message, message.destination(), Some("q:1".into()));

        assert_eq!(request.message_type, MessageType::Stream);
        assert_eq!(request.message_type.as_str(), "stream");
        assert_eq!(request.to, r#"["general"]"#);
        assert_eq!(request.subject, "lunch");
        assert_eq!(request.local_id, LocalId(1_517_975_087));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "stream");
        assert_eq!(json["queue_id"], "q:1");
        assert_eq!(json["local_id"], 1_517_975_087u64);
    }

    #[test]
    fn test_request_without_queue_omits_field() {
        let message = OutboundMessage::private(LocalId(2), &["a@example.com"], "hi");
        let request = SendRequest::for_message(&message, message.destination(), None);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "private");
        assert_eq!(json["to"], "a@example.com");
        assert!(json.get("queue_id").is_none());
    }
}
