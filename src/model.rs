use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Client-assigned message identifier.
///
/// Assigned from the submission timestamp, so ids increase with submission
/// order and are unique within one session's outbox. The server echoes it
/// back as `local_id` once the message lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds from `self` until `later`, zero if `later` is not later.
    pub fn millis_until(self, later: UnixTimeMs) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Private,
    Stream,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Private => "private",
            MessageType::Stream => "stream",
        }
    }
}

/// Who a message is addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipients {
    /// One-to-one or group private message.
    Private { emails: Vec<String> },
    /// Channel message.
    Stream { stream: String },
}

/// Details of a failed delivery attempt, as reported by the API layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFailure {
    pub http_status: Option<u16>,
    pub api_code: Option<String>,
    pub text: String,
}

impl SendFailure {
    pub fn new(http_status: Option<u16>, api_code: Option<String>, text: impl Into<String>) -> Self {
        Self {
            http_status,
            api_code,
            text: text.into(),
        }
    }
}

/// Delivery status of an outbox message.
///
/// `Enqueued` is the only sendable status. Every other status is terminal:
/// once reached, the outbox refuses to move the message anywhere else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be sent; `failure` records the last retryable failure.
    Enqueued { failure: Option<SendFailure> },
    /// Accepted by the server; waiting for the store to drop it.
    Sent,
    /// Rejected by the server as a bad request. Never retried.
    ClientError { failure: SendFailure },
    /// Failed for a reason outside the API protocol. Never retried.
    Misc { message: String },
    /// Stayed unsent for too long.
    Age { previous: Box<OutboxStatus> },
}

impl OutboxStatus {
    pub const fn queued() -> Self {
        OutboxStatus::Enqueued { failure: None }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            OutboxStatus::Enqueued { failure: None } => "queued",
            OutboxStatus::Enqueued { failure: Some(_) } => "failed_retryable",
            OutboxStatus::Sent => "sent",
            OutboxStatus::ClientError { .. } => "client_error",
            OutboxStatus::Misc { .. } => "misc",
            OutboxStatus::Age { .. } => "age",
        }
    }

    pub const fn is_sendable(&self) -> bool {
        matches!(self, OutboxStatus::Enqueued { .. })
    }

    pub const fn is_terminal(&self) -> bool {
        match self {
            OutboxStatus::Enqueued { .. } => false,
            OutboxStatus::Sent
            | OutboxStatus::ClientError { .. }
            | OutboxStatus::Misc { .. }
            | OutboxStatus::Age { .. } => true,
        }
    }

    pub fn failure(&self) -> Option<&SendFailure> {
        match self {
            OutboxStatus::Enqueued { failure } => failure.as_ref(),
            OutboxStatus::ClientError { failure } => Some(failure),
            OutboxStatus::Sent | OutboxStatus::Misc { .. } | OutboxStatus::Age { .. } => None,
        }
    }
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::queued()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: LocalId,
    pub recipients: Recipients,
    pub subject: String,
    pub content: String,
    pub created_at: UnixTimeMs,
    pub status: OutboxStatus,
}

impl OutboundMessage {
    pub fn new(
        id: LocalId,
        recipients: Recipients,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            recipients,
            subject: subject.into(),
            content: content.into(),
            created_at: UnixTimeMs::now(),
            status: OutboxStatus::queued(),
        }
    }

    pub fn private(id: LocalId, emails: &[&str], content: impl Into<String>) -> Self {
        let emails = emails.iter().map(|e| (*e).to_string()).collect();
        Self::new(id, Recipients::Private { emails }, "", content)
    }

    pub fn stream(
        id: LocalId,
        stream: impl Into<String>,
        topic: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Recipients::Stream {
                stream: stream.into(),
            },
            topic,
            content,
        )
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: UnixTimeMs) -> Self {
        self.created_at = created_at;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: OutboxStatus) -> Self {
        self.status = status;
        self
    }

    pub fn message_type(&self) -> MessageType {
        match self.recipients {
            Recipients::Private { .. } => MessageType::Private,
            Recipients::Stream { .. } => MessageType::Stream,
        }
    }

    /// The `to` argument of the send request.
    ///
    /// The server tries to read this as JSON, then CSV, then a literal, so
    /// stream names always go out as a JSON array.
    pub fn destination(&self) -> String {
        match &self.recipients {
            Recipients::Private { emails } => emails.join(","),
            Recipients::Stream { stream } => {
                serde_json::Value::from(vec![stream.clone()]).to_string()
            }
        }
    }

    pub fn is_sendable(&self) -> bool {
        self.status.is_sendable()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// Message bodies are user content; keep them out of logs.
impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("id", &self.id)
            .field("type", &self.message_type())
            .field("subject_len", &self.subject.len())
            .field("content_len", &self.content.len())
            .field("created_at", &self.created_at)
            .field("status", &self.status.name())
            .finish()
    }
}

/// A logged-in session.
///
/// Identity is realm plus email; the api key is a credential, not part of
/// the identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub realm: Url,
    pub email: String,
    pub api_key: String,
}

impl Auth {
    pub fn new(realm: Url, email: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            realm,
            email: email.into(),
            api_key: api_key.into(),
        }
    }

    pub fn same_identity(&self, other: &Auth) -> bool {
        self.realm == other.realm && self.email == other.email
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("realm", &self.realm.as_str())
            .field("email", &self.email)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_private_destination_joins_emails() {
        let msg = OutboundMessage::private(LocalId(1), &["a@example.com", "b@example.com"], "hi");
        assert_eq!(msg.message_type(), MessageType::Private);
        assert_eq!(msg.destination(), "a@example.com,b@example.com");
    }

    #[test]
    fn test_stream_destination_is_json_array() {
        let msg = OutboundMessage::stream(LocalId(1), "general, misc", "greetings", "hi");
        assert_eq!(msg.message_type(), MessageType::Stream);
        assert_eq!(msg.destination(), r#"["general, misc"]"#);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!OutboxStatus::queued().is_terminal());
        assert!(OutboxStatus::queued().is_sendable());

        let retryable = OutboxStatus::Enqueued {
            failure: Some(SendFailure::new(Some(502), None, "bad gateway")),
        };
        assert!(retryable.is_sendable());
        assert_eq!(retryable.name(), "failed_retryable");

        for status in [
            OutboxStatus::Sent,
            OutboxStatus::ClientError {
                failure: SendFailure::new(Some(400), Some("BAD_REQUEST".into()), "nope"),
            },
            OutboxStatus::Misc {
                message: "boom".into(),
            },
            OutboxStatus::Age {
                previous: Box::new(OutboxStatus::queued()),
            },
        ] {
            assert!(status.is_terminal(), "{} should be terminal", status.name());
            assert!(!status.is_sendable());
        }
    }

    #[test]
    fn test_status_serializes_with_subtype_tag() {
        let json = serde_json::to_value(OutboxStatus::Misc {
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["subtype"], "misc");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn test_auth_identity_ignores_api_key() {
        let a = Auth::new(realm("https://chat.example.com"), "me@example.com", "key-1");
        let b = Auth::new(realm("https://chat.example.com"), "me@example.com", "key-2");
        let c = Auth::new(realm("https://other.example.com"), "me@example.com", "key-1");
        let d = Auth::new(realm("https://chat.example.com"), "you@example.com", "key-1");

        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
        assert!(!a.same_identity(&d));
    }

    #[test]
    fn test_debug_redacts_secrets_and_content() {
        let auth = Auth::new(realm("https://chat.example.com"), "me@example.com", "hunter2");
        assert!(!format!("{auth:?}").contains("hunter2"));

        let msg = OutboundMessage::stream(LocalId(7), "general", "topic", "secret plans");
        assert!(!format!("{msg:?}").contains("secret plans"));
    }

    #[test]
    fn test_millis_until_saturates() {
        let early = UnixTimeMs(1_000);
        let late = UnixTimeMs(4_500);
        assert_eq!(early.millis_until(late), 3_500);
        assert_eq!(late.millis_until(early), 0);
    }
}
