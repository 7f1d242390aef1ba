//! Outbox core for a chat client.
//!
//! Messages the user submits land in an outbox and are delivered by a
//! single-flight [`SendingEngine`]: one message at a time, in submission
//! order, retrying transient failures with jittered backoff and stopping as
//! soon as the session it started under goes away. A [`DecayTimer`] expires
//! messages that stayed unsent for too long, and [`Heartbeat`] provides the
//! restartable periodic callback used for presence reporting.
//!
//! The host supplies the API call ([`MessageTransport`]) and the login state
//! ([`SessionProvider`]); [`MemoryOutbox`] is a ready-made store.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod auth;
pub mod backoff;
pub mod config;
pub mod decay;
pub mod engine;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod logging;
pub mod model;
pub mod outbox;
pub mod transport;

pub use auth::{AuthChecker, SessionProvider, SessionSlot};
pub use backoff::BackoffMachine;
pub use config::{BackoffConfig, OutboxConfig};
pub use decay::DecayTimer;
pub use engine::{EngineMetricsSnapshot, RunSummary, SendingEngine, StopReason};
pub use error::{FailureCategory, OutboxError, TransportError};
pub use event::OutboxEvent;
pub use heartbeat::Heartbeat;
pub use model::{
    Auth, LocalId, MessageType, OutboundMessage, OutboxStatus, Recipients, SendFailure, UnixTimeMs,
};
pub use outbox::{MemoryOutbox, OutboxStore};
pub use transport::{MessageTransport, SendRequest};
