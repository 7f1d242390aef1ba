//! Single-flight sending engine.
//!
//! Delivers queued outbox messages one at a time, in submission order,
//! retrying transient failures with backoff. At most one run is active per
//! engine; starting another while one is active only asks the active run to
//! take another look at the outbox before it finishes.

use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{AuthChecker, SessionProvider};
use crate::backoff::BackoffMachine;
use crate::config::OutboxConfig;
use crate::error::{FailureCategory, OutboxError, TransportError};
use crate::event::OutboxEvent;
use crate::model::{Auth, LocalId, OutboundMessage, OutboxStatus, SendFailure};
use crate::outbox::OutboxStore;
use crate::transport::{MessageTransport, SendRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nobody is logged in.
    NoSession,
    /// Nothing left to send.
    Idle,
    /// The session a send series started under went away.
    SessionChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Send series started, one per message selected.
    pub messages: usize,
    pub attempts: u32,
    pub stop: StopReason,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            messages: 0,
            attempts: 0,
            stop: StopReason::Idle,
        }
    }
}

/// How one message's send series ended.
enum SeriesEnd {
    /// The message is no longer sendable; move on to the next one.
    Done,
    NoSession,
    SessionChanged,
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub runs: AtomicU64,
    pub skipped_runs: AtomicU64,
    pub attempts: AtomicU64,
    pub sent: AtomicU64,
    pub retryable_failures: AtomicU64,
    pub terminal_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            skipped_runs: self.skipped_runs.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub runs: u64,
    pub skipped_runs: u64,
    pub attempts: u64,
    pub sent: u64,
    pub retryable_failures: u64,
    pub terminal_failures: u64,
}

/// Holds the run flag; releases it on drop, panics included.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SendingEngine<S: ?Sized, P: ?Sized, T: ?Sized> {
    store: Arc<S>,
    sessions: Arc<P>,
    transport: Arc<T>,
    config: OutboxConfig,
    running: AtomicBool,
    rerun_requested: AtomicBool,
    metrics: EngineMetrics,
}

impl<S, P, T> SendingEngine<S, P, T>
where
    S: OutboxStore + ?Sized + 'static,
    P: SessionProvider + ?Sized + 'static,
    T: MessageTransport + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, sessions: Arc<P>, transport: Arc<T>, config: OutboxConfig) -> Self {
        Self {
            store,
            sessions,
            transport,
            config,
            running: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            metrics: EngineMetrics::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Spawn a run. Safe to call whenever the outbox may have changed; a
    /// redundant call costs one flag check.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Option<RunSummary>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }

    /// Start a run whenever the outbox reports a change that may have left a
    /// message ready to send. Ends when the outbox's event channel closes.
    pub fn drive(self: Arc<Self>, mut events: broadcast::Receiver<OutboxEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.may_unblock_sending() => {
                        self.start();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outbox events lagged; starting sending engine");
                        self.start();
                    }
                    Err(RecvError::Closed) => {
                        debug!("outbox event channel closed; sending engine driver exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Send everything sendable, then return.
    ///
    /// Returns `None` without doing anything if a run is already active. The
    /// active run then makes one more pass over the outbox before finishing,
    /// so no request to send is lost, unless that run ends because the
    /// session went away.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Option<RunSummary> {
        self.rerun_requested.store(true, Ordering::SeqCst);
        let Some(mut guard) = RunGuard::acquire(&self.running) else {
            self.metrics.skipped_runs.fetch_add(1, Ordering::Relaxed);
            debug!("sending engine already running");
            return None;
        };
        self.metrics.runs.fetch_add(1, Ordering::Relaxed);

        let mut summary = RunSummary::default();
        loop {
            while self.rerun_requested.swap(false, Ordering::SeqCst) {
                let stop = self.process_queue(&mut summary).await;
                summary.stop = stop;
                if stop != StopReason::Idle {
                    // Without the session the run started under, nothing
                    // more is sent until someone starts a fresh run.
                    self.rerun_requested.store(false, Ordering::SeqCst);
                    break;
                }
            }
            drop(guard);

            // A request that arrived after the last pass but before the flag
            // dropped would otherwise be lost.
            if summary.stop != StopReason::Idle || !self.rerun_requested.load(Ordering::SeqCst) {
                break;
            }
            match RunGuard::acquire(&self.running) {
                Some(reacquired) => guard = reacquired,
                None => break,
            }
        }

        info!(
            messages = summary.messages,
            attempts = summary.attempts,
            stop = ?summary.stop,
            "sending engine finished"
        );
        Some(summary)
    }

    async fn process_queue(&self, summary: &mut RunSummary) -> StopReason {
        loop {
            if self.sessions.active_session().is_none() {
                return StopReason::NoSession;
            }
            let Some(message) = self.store.first_sendable() else {
                return StopReason::Idle;
            };
            summary.messages += 1;

            match self.send_series(&message, &mut summary.attempts).await {
                SeriesEnd::Done => {}
                SeriesEnd::NoSession => return StopReason::NoSession,
                SeriesEnd::SessionChanged => return StopReason::SessionChanged,
            }
        }
    }

    /// Attempt one message until it stops being sendable.
    #[instrument(
        skip(self, message, total_attempts),
        fields(local_id = %message.id, message_type = message.message_type().as_str())
    )]
    async fn send_series(&self, message: &OutboundMessage, total_attempts: &mut u32) -> SeriesEnd {
        let id = message.id;
        let to = message.destination();
        let Some(checker) = AuthChecker::new(self.sessions.as_ref()) else {
            return SeriesEnd::NoSession;
        };
        let mut backoff = BackoffMachine::new(&self.config.backoff);
        let mut attempts: u32 = 0;

        loop {
            if !checker.still_valid() {
                info!(%id, "session changed; sending engine stopping");
                return SeriesEnd::SessionChanged;
            }

            let request = SendRequest::for_message(message, to.clone(), self.sessions.event_queue_id());
            attempts = attempts.saturating_add(1);
            *total_attempts = total_attempts.saturating_add(1);
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            let result = self.attempt(checker.auth(), request).await;
            self.record_outcome(id, attempts, result);

            if !checker.still_valid() {
                info!(%id, "session changed during send; sending engine stopping");
                return SeriesEnd::SessionChanged;
            }
            if !self.store.is_sendable(id) {
                return SeriesEnd::Done;
            }

            if let Some(max_attempts) = self.config.max_attempts {
                if attempts >= max_attempts {
                    error!(%id, attempts, "giving up on outbox message");
                    self.metrics.terminal_failures.fetch_add(1, Ordering::Relaxed);
                    let status = OutboxStatus::Misc {
                        message: format!("gave up after {attempts} attempts"),
                    };
                    Self::note_refusal(id, self.store.update_status(id, status));
                    return SeriesEnd::Done;
                }
            }

            backoff.wait().await;
            if !self.store.is_sendable(id) {
                return SeriesEnd::Done;
            }
        }
    }

    /// One delivery attempt, on its own task so a panicking transport
    /// cannot take the engine down with it.
    async fn attempt(&self, auth: &Auth, request: SendRequest) -> Result<(), TransportError> {
        let transport = Arc::clone(&self.transport);
        let auth = auth.clone();
        let handle = tokio::spawn(async move { transport.send_message(&auth, &request).await });

        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                Err(TransportError::Unexpected(panic_message(&*payload)))
            }
            Err(_) => Err(TransportError::Unexpected("send attempt was cancelled".into())),
        }
    }

    fn record_outcome(&self, id: LocalId, attempt: u32, result: Result<(), TransportError>) {
        let err = match result {
            Ok(()) => {
                self.metrics.sent.fetch_add(1, Ordering::Relaxed);
                info!(%id, attempt, "outbox message sent");
                Self::note_refusal(id, self.store.mark_sent(id));
                return;
            }
            Err(err) => err,
        };

        let status = match err.category() {
            FailureCategory::Retryable => {
                self.metrics.retryable_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%id, attempt, error = %err, "send attempt failed; will retry");
                OutboxStatus::Enqueued {
                    failure: Some(SendFailure::from(&err)),
                }
            }
            FailureCategory::ClientError => {
                self.metrics.terminal_failures.fetch_add(1, Ordering::Relaxed);
                error!(%id, attempt, error = %err, "server rejected outbox message");
                OutboxStatus::ClientError {
                    failure: SendFailure::from(&err),
                }
            }
            FailureCategory::Unexpected => {
                self.metrics.terminal_failures.fetch_add(1, Ordering::Relaxed);
                error!(%id, attempt, error = %err, "unexpected failure sending outbox message");
                let message = match err {
                    TransportError::Unexpected(message) => message,
                    other => other.to_string(),
                };
                OutboxStatus::Misc { message }
            }
        };
        Self::note_refusal(id, self.store.update_status(id, status));
    }

    /// The message was deleted or reached a terminal status while we were
    /// sending it. The store has already logged the refusal.
    fn note_refusal(id: LocalId, result: Result<(), OutboxError>) {
        if let Err(err) = result {
            debug!(%id, error = %err, "outbox update refused");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    format!("send attempt panicked: {detail}")
}
