use async_trait::async_trait;
use outbox_core::{
    Auth, DecayTimer, LocalId, MemoryOutbox, MessageTransport, OutboundMessage, OutboxConfig,
    OutboxStatus, OutboxStore, SendRequest, SendingEngine, SessionSlot, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// An API that is unreachable until switched online.
#[derive(Default)]
struct FlakyNetwork {
    online: AtomicBool,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<LocalId>>,
    realms: Mutex<Vec<String>>,
}

impl FlakyNetwork {
    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn delivered(&self) -> Vec<LocalId> {
        self.delivered.lock().unwrap().clone()
    }

    fn realms(&self) -> Vec<String> {
        self.realms.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for FlakyNetwork {
    async fn send_message(&self, auth: &Auth, request: &SendRequest) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.realms.lock().unwrap().push(auth.realm.to_string());
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Network("network unreachable".into()));
        }
        self.delivered.lock().unwrap().push(request.local_id);
        Ok(())
    }
}

fn auth() -> Auth {
    Auth::new(
        Url::parse("https://chat.example.com").unwrap(),
        "me@example.com",
        "api-key",
    )
}

fn msg(id: u64) -> OutboundMessage {
    OutboundMessage::private(LocalId(id), &["friend@example.com"], format!("note {id}"))
}

struct Client {
    outbox: Arc<MemoryOutbox>,
    sessions: Arc<SessionSlot>,
    network: Arc<FlakyNetwork>,
    engine: Arc<SendingEngine<MemoryOutbox, SessionSlot, FlakyNetwork>>,
}

fn client(outbox: MemoryOutbox, config: OutboxConfig) -> Client {
    let outbox = Arc::new(outbox);
    let sessions = Arc::new(SessionSlot::logged_in(auth()));
    let network = Arc::new(FlakyNetwork::default());
    let engine = Arc::new(SendingEngine::new(
        Arc::clone(&outbox),
        Arc::clone(&sessions),
        Arc::clone(&network),
        config,
    ));
    Arc::clone(&engine).drive(outbox.subscribe());
    Client {
        outbox,
        sessions,
        network,
        engine,
    }
}

async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn full_offline_to_online_flow() {
    let c = client(MemoryOutbox::default(), OutboxConfig::default());

    // 1. Offline: the message is attempted and stays queued with the failure
    c.outbox.enqueue(msg(1));
    sleep_secs(1).await;

    assert!(c.network.attempts() >= 1);
    let message = c.outbox.get(LocalId(1)).unwrap();
    assert!(message.is_sendable());
    assert_eq!(
        message.status.failure().map(|f| f.text.clone()).as_deref(),
        Some("network error: network unreachable")
    );
    assert!(c.engine.is_running(), "engine should keep retrying");

    // 2. Online: the next retry goes through
    c.network.set_online(true);
    sleep_secs(15).await;

    assert_eq!(c.network.delivered(), vec![LocalId(1)]);
    assert_eq!(c.outbox.get(LocalId(1)).unwrap().status, OutboxStatus::Sent);
    assert!(!c.engine.is_running());

    // 3. Fresh initial fetch: sent copies are dropped
    assert_eq!(c.outbox.drop_sent(), vec![LocalId(1)]);
    assert!(c.outbox.is_empty());

    // 4. Later messages go straight out
    c.outbox.enqueue(msg(2));
    sleep_secs(1).await;
    assert_eq!(c.network.delivered(), vec![LocalId(1), LocalId(2)]);
}

#[tokio::test(start_paused = true)]
async fn stuck_message_decays_and_is_no_longer_retried() {
    let config = OutboxConfig {
        decay_time_ms: 60_000,
        ..OutboxConfig::default()
    };
    let c = client(MemoryOutbox::default(), config.clone());
    let decay = Arc::new(DecayTimer::new(Arc::clone(&c.outbox), config.decay_time()));
    let _watcher = decay.watch(c.outbox.subscribe());

    c.outbox.enqueue(msg(1));
    sleep_secs(61).await;

    let OutboxStatus::Age { previous } = c.outbox.get(LocalId(1)).unwrap().status else {
        panic!("message should have decayed");
    };
    assert!(previous.is_sendable());
    assert!(previous.failure().is_some());

    // The engine notices on its next wake-up and stops.
    sleep_secs(15).await;
    assert!(!c.engine.is_running());
    let attempts = c.network.attempts();
    c.network.set_online(true);
    sleep_secs(60).await;
    assert_eq!(c.network.attempts(), attempts);
    assert!(c.network.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn logout_clears_outbox_and_stops_sending() {
    let c = client(MemoryOutbox::default(), OutboxConfig::default());
    c.outbox.enqueue(msg(1));
    sleep_secs(1).await;
    assert!(c.engine.is_running());

    c.sessions.logout();
    c.outbox.clear();
    sleep_secs(15).await;
    assert!(!c.engine.is_running());
    let attempts = c.network.attempts();

    c.network.set_online(true);
    c.sessions.login(auth());
    c.outbox.enqueue(msg(2));
    sleep_secs(1).await;

    assert_eq!(c.network.delivered(), vec![LocalId(2)]);
    assert_eq!(c.network.attempts(), attempts + 1);
}

#[tokio::test(start_paused = true)]
async fn account_switch_during_retry_sends_nothing_as_new_account() {
    let c = client(MemoryOutbox::default(), OutboxConfig::default());
    c.outbox.enqueue(msg(1));
    sleep_secs(1).await;
    assert!(c.engine.is_running());
    let before = c.network.attempts();
    assert!(before >= 1);

    c.network.set_online(true);
    c.sessions.login(Auth::new(
        Url::parse("https://other.example.com").unwrap(),
        "someone@example.com",
        "other-key",
    ));
    sleep_secs(30).await;

    assert!(!c.engine.is_running());
    assert_eq!(c.network.attempts(), before);
    assert!(c.network.delivered().is_empty());
    assert!(c
        .network
        .realms()
        .iter()
        .all(|realm| realm == "https://chat.example.com/"));
    assert!(c.outbox.get(LocalId(1)).unwrap().is_sendable());
}

#[tokio::test(start_paused = true)]
async fn burst_larger_than_event_buffer_is_still_sent() {
    let c = client(MemoryOutbox::new(2), OutboxConfig::default());
    c.network.set_online(true);

    for id in 1..=10 {
        c.outbox.enqueue(msg(id));
    }
    sleep_secs(1).await;

    let expected: Vec<LocalId> = (1..=10).map(LocalId).collect();
    assert_eq!(c.network.delivered(), expected);
    assert!(c.outbox.messages().iter().all(|m| m.status == OutboxStatus::Sent));
}
