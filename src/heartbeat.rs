//! Heartbeat: perform callbacks at regular intervals.
//!
//! While active, calls the callback at least once per interval. While
//! inactive, does nothing. Used for presence reporting, where the server is
//! lenient about timing but must neither be flooded nor left without a
//! signal for too long.
//!
//! The heartbeat keeps three properties, with "interval" meaning the
//! configured duration plus scheduler slop:
//!
//! - α: while active, any window of one interval contains a callback;
//! - β: any window of one interval contains at most three callbacks;
//! - γ: while inactive, no callbacks are made, including from a timer armed
//!   before the heartbeat was stopped.
//!
//! [`HeartbeatCore`] is the state machine, free of timers, so the properties
//! can be checked against simulated time. [`Heartbeat`] drives it from a
//! tokio task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::config::OutboxConfig;

/// Shortest interval a heartbeat will run with; zero is raised to this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// Run the callback now, before returning from `start`.
    pub fire_now: bool,
    /// No repeating timer is armed; arm one with period `interval`.
    pub arm_timer: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    Fire,
    /// The heartbeat was stopped; the timer must cancel itself.
    Disarm,
}

#[derive(Clone, Debug)]
pub struct HeartbeatCore {
    interval: Duration,
    active: bool,
    timer_armed: bool,
    previous: Option<Instant>,
}

impl HeartbeatCore {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            active: false,
            timer_armed: false,
            previous: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer_armed
    }

    /// Idempotent. Fires immediately only if a full interval has passed
    /// since the last callback, so rapid stop/start toggling stays quiet.
    pub fn start(&mut self, now: Instant) -> StartOutcome {
        if self.active {
            return StartOutcome::default();
        }
        self.active = true;

        let fire_now = match self.previous {
            None => true,
            Some(previous) => now.saturating_duration_since(previous) >= self.interval,
        };
        if fire_now {
            self.previous = Some(now);
        }

        let arm_timer = !self.timer_armed;
        self.timer_armed = true;

        StartOutcome {
            fire_now,
            arm_timer,
        }
    }

    /// Idempotent. Leaves any armed timer alone; it disarms on its next tick.
    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn on_tick(&mut self, now: Instant) -> Tick {
        if !self.active {
            self.timer_armed = false;
            return Tick::Disarm;
        }
        self.previous = Some(now);
        Tick::Fire
    }

    /// The timer promised by `start` could not be armed.
    pub fn timer_lost(&mut self) {
        self.timer_armed = false;
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    core: Mutex<HeartbeatCore>,
    callback: Callback,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HeartbeatCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tokio-driven heartbeat.
///
/// The callback runs while the heartbeat's state lock is held, which is what
/// makes γ hold across threads; it must not call back into the heartbeat.
/// Must be started from within a tokio runtime.
pub struct Heartbeat {
    shared: Arc<Shared>,
}

impl Heartbeat {
    /// A zero `interval` is raised to [`MIN_INTERVAL`].
    pub fn new(interval: Duration, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(HeartbeatCore::new(interval)),
                callback: Box::new(callback),
            }),
        }
    }

    /// Heartbeat at the configured presence interval.
    pub fn from_config(config: &OutboxConfig, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self::new(config.heartbeat_interval(), callback)
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().is_active()
    }

    /// Start the heartbeat. Idempotent.
    pub fn start(&self) {
        let mut core = self.shared.lock();
        let outcome = core.start(Instant::now());
        if outcome.fire_now {
            (self.shared.callback)();
        }
        if outcome.arm_timer && !self.spawn_timer(core.interval()) {
            core.timer_lost();
        }
        trace!(fired = outcome.fire_now, armed = outcome.arm_timer, "heartbeat started");
    }

    /// Stop the heartbeat. Idempotent.
    pub fn stop(&self) {
        self.shared.lock().stop();
    }

    /// Set the current heartbeat state. Idempotent.
    pub fn to_state(&self, active: bool) {
        if active {
            self.start();
        } else {
            self.stop();
        }
    }

    fn spawn_timer(&self, period: Duration) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("heartbeat started outside a tokio runtime; no timer armed");
            return false;
        };
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let mut core = shared.lock();
                match core.on_tick(Instant::now()) {
                    Tick::Fire => (shared.callback)(),
                    Tick::Disarm => {
                        trace!("heartbeat timer disarmed");
                        break;
                    }
                }
            }
        });
        true
    }
}
