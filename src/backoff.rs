//! Randomized exponential backoff between send attempts.
//!
//! Uses "full jitter": attempt `n` waits a uniformly random duration in
//! `[1ms, min(ceiling, first * base^n)]`. The sequence never restarts; make a
//! fresh machine for every series of attempts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::debug;

use crate::config::BackoffConfig;

#[derive(Clone, Debug)]
pub struct BackoffMachine {
    first_ms: u64,
    ceiling_ms: u64,
    base: u64,
    attempts: u32,
    rng: StdRng,
}

impl BackoffMachine {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(config: &BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &BackoffConfig, rng: StdRng) -> Self {
        Self {
            first_ms: config.first_ms.max(1),
            ceiling_ms: config.ceiling_ms.max(1),
            base: u64::from(config.base),
            attempts: 0,
            rng,
        }
    }

    /// Number of durations handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Upper bound for the next duration, before jitter.
    pub fn current_ceiling(&self) -> Duration {
        Duration::from_millis(self.expected_max_ms())
    }

    fn expected_max_ms(&self) -> u64 {
        let factor = self.base.checked_pow(self.attempts).unwrap_or(u64::MAX);
        self.first_ms
            .saturating_mul(factor)
            .min(self.ceiling_ms)
            .max(1)
    }

    pub fn next_duration(&mut self) -> Duration {
        let max_ms = self.expected_max_ms();
        let ms = self.rng.gen_range(1..=max_ms);
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(ms)
    }

    /// Sleep for the next duration in the sequence.
    pub async fn wait(&mut self) {
        let duration = self.next_duration();
        debug!(
            attempt = self.attempts,
            wait_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "backing off"
        );
        tokio::time::sleep(duration).await;
    }
}

impl Iterator for BackoffMachine {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_duration())
    }
}
