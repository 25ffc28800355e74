//! Capped exponential backoff for push channel reconnection.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters. `delay(n)` is `base * factor^n`, capped, then jittered
/// by up to `±jitter` of itself so that many workflows dropped at once do not
/// reconnect in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    /// Fraction in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_cap_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            factor: default_factor(),
            cap_ms: default_cap_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, cap: Duration, jitter: f64) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            factor,
            cap_ms: cap.as_millis() as u64,
            jitter,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_ms == 0 {
            anyhow::bail!("backoff.base_ms must be greater than zero");
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            anyhow::bail!("backoff.factor must be at least 1.0, got {}", self.factor);
        }
        if self.cap_ms < self.base_ms {
            anyhow::bail!("backoff.cap_ms must not be smaller than backoff.base_ms");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            anyhow::bail!("backoff.jitter must be within [0, 1], got {}", self.jitter);
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let raw = self.base_ms as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.cap_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Jittered delay before retry number `attempt`, never above the cap.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt).as_millis() as f64;
        // Policies built in code skip `validate`. `gen_range` panics on NaN.
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 || delay <= 0.0 {
            return Duration::from_millis(delay as u64);
        }
        let spread = delay * jitter;
        let jittered = rng.gen_range((delay - spread)..=(delay + spread));
        Duration::from_millis(jittered.clamp(0.0, self.cap_ms as f64) as u64)
    }
}

/// Attempt counter over a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .policy
            .jittered_delay(self.attempt, &mut rand::thread_rng());
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
