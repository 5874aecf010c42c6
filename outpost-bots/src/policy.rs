//! Reconnect delay policy.
//!
//! A pure function of the failure history: given the counters kept by the
//! session and whether the last disconnect looked like a network fault, pick
//! the next delay and reset whichever counter the chosen rule consumes.
//!
//! Rules, first match wins:
//!
//! 1. too many attempts inside the sliding window → suspension delay,
//!    attempt log cleared
//! 2. too many quick disconnects → quick-disconnect cooldown, counter reset
//! 3. network fault after a quick disconnect → same cooldown, counter reset
//! 4. consecutive connect failures → backoff schedule
//! 5. otherwise → base delay
//!
//! Every evaluation records exactly one attempt timestamp.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Delay schedule used by rule 4 and 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// `min(base * 2^(fails-1), cap)`.
    Exponential { base: Duration, cap: Duration },
    /// Fixed steps; the last step repeats.
    Ladder(Vec<Duration>),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(15),
            cap: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    /// The aggressive 5s/10s/15s/30s/60s ladder.
    pub fn aggressive() -> Self {
        Backoff::Ladder(
            [5, 10, 15, 30, 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        )
    }

    pub fn base(&self) -> Duration {
        match self {
            Backoff::Exponential { base, .. } => *base,
            Backoff::Ladder(steps) => steps.first().copied().unwrap_or(FALLBACK_STEP),
        }
    }

    /// Delay after `fails` consecutive failures. `fails == 0` yields the base.
    pub fn delay_for(&self, fails: u32) -> Duration {
        if fails == 0 {
            return self.base();
        }
        match self {
            Backoff::Exponential { base, cap } => {
                let factor = 1u32 << (fails - 1).min(20);
                base.saturating_mul(factor).min(*cap)
            }
            Backoff::Ladder(steps) => {
                let idx = (fails as usize - 1).min(steps.len().saturating_sub(1));
                steps.get(idx).copied().unwrap_or(FALLBACK_STEP)
            }
        }
    }
}

const FALLBACK_STEP: Duration = Duration::from_secs(5);

/// Why a delay was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayClass {
    /// Too many attempts inside the sliding window.
    Suspension,
    /// Too many quick disconnects.
    QuickDisconnect,
    /// Network fault following a quick disconnect.
    NetworkCooldown,
    /// Backoff schedule after consecutive failures.
    Backoff,
    /// Plain disconnect, base delay.
    Standard,
    /// Long operator-configured delay after a duplicate login.
    DuplicateLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectDecision {
    pub delay: Duration,
    pub class: DelayClass,
}

/// Counters the policy reads and resets.
#[derive(Debug, Clone, Default)]
pub struct FailureHistory {
    pub consecutive_fails: u32,
    pub quick_disconnects: u32,
    /// Timestamps of scheduled reconnects, oldest first.
    pub attempts: VecDeque<Instant>,
}

impl FailureHistory {
    /// Drop attempts that fell out of the sliding window.
    pub fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.attempts.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    /// A disconnect this soon after login counts as quick.
    pub quick_window: Duration,
    pub quick_cooldown: Duration,
    pub max_quick_disconnects: u32,
    pub suspension: Duration,
    pub attempt_window: Duration,
    pub max_attempts: usize,
    /// Aggressive variant: a quick disconnect also counts as a failure.
    pub quick_counts_as_failure: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            quick_window: Duration::from_secs(60),
            quick_cooldown: Duration::from_secs(5 * 60),
            max_quick_disconnects: 3,
            suspension: Duration::from_secs(15 * 60),
            attempt_window: Duration::from_secs(30 * 60),
            max_attempts: 10,
            quick_counts_as_failure: false,
        }
    }
}

impl ReconnectPolicy {
    /// Pick the next delay. Records one attempt at `now`.
    pub fn evaluate(
        &self,
        history: &mut FailureHistory,
        network_error: bool,
        now: Instant,
    ) -> ReconnectDecision {
        history.prune(self.attempt_window, now);

        let decision = if history.attempts.len() >= self.max_attempts {
            history.attempts.clear();
            ReconnectDecision {
                delay: self.suspension,
                class: DelayClass::Suspension,
            }
        } else if history.quick_disconnects >= self.max_quick_disconnects {
            history.quick_disconnects = 0;
            ReconnectDecision {
                delay: self.quick_cooldown,
                class: DelayClass::QuickDisconnect,
            }
        } else if network_error && history.quick_disconnects > 0 {
            history.quick_disconnects = 0;
            ReconnectDecision {
                delay: self.quick_cooldown,
                class: DelayClass::NetworkCooldown,
            }
        } else if history.consecutive_fails > 0 {
            ReconnectDecision {
                delay: self.backoff.delay_for(history.consecutive_fails),
                class: DelayClass::Backoff,
            }
        } else {
            ReconnectDecision {
                delay: self.backoff.base(),
                class: DelayClass::Standard,
            }
        };

        history.attempts.push_back(now);
        decision
    }

    /// Update counters for a disconnect that happened while ONLINE.
    /// Returns true when it counted as a quick disconnect.
    pub fn record_online_disconnect(
        &self,
        history: &mut FailureHistory,
        last_login: Option<Instant>,
        now: Instant,
    ) -> bool {
        let since_login = last_login
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(self.quick_window);
        if since_login < self.quick_window {
            history.quick_disconnects += 1;
            if self.quick_counts_as_failure {
                history.consecutive_fails += 1;
            }
            true
        } else {
            history.quick_disconnects = 0;
            history.consecutive_fails = 0;
            false
        }
    }
}
