//! Session state record and its transition function.
//!
//! [`SessionState::apply`] is the only place counters, status and the
//! failover registry change. It returns the side effects the actor must
//! perform; it never touches the transport or the clock itself.

use std::time::Duration;

use outpost_sdk::client::Endpoint;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::DisconnectCause;
use crate::failover::FailoverRegistry;
use crate::policy::{DelayClass, FailureHistory, ReconnectDecision, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Offline,
    Connecting,
    Online,
    /// Terminal until an explicit connect.
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Offline => "OFFLINE",
            Status::Connecting => "CONNECTING",
            Status::Online => "ONLINE",
            Status::Stopped => "STOPPED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconnectContext {
    #[default]
    None,
    DuplicateLogin,
}

/// Per-session knobs on top of the shared [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub reconnect: ReconnectPolicy,
    /// Schedule reconnects automatically after a disconnect.
    pub auto_reconnect: bool,
    /// `Some(delay)`: retry once after a duplicate login. `None`: stop.
    pub duplicate_login_retry: Option<Duration>,
    /// A connection that has not logged in after this long is dropped.
    pub login_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
            duplicate_login_retry: None,
            login_timeout: Duration::from_secs(60),
        }
    }
}

/// Disconnect reason recorded when a connection never logs in.
pub const LOGIN_TIMED_OUT: &str = "login timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Operator or scheduler asked to connect.
    Connect,
    /// Operator asked to disconnect. Always ends in STOPPED.
    Disconnect,
    /// The pending reconnect timer elapsed.
    ReconnectTimerFired,
    /// Login or spawn seen on connection `generation`.
    LoggedIn { generation: u64 },
    /// Connection `generation` failed to open or went away.
    Dropped { generation: u64, reason: String },
    /// Connection `generation` did not log in within the login timeout.
    LoginTimedOut { generation: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { endpoint: Endpoint, generation: u64 },
    CloseTransport { reason: String },
    ArmReconnect(ReconnectDecision),
    CancelReconnect,
    StartBackground,
    StopBackground,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub tag: String,
    pub status: Status,
    pub history: FailureHistory,
    pub last_login: Option<Instant>,
    pub context: ReconnectContext,
    pub registry: FailoverRegistry,
    /// Mirrors the actor's timer slot. At most one timer is ever armed.
    pub reconnect_pending: bool,
    /// Bumped for every connection opened and on manual disconnect.
    pub generation: u64,
    pub last_disconnect: Option<(DisconnectCause, String)>,
}

impl SessionState {
    pub fn new(tag: impl Into<String>, registry: FailoverRegistry) -> Self {
        Self {
            tag: tag.into(),
            status: Status::Offline,
            history: FailureHistory::default(),
            last_login: None,
            context: ReconnectContext::None,
            registry,
            reconnect_pending: false,
            generation: 0,
            last_disconnect: None,
        }
    }

    pub fn apply(&mut self, input: Input, now: Instant, policy: &SessionPolicy) -> Vec<Effect> {
        match input {
            Input::Connect => self.connect(now),
            Input::ReconnectTimerFired => {
                self.reconnect_pending = false;
                if self.status != Status::Offline {
                    tracing::debug!(bot = %self.tag, status = %self.status, "Reconnect timer fired, ignoring");
                    return Vec::new();
                }
                self.connect(now)
            }
            Input::Disconnect => self.manual_disconnect(),
            Input::LoggedIn { generation } => self.logged_in(generation, now),
            Input::Dropped { generation, reason } => self.dropped(generation, reason, now, policy),
            Input::LoginTimedOut { generation } => {
                if generation != self.generation || self.status != Status::Connecting {
                    return Vec::new();
                }
                tracing::warn!(
                    bot = %self.tag,
                    timeout_secs = policy.login_timeout.as_secs(),
                    "No login in time"
                );
                self.dropped(generation, LOGIN_TIMED_OUT.to_string(), now, policy)
            }
        }
    }

    fn connect(&mut self, now: Instant) -> Vec<Effect> {
        if matches!(self.status, Status::Connecting | Status::Online) {
            tracing::warn!(bot = %self.tag, status = %self.status, "Already connecting or online");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
        self.context = ReconnectContext::None;
        self.status = Status::Connecting;
        self.generation += 1;

        let selection = self.registry.target(now);
        if let Some(wait) = selection.wait {
            tracing::warn!(
                bot = %self.tag,
                endpoint = %selection.endpoint,
                wait_secs = wait.as_secs(),
                "All endpoints blacklisted, trying the soonest to expire"
            );
        }
        tracing::info!(bot = %self.tag, endpoint = %selection.endpoint, "Connecting");
        effects.push(Effect::OpenTransport {
            endpoint: selection.endpoint,
            generation: self.generation,
        });
        effects
    }

    fn manual_disconnect(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::StopBackground];
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
        if self.status != Status::Stopped {
            tracing::info!(bot = %self.tag, "Stopped by operator");
        }
        self.status = Status::Stopped;
        // Late events from the closed connection must not count.
        self.generation += 1;
        effects.push(Effect::CloseTransport {
            reason: "manual disconnect".to_string(),
        });
        effects
    }

    fn logged_in(&mut self, generation: u64, now: Instant) -> Vec<Effect> {
        if generation != self.generation || self.status != Status::Connecting {
            return Vec::new();
        }
        self.status = Status::Online;
        self.last_login = Some(now);
        self.history.consecutive_fails = 0;
        self.context = ReconnectContext::None;
        if self.registry.clear_current() {
            tracing::info!(bot = %self.tag, endpoint = %self.registry.current(), "Endpoint removed from blacklist");
        }
        tracing::info!(bot = %self.tag, endpoint = %self.registry.current(), "Online");
        vec![Effect::StartBackground]
    }

    fn dropped(
        &mut self,
        generation: u64,
        reason: String,
        now: Instant,
        policy: &SessionPolicy,
    ) -> Vec<Effect> {
        // Covers both stale connections and a second disconnect-class event
        // for a connection that was already handled.
        if generation != self.generation
            || !matches!(self.status, Status::Connecting | Status::Online)
        {
            tracing::debug!(bot = %self.tag, generation, %reason, "Ignoring stale disconnect");
            return Vec::new();
        }

        let prior = self.status;
        let cause = DisconnectCause::classify(&reason);
        self.last_disconnect = Some((cause, reason.clone()));
        let mut effects = vec![
            Effect::StopBackground,
            Effect::CloseTransport {
                reason: reason.clone(),
            },
        ];

        match cause {
            DisconnectCause::Authentication => {
                tracing::error!(bot = %self.tag, %reason, "Authentication failed, not retrying");
                self.stop(&mut effects);
                return effects;
            }
            DisconnectCause::DuplicateLogin => {
                self.context = ReconnectContext::DuplicateLogin;
                match policy.duplicate_login_retry {
                    Some(delay) if policy.auto_reconnect => {
                        tracing::warn!(
                            bot = %self.tag,
                            delay_mins = delay.as_secs() / 60,
                            "Duplicate login, retrying later"
                        );
                        self.status = Status::Offline;
                        self.arm(
                            ReconnectDecision {
                                delay,
                                class: DelayClass::DuplicateLogin,
                            },
                            &mut effects,
                        );
                    }
                    _ => {
                        tracing::error!(bot = %self.tag, "Duplicate login, stopping");
                        self.stop(&mut effects);
                    }
                }
                return effects;
            }
            DisconnectCause::Network | DisconnectCause::Generic => {}
        }

        self.status = Status::Offline;
        if prior == Status::Online {
            let quick = policy
                .reconnect
                .record_online_disconnect(&mut self.history, self.last_login, now);
            if quick {
                tracing::warn!(
                    bot = %self.tag,
                    count = self.history.quick_disconnects,
                    "Quick disconnect"
                );
            }
        } else {
            self.history.consecutive_fails += 1;
            tracing::warn!(
                bot = %self.tag,
                fails = self.history.consecutive_fails,
                %reason,
                "Connection failed"
            );
            if self.registry.is_multi() {
                let failed = self.registry.current().clone();
                self.registry.blacklist_current(now);
                let next = self.registry.select_next(now);
                tracing::warn!(
                    bot = %self.tag,
                    %failed,
                    next = %next.endpoint,
                    cooldown_secs = self.registry.cooldown().as_secs(),
                    "Endpoint blacklisted"
                );
            }
        }

        if !policy.auto_reconnect {
            tracing::info!(bot = %self.tag, %reason, "Offline, automatic reconnect disabled");
            return effects;
        }
        if self.reconnect_pending {
            return effects;
        }
        let decision = policy
            .reconnect
            .evaluate(&mut self.history, cause.is_network(), now);
        self.arm(decision, &mut effects);
        effects
    }

    fn arm(&mut self, decision: ReconnectDecision, effects: &mut Vec<Effect>) {
        if self.reconnect_pending {
            return;
        }
        tracing::info!(
            bot = %self.tag,
            delay_secs = decision.delay.as_secs(),
            class = ?decision.class,
            "Reconnect scheduled"
        );
        self.reconnect_pending = true;
        effects.push(Effect::ArmReconnect(decision));
    }

    fn stop(&mut self, effects: &mut Vec<Effect>) {
        self.status = Status::Stopped;
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
    }
}
