//! Multi-endpoint failover with a time-boxed blacklist.
//!
//! Only consulted for rotation when a session has more than one endpoint.
//! With a single endpoint the registry still tracks its blacklist so status
//! output stays truthful, but selection always returns that endpoint.

use std::time::Duration;

use outpost_sdk::client::Endpoint;
use tokio::time::Instant;

/// Result of picking the next endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub endpoint: Endpoint,
    /// Set when every endpoint is blacklisted: time until the chosen one
    /// expires. Its blacklist is not cleared early.
    pub wait: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FailoverRegistry {
    endpoints: Vec<Endpoint>,
    blacklisted_until: Vec<Option<Instant>>,
    current: usize,
    cooldown: Duration,
}

impl FailoverRegistry {
    /// `None` when `endpoints` is empty.
    pub fn new(endpoints: Vec<Endpoint>, cooldown: Duration) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        let blacklisted_until = vec![None; endpoints.len()];
        Some(Self {
            endpoints,
            blacklisted_until,
            current: 0,
            cooldown,
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// True when rotation applies.
    pub fn is_multi(&self) -> bool {
        self.endpoints.len() > 1
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_blacklisted(&self, index: usize, now: Instant) -> bool {
        matches!(self.blacklisted_until.get(index), Some(Some(until)) if *until > now)
    }

    /// Blacklist the endpoint that was just tried. Returns the expiry.
    pub fn blacklist_current(&mut self, now: Instant) -> Instant {
        let until = now + self.cooldown;
        self.blacklisted_until[self.current] = Some(until);
        until
    }

    /// Forget the blacklist entry of the current endpoint (after a login).
    /// Returns true when there was one.
    pub fn clear_current(&mut self) -> bool {
        self.blacklisted_until[self.current].take().is_some()
    }

    /// Endpoints still blacklisted at `now`, with their expiry.
    pub fn blacklisted(&self, now: Instant) -> Vec<(&Endpoint, Instant)> {
        self.endpoints
            .iter()
            .zip(&self.blacklisted_until)
            .filter_map(|(ep, until)| match until {
                Some(until) if *until > now => Some((ep, *until)),
                _ => None,
            })
            .collect()
    }

    /// Endpoint to use for a fresh connect: the current one unless it is
    /// blacklisted, in which case rotate.
    pub fn target(&mut self, now: Instant) -> Selection {
        if self.is_multi() && self.is_blacklisted(self.current, now) {
            return self.select_next(now);
        }
        Selection {
            index: self.current,
            endpoint: self.current().clone(),
            wait: self.remaining(self.current, now),
        }
    }

    /// Round-robin scan starting after the current endpoint. Expired
    /// blacklist entries met along the way are purged.
    pub fn select_next(&mut self, now: Instant) -> Selection {
        let n = self.endpoints.len();
        if n == 1 {
            return Selection {
                index: 0,
                endpoint: self.endpoints[0].clone(),
                wait: self.remaining(0, now),
            };
        }

        for step in 1..=n {
            let idx = (self.current + step) % n;
            match self.blacklisted_until[idx] {
                Some(until) if until > now => continue,
                Some(_) => {
                    self.blacklisted_until[idx] = None;
                }
                None => {}
            }
            self.current = idx;
            return Selection {
                index: idx,
                endpoint: self.endpoints[idx].clone(),
                wait: None,
            };
        }

        // Everything blacklisted: take the soonest to expire.
        let idx = self
            .blacklisted_until
            .iter()
            .enumerate()
            .min_by_key(|(_, until)| until.unwrap_or(now))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.current = idx;
        Selection {
            index: idx,
            endpoint: self.endpoints[idx].clone(),
            wait: self.remaining(idx, now),
        }
    }

    fn remaining(&self, index: usize, now: Instant) -> Option<Duration> {
        match self.blacklisted_until[index] {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }
}
