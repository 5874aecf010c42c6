//! Reactions to chat messages while a bot is online.
//!
//! - Teleport requests from whitelisted players are accepted after a short
//!   delay. Everyone else is ignored.
//! - The proxy's "already trying to connect" lock-up forces one reconnect
//!   per connection.
//! - The earning-cap notice queues a bank withdrawal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use outpost_sdk::event::Event;
use outpost_sdk::text::strip_formatting;
use regex::Regex;
use tokio::sync::broadcast::error::RecvError;

use crate::bank;
use crate::config::{BankConfig, ChatConfig, TeleportGrant};
use crate::error::ConfigError;
use crate::queue::TaskQueue;
use crate::session::{BackgroundTask, Session};

/// Disconnect reason recorded for a forced lock-up reconnect.
pub const LOCKUP_REASON: &str = "stuck connecting to a backend server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleportKind {
    /// The bot goes to the player.
    Tpa,
    /// The player comes to the bot.
    TpaHere,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    Teleport {
        player: String,
        kind: TeleportKind,
        allowed: bool,
    },
    ForceReconnect,
    WithdrawNow,
}

/// Compiled form of [`ChatConfig`].
#[derive(Debug, Clone)]
pub struct ChatRules {
    tpa: Regex,
    tpahere: Regex,
    whitelist: HashMap<String, TeleportGrant>,
    lockup_marker: String,
    earning_cap_marker: String,
    pub accept_command: String,
    pub accept_delay: Duration,
    pub earning_cap_delay: Duration,
}

fn pattern(name: &str, source: &str) -> Result<Regex, ConfigError> {
    Regex::new(source).map_err(|e| ConfigError::Invalid(format!("chat.{name}: {e}")))
}

impl ChatRules {
    pub fn compile(config: &ChatConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            tpa: pattern("tpa_pattern", &config.tpa_pattern)?,
            tpahere: pattern("tpahere_pattern", &config.tpahere_pattern)?,
            whitelist: config
                .whitelist
                .iter()
                .map(|(player, grant)| (player.to_lowercase(), *grant))
                .collect(),
            lockup_marker: config.lockup_marker.clone(),
            earning_cap_marker: config.earning_cap_marker.clone(),
            accept_command: config.accept_command.clone(),
            accept_delay: config.accept_delay(),
            earning_cap_delay: config.earning_cap_delay(),
        })
    }

    /// These rules with `grants` added to the whitelist. Entries in
    /// `grants` replace fleet-wide entries for the same player.
    pub fn with_grants<'a>(
        &self,
        grants: impl IntoIterator<Item = (&'a String, &'a TeleportGrant)>,
    ) -> Self {
        let mut rules = self.clone();
        for (player, grant) in grants {
            rules.whitelist.insert(player.to_lowercase(), *grant);
        }
        rules
    }

    fn allows(&self, player: &str, kind: TeleportKind) -> bool {
        self.whitelist
            .get(&player.to_lowercase())
            .is_some_and(|grant| match kind {
                TeleportKind::Tpa => grant.tpa,
                TeleportKind::TpaHere => grant.tpahere,
            })
    }

    pub fn classify(&self, raw: &str) -> Option<ChatAction> {
        let text = strip_formatting(raw);
        if !self.lockup_marker.is_empty() && text.contains(&self.lockup_marker) {
            return Some(ChatAction::ForceReconnect);
        }

        let request = [(&self.tpa, TeleportKind::Tpa), (&self.tpahere, TeleportKind::TpaHere)]
            .into_iter()
            .find_map(|(re, kind)| {
                let player = re.captures(&text)?.get(1)?.as_str().trim().to_string();
                Some((player, kind))
            });
        if let Some((player, kind)) = request {
            let allowed = self.allows(&player, kind);
            return Some(ChatAction::Teleport { player, kind, allowed });
        }

        if !self.earning_cap_marker.is_empty() && text.contains(&self.earning_cap_marker) {
            return Some(ChatAction::WithdrawNow);
        }
        None
    }
}

/// Background task that watches chat and acts on [`ChatRules`].
/// Withdrawals go through `bank_queue`.
pub fn watcher(rules: Arc<ChatRules>, bank_queue: TaskQueue, bank: Arc<BankConfig>) -> BackgroundTask {
    Arc::new(move |session: Session| {
        let rules = rules.clone();
        let bank_queue = bank_queue.clone();
        let bank = bank.clone();
        async move {
            let mut events = session.subscribe();
            let mut lockup_handled = false;
            loop {
                let text = match events.recv().await {
                    Ok(Event::Chat { text }) => text,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(bot = %session.tag(), missed, "Chat watcher lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                let Some(action) = rules.classify(&text) else {
                    continue;
                };
                match action {
                    ChatAction::Teleport { player, kind, allowed: true } => {
                        tracing::info!(bot = %session.tag(), %player, ?kind, "Accepting teleport request");
                        tokio::time::sleep(rules.accept_delay).await;
                        if let Err(e) = session.dispatch(&rules.accept_command).await {
                            tracing::warn!(bot = %session.tag(), error = %e, "Could not accept teleport");
                        }
                    }
                    ChatAction::Teleport { player, kind, allowed: false } => {
                        tracing::info!(bot = %session.tag(), %player, ?kind, "Ignoring teleport request");
                    }
                    ChatAction::ForceReconnect if !lockup_handled => {
                        lockup_handled = true;
                        tracing::warn!(bot = %session.tag(), "Connect lock-up, forcing a reconnect");
                        session.force_drop(LOCKUP_REASON).await;
                    }
                    ChatAction::ForceReconnect => {}
                    ChatAction::WithdrawNow => {
                        tracing::info!(bot = %session.tag(), "Earning cap reached, withdrawing");
                        tokio::time::sleep(rules.earning_cap_delay).await;
                        bank::schedule_withdraw_all(&session, &bank_queue, &bank);
                    }
                }
            }
        }
        .boxed()
    })
}
