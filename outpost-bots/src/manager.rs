//! The fleet: every configured session plus its task queues.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use outpost_sdk::client::{Identity, Transport};

use crate::bank::{self, AutoWithdraw};
use crate::chat::{self, ChatRules};
use crate::config::{BankConfig, BotSpec, Config, WarpConfig};
use crate::failover::FailoverRegistry;
use crate::queue::{Task, TaskQueue};
use crate::session::{BackgroundTask, Session, SessionPolicy};

#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Pause between sessions when connecting several at once.
    pub connect_interval: Duration,
    /// Per-queue drain budget on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            connect_interval: Duration::from_secs(6),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Which per-session queue a task goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Bank,
    Warp,
}

/// One managed session.
pub struct Member {
    /// 1-based position in the config file.
    pub index: usize,
    pub enabled: bool,
    pub session: Session,
    pub bank_queue: TaskQueue,
    pub warp_queue: TaskQueue,
    pub auto_withdraw: Arc<AutoWithdraw>,
}

impl Member {
    pub fn tag(&self) -> &str {
        self.session.tag()
    }

    pub fn queue(&self, domain: Domain) -> &TaskQueue {
        match domain {
            Domain::Bank => &self.bank_queue,
            Domain::Warp => &self.warp_queue,
        }
    }
}

/// How a command names its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Tag(String),
    /// 1-based.
    Index(usize),
}

impl Target {
    /// `all`, a positive number, or a tag.
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("all") {
            return Target::All;
        }
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => Target::Index(n),
            _ => Target::Tag(raw.to_string()),
        }
    }
}

pub struct Fleet {
    members: Vec<Member>,
    bank: Arc<BankConfig>,
    warp: Arc<WarpConfig>,
    options: FleetOptions,
    shutting_down: AtomicBool,
}

impl Fleet {
    /// Spawn a session and its queues for every resolved bot.
    pub fn build(
        config: &Config,
        specs: Vec<BotSpec>,
        transport: Arc<dyn Transport>,
        options: FleetOptions,
    ) -> Self {
        let bank = Arc::new(config.bank.clone());
        let warp = Arc::new(config.warp.clone());
        let reconnect = config.reconnect.policy();
        let cooldown = config.reconnect.blacklist_cooldown();
        let chat_rules = match ChatRules::compile(&config.chat) {
            Ok(rules) => Some(Arc::new(rules)),
            Err(e) => {
                tracing::error!(error = %e, "Chat reactions disabled");
                None
            }
        };

        let mut members = Vec::new();
        for spec in specs {
            let Some(registry) = FailoverRegistry::new(spec.endpoints.clone(), cooldown) else {
                tracing::error!(bot = %spec.tag, "No endpoints, skipping");
                continue;
            };
            let bank_queue = TaskQueue::spawn(format!("bank:{}", spec.tag));
            let warp_queue = TaskQueue::spawn(format!("warp:{}", spec.tag));

            // The loop always runs while online and idles while switched off.
            let auto_withdraw = AutoWithdraw::new(&spec.auto_withdraw);
            let mut background: Vec<BackgroundTask> = vec![bank::auto_withdraw(
                auto_withdraw.clone(),
                bank_queue.clone(),
                bank.clone(),
            )];
            if let Some(rules) = &chat_rules {
                let rules = if spec.quick_actions.is_empty() {
                    rules.clone()
                } else {
                    Arc::new(rules.with_grants(&spec.quick_actions))
                };
                background.push(chat::watcher(rules, bank_queue.clone(), bank.clone()));
            }

            let policy = SessionPolicy {
                reconnect: reconnect.clone(),
                auto_reconnect: spec.enabled,
                duplicate_login_retry: spec.duplicate_login_retry,
                login_timeout: config.reconnect.login_timeout(),
            };
            let session = Session::spawn(
                Identity {
                    tag: spec.tag.clone(),
                    username: spec.username.clone(),
                },
                registry,
                policy,
                transport.clone(),
                background,
            );
            members.push(Member {
                index: members.len() + 1,
                enabled: spec.enabled,
                session,
                bank_queue,
                warp_queue,
                auto_withdraw,
            });
        }
        tracing::info!(bots = members.len(), "Fleet ready");

        Self {
            members,
            bank,
            warp,
            options,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn bank_config(&self) -> &Arc<BankConfig> {
        &self.bank
    }

    pub fn warp_config(&self) -> &Arc<WarpConfig> {
        &self.warp
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn find(&self, target: &Target) -> Vec<&Member> {
        match target {
            Target::All => self.members.iter().collect(),
            Target::Tag(tag) => self.members.iter().filter(|m| m.tag() == tag).collect(),
            Target::Index(i) => self.members.get(i.wrapping_sub(1)).into_iter().collect(),
        }
    }

    /// Resolve several targets, deduplicated, in fleet order. Unknown
    /// targets are returned as the second element.
    pub fn resolve(&self, targets: &[Target]) -> (Vec<&Member>, Vec<String>) {
        let mut picked = vec![false; self.members.len()];
        let mut unknown = Vec::new();
        for target in targets {
            let found = self.find(target);
            if found.is_empty() {
                unknown.push(match target {
                    Target::All => "all".to_string(),
                    Target::Tag(tag) => tag.clone(),
                    Target::Index(i) => i.to_string(),
                });
            }
            for member in found {
                picked[member.index - 1] = true;
            }
        }
        let members = self
            .members
            .iter()
            .filter(|m| picked[m.index - 1])
            .collect();
        (members, unknown)
    }

    /// Connect enabled sessions one after another.
    pub async fn connect_enabled(&self) {
        let enabled: Vec<&Member> = self.members.iter().filter(|m| m.enabled).collect();
        if enabled.is_empty() {
            tracing::info!("No enabled bots to connect");
            return;
        }
        tracing::info!(count = enabled.len(), "Connecting enabled bots");
        self.connect_staggered(&enabled).await;
    }

    /// Connect `members` with the configured pause between each.
    pub async fn connect_staggered(&self, members: &[&Member]) {
        for (i, member) in members.iter().enumerate() {
            if self.is_shutting_down() {
                return;
            }
            if i > 0 {
                tokio::time::sleep(self.options.connect_interval).await;
            }
            member.session.connect().await;
        }
    }

    /// Queue work for `member`. Refused when the fleet is shutting down or
    /// the session is not ONLINE.
    pub fn enqueue<F>(&self, member: &Member, domain: Domain, description: &str, body: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.is_shutting_down() {
            tracing::warn!(bot = %member.tag(), task = description, "Shutting down, not queued");
            return false;
        }
        if !member.session.is_online() {
            tracing::warn!(
                bot = %member.tag(),
                task = description,
                status = %member.session.status(),
                "Not online, not queued"
            );
            return false;
        }
        let queued = member
            .queue(domain)
            .enqueue(Task::new(member.tag(), description, body));
        if queued {
            tracing::info!(bot = %member.tag(), task = description, "Queued");
        }
        queued
    }

    /// Stop taking work, let queues drain within the budget, then
    /// disconnect everything. Always completes.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Graceful shutdown started");
        for member in &self.members {
            for queue in [&member.bank_queue, &member.warp_queue] {
                queue.set_shutdown();
                if !queue.wait_for_completion(self.options.shutdown_timeout).await {
                    tracing::warn!(
                        bot = %member.tag(),
                        queue = %queue.name(),
                        "Queue did not drain in time, continuing"
                    );
                }
            }
        }
        for member in &self.members {
            member.session.disconnect().await;
        }
        tracing::info!("All bots disconnected");
    }
}
