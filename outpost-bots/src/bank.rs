//! Bank window operations: listing, single-slot take, balance parsing,
//! greedy withdrawal and the periodic auto-withdraw loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::FutureExt;
use outpost_sdk::client::Button;
use outpost_sdk::text::amount_after;
use tokio::sync::watch;

use crate::config::{AutoWithdrawConfig, BankConfig, Denomination, minutes};
use crate::queue::{Task, TaskQueue};
use crate::session::{BackgroundTask, Session};
use crate::window::{self, OpenWindow};

pub const AUTO_WITHDRAW_TASK: &str = "auto-withdraw";
pub const EARNING_CAP_TASK: &str = "earning-cap withdraw";

/// Operator switch and settings of one bot's auto-withdraw loop.
#[derive(Debug)]
pub struct AutoWithdraw {
    enabled: watch::Sender<bool>,
    pub interval: Duration,
    pub threshold: u64,
}

impl AutoWithdraw {
    pub fn new(settings: &AutoWithdrawConfig) -> Arc<Self> {
        Arc::new(Self {
            enabled: watch::Sender::new(settings.enabled),
            interval: minutes(settings.interval_minutes.max(1)),
            threshold: settings.threshold,
        })
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Turn the loop on or off. A running loop restarts its interval.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.send_replace(enabled);
    }
}

/// One non-empty bank entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankEntry {
    pub slot: u32,
    pub name: String,
    pub label: Option<String>,
    pub count: u32,
}

/// What a withdrawal run did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Withdrawal {
    pub balance: u64,
    /// Denomination values clicked, in order.
    pub clicks: Vec<u64>,
    pub remaining: u64,
}

impl Withdrawal {
    pub fn withdrawn(&self) -> u64 {
        self.clicks.iter().sum()
    }
}

async fn open_bank(session: &Session, config: &BankConfig) -> anyhow::Result<OpenWindow> {
    window::open(
        session,
        &config.command,
        Some(&config.match_hint),
        config.timeout(),
    )
    .await
    .with_context(|| format!("opening {}", config.command))
}

/// Balance shown on the configured slot of an open bank window.
pub fn balance(window: &OpenWindow, config: &BankConfig) -> Option<u64> {
    let label = window.slot(config.balance_slot)?.label.as_deref()?;
    amount_after(label, &config.balance_marker)
}

/// Largest denomination not above `remaining`.
pub fn next_denomination(remaining: u64, denominations: &[Denomination]) -> Option<Denomination> {
    denominations
        .iter()
        .filter(|d| d.value <= remaining)
        .max_by_key(|d| d.value)
        .copied()
}

/// Every non-empty entry of the bank window.
pub async fn list(session: &Session, config: &BankConfig) -> anyhow::Result<Vec<BankEntry>> {
    let window = open_bank(session, config).await?;
    let entries = window
        .occupied()
        .map(|item| BankEntry {
            slot: item.slot,
            name: item.name.clone(),
            label: item.plain_label(),
            count: item.count,
        })
        .collect();
    window.close().await;
    Ok(entries)
}

/// Click one non-empty slot of the bank window.
pub async fn take(session: &Session, config: &BankConfig, slot: u32) -> anyhow::Result<()> {
    let mut window = open_bank(session, config).await?;
    if window.slot(slot).is_none() {
        bail!("slot {slot} is empty");
    }
    window.click(slot, Button::Left).await?;
    if let Err(e) = window.refresh(config.timeout()).await {
        tracing::warn!(bot = %session.tag(), slot, error = %e, "No update after take");
    }
    window.close().await;
    Ok(())
}

/// Read the balance and withdraw it greedily, largest denomination first,
/// until less than the smallest denomination remains.
///
/// Stops early, without retry, when the slot of the chosen denomination is
/// empty or the session leaves ONLINE. The window is closed on every path.
pub async fn withdraw_all(session: &Session, config: &BankConfig) -> anyhow::Result<Withdrawal> {
    let mut window = open_bank(session, config).await?;
    let balance = balance(&window, config).context("balance not found in bank window")?;
    let report = withdraw(session, &mut window, config, balance).await;
    window.close().await;
    report
}

/// Withdraw when the balance reaches `threshold`. `None` when below it.
pub async fn withdraw_above(
    session: &Session,
    config: &BankConfig,
    threshold: u64,
) -> anyhow::Result<Option<Withdrawal>> {
    let mut window = open_bank(session, config).await?;
    let balance = balance(&window, config).context("balance not found in bank window")?;
    tracing::info!(bot = %session.tag(), balance, "Bank balance");
    if balance < threshold {
        window.close().await;
        return Ok(None);
    }
    let report = withdraw(session, &mut window, config, balance).await;
    window.close().await;
    report.map(Some)
}

async fn withdraw(
    session: &Session,
    window: &mut OpenWindow,
    config: &BankConfig,
    balance: u64,
) -> anyhow::Result<Withdrawal> {
    let tag = session.tag();
    let mut report = Withdrawal {
        balance,
        clicks: Vec::new(),
        remaining: balance,
    };
    tracing::info!(bot = %tag, balance, "Withdrawal started");

    while let Some(denomination) = next_denomination(report.remaining, &config.denominations) {
        if !session.is_online() {
            bail!("session went offline after withdrawing {}", report.withdrawn());
        }
        if window.slot(denomination.slot).is_none() {
            tracing::warn!(
                bot = %tag,
                slot = denomination.slot,
                value = denomination.value,
                "Denomination slot is empty, stopping"
            );
            break;
        }

        tracing::info!(bot = %tag, value = denomination.value, remaining = report.remaining, "Withdrawing");
        window.click(denomination.slot, Button::Left).await?;
        window
            .refresh(config.timeout())
            .await
            .context("waiting for bank update")?;
        report.remaining -= denomination.value;
        report.clicks.push(denomination.value);
        tokio::time::sleep(config.settle()).await;
    }

    tracing::info!(
        bot = %tag,
        withdrawn = report.withdrawn(),
        remaining = report.remaining,
        "Withdrawal finished"
    );
    Ok(report)
}

/// Queue one auto-withdraw task unless one is already waiting.
/// Returns true when a task was queued.
pub fn schedule_auto_withdraw(
    session: &Session,
    queue: &TaskQueue,
    config: &Arc<BankConfig>,
    threshold: u64,
) -> bool {
    let tag = session.tag();
    if !session.is_online() || queue.is_shutting_down() {
        tracing::debug!(bot = %tag, "Offline or shutting down, skipping auto-withdraw");
        return false;
    }
    if queue.has_pending(tag, AUTO_WITHDRAW_TASK) {
        tracing::debug!(bot = %tag, "Auto-withdraw already queued");
        return false;
    }
    let session = session.clone();
    let config = config.clone();
    queue.enqueue(Task::new(tag, AUTO_WITHDRAW_TASK, async move {
        withdraw_above(&session, &config, threshold).await?;
        Ok(())
    }))
}

/// Queue a full withdrawal unless one is already waiting.
pub fn schedule_withdraw_all(session: &Session, queue: &TaskQueue, config: &Arc<BankConfig>) -> bool {
    let tag = session.tag();
    if !session.is_online() || queue.has_pending(tag, EARNING_CAP_TASK) {
        return false;
    }
    let session = session.clone();
    let config = config.clone();
    queue.enqueue(Task::new(tag, EARNING_CAP_TASK, async move {
        withdraw_all(&session, &config).await?;
        Ok(())
    }))
}

/// Background loop started on login: while the switch is on, queue an
/// auto-withdraw check on `queue` every interval.
pub fn auto_withdraw(
    switch: Arc<AutoWithdraw>,
    queue: TaskQueue,
    config: Arc<BankConfig>,
) -> BackgroundTask {
    Arc::new(move |session: Session| {
        let switch = switch.clone();
        let queue = queue.clone();
        let config = config.clone();
        async move {
            let mut enabled = switch.enabled.subscribe();
            loop {
                if !*enabled.borrow_and_update() {
                    if enabled.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                tracing::info!(
                    bot = %session.tag(),
                    interval_mins = switch.interval.as_secs() / 60,
                    threshold = switch.threshold,
                    "Auto-withdraw running"
                );
                let ticker = tokio::time::sleep(switch.interval);
                tokio::pin!(ticker);
                loop {
                    tokio::select! {
                        _ = &mut ticker => {
                            schedule_auto_withdraw(&session, &queue, &config, switch.threshold);
                            ticker.as_mut().reset(tokio::time::Instant::now() + switch.interval);
                        }
                        changed = enabled.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        }
        .boxed()
    })
}
