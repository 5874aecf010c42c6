//! Operator console: one command per line, targets with `@tag`, `@index`
//! or `@all`. Without a target a command applies to the selected bot.

use std::sync::Arc;

use anyhow::{Context, bail};

use crate::bank;
use crate::manager::{Domain, Fleet, Member, Target};
use crate::warp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    /// All bots with index and status.
    List,
    /// Change the default target.
    Select(String),
    Status,
    Connect,
    Disconnect,
    Queue,
    BankList,
    BankTake(u32),
    WarpList,
    WarpTp(String),
    AutoWithdraw(Switch),
    /// Slash command sent through the target sessions.
    Raw(String),
    /// `//cmd`: slash command sent by every ONLINE bot.
    RawAll(String),
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub command: Command,
    /// Empty means the selected bot.
    pub targets: Vec<Target>,
}

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse(input: &str) -> anyhow::Result<Option<Line>> {
    let mut targets = Vec::new();
    let mut words = Vec::new();
    for word in input.split_whitespace() {
        match word.strip_prefix('@') {
            Some(raw) if !raw.is_empty() => targets.push(Target::parse(raw)),
            _ => words.push(word),
        }
    }
    let Some((&head, rest)) = words.split_first() else {
        return Ok(None);
    };

    if let Some(cmd) = head.strip_prefix("//") {
        let text = std::iter::once(cmd).chain(rest.iter().copied()).collect::<Vec<_>>().join(" ");
        if cmd.is_empty() {
            bail!("usage: //<command>");
        }
        return Ok(Some(Line {
            command: Command::RawAll(format!("/{text}")),
            targets,
        }));
    }
    if head.starts_with('/') {
        let text = words.join(" ");
        if text.len() == 1 {
            bail!("usage: /<command> [@target]");
        }
        return Ok(Some(Line {
            command: Command::Raw(text),
            targets,
        }));
    }

    let command = match (head.to_lowercase().as_str(), rest) {
        ("help", _) => Command::Help,
        ("list", _) => Command::List,
        ("bot", [name]) => Command::Select(name.to_string()),
        ("bot", []) if targets.len() == 1 => {
            return Ok(Some(Line {
                command: Command::Select(target_name(&targets[0])),
                targets: Vec::new(),
            }));
        }
        ("status", _) => Command::Status,
        ("connect", _) => Command::Connect,
        ("disconnect", _) => Command::Disconnect,
        ("queue", _) => Command::Queue,
        ("exit" | "quit", _) => Command::Exit,
        ("bank", ["list"]) => Command::BankList,
        ("bank", ["take", slot]) => Command::BankTake(
            slot.parse()
                .with_context(|| format!("invalid slot {slot:?}"))?,
        ),
        ("bank", _) => bail!("usage: bank list | bank take <slot> [@target]"),
        ("warp", ["list"]) => Command::WarpList,
        ("warp", ["tp", name @ ..]) if !name.is_empty() => Command::WarpTp(name.join(" ")),
        ("warp", _) => bail!("usage: warp list | warp tp <name> [@target]"),
        ("autowithdraw", [action]) => Command::AutoWithdraw(match action.to_lowercase().as_str() {
            "on" => Switch::On,
            "off" => Switch::Off,
            "status" => Switch::Status,
            other => bail!("unknown autowithdraw action {other:?}, use on, off or status"),
        }),
        ("autowithdraw", _) => bail!("usage: autowithdraw <on|off|status> [@target]"),
        (other, _) => bail!("unknown command {other:?}, try help"),
    };
    Ok(Some(Line { command, targets }))
}

fn target_name(target: &Target) -> String {
    match target {
        Target::All => "all".to_string(),
        Target::Tag(tag) => tag.clone(),
        Target::Index(i) => i.to_string(),
    }
}

/// What the input loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub const HELP: &str = "\
Targets: @<tag>, @<index> or @all. Without a target the selected bot is used.
  help                      show this text
  list                      all bots with index and status
  bot <tag|index>           select the default target
  status [@target]          status, endpoint and reconnect counters
  connect [@target]         connect (staggered for several bots)
  disconnect [@target]      disconnect and stop reconnecting
  queue [@target]           pending tasks per queue
  bank list [@target]       [queued] show bank window entries
  bank take <slot> [@target] [queued] click one bank slot
  warp list [@target]       [queued] list warps
  warp tp <name> [@target]  [queued] teleport to a warp
  autowithdraw <on|off|status> [@target]
                            switch the periodic bank withdrawal
  /<command> [@target]      send a command in game
  //<command>               send a command from every online bot
  exit                      drain queues, disconnect all, quit";

pub struct Console {
    fleet: Arc<Fleet>,
    selected: Option<String>,
}

impl Console {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        let selected = fleet.members().first().map(|m| m.tag().to_string());
        Self { fleet, selected }
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Parse and run one line. Errors are for the caller to report; they
    /// never end the loop.
    pub async fn handle(&mut self, input: &str) -> anyhow::Result<Flow> {
        match parse(input)? {
            Some(line) => self.execute(line).await,
            None => Ok(Flow::Continue),
        }
    }

    fn targets(&self, line: &Line) -> anyhow::Result<Vec<&Member>> {
        let targets = if line.targets.is_empty() {
            let tag = self
                .selected
                .clone()
                .context("no target given and no bot selected")?;
            vec![Target::Tag(tag)]
        } else {
            line.targets.clone()
        };
        let (members, unknown) = self.fleet.resolve(&targets);
        for name in unknown {
            tracing::error!(target_name = %name, "No such bot");
        }
        Ok(members)
    }

    pub async fn execute(&mut self, line: Line) -> anyhow::Result<Flow> {
        let fleet = self.fleet.clone();
        match &line.command {
            Command::Help => println!("{HELP}"),
            Command::Exit => return Ok(Flow::Exit),
            Command::List => {
                for m in fleet.members() {
                    let marker = if self.selected() == Some(m.tag()) { " <- selected" } else { "" };
                    println!(
                        "[{}] {:<16} {:<10} enabled={}{}",
                        m.index,
                        m.tag(),
                        m.session.status().to_string(),
                        m.enabled,
                        marker
                    );
                }
            }
            Command::Select(name) => {
                let found = fleet.find(&Target::parse(name));
                match found.as_slice() {
                    [member] => {
                        self.selected = Some(member.tag().to_string());
                        println!("Selected {}", member.tag());
                    }
                    _ => bail!("no single bot matches {name:?}"),
                }
            }
            Command::Status => {
                for m in self.targets(&line)? {
                    print_status(m);
                }
            }
            Command::Connect => {
                let indices: Vec<usize> = self.targets(&line)?.iter().map(|m| m.index).collect();
                // Staggering can take a while; the prompt stays responsive.
                tokio::spawn(async move {
                    let members: Vec<&Member> = indices
                        .iter()
                        .filter_map(|i| fleet.members().get(i - 1))
                        .collect();
                    fleet.connect_staggered(&members).await;
                });
            }
            Command::Disconnect => {
                for m in self.targets(&line)? {
                    m.session.disconnect().await;
                }
            }
            Command::Queue => {
                for m in self.targets(&line)? {
                    println!(
                        "{}: bank {} pending{}, warp {} pending{}",
                        m.tag(),
                        m.bank_queue.len(),
                        if m.bank_queue.is_busy() { " (busy)" } else { "" },
                        m.warp_queue.len(),
                        if m.warp_queue.is_busy() { " (busy)" } else { "" },
                    );
                }
            }
            Command::BankList => {
                for m in self.targets(&line)? {
                    let session = m.session.clone();
                    let config = fleet.bank_config().clone();
                    fleet.enqueue(m, Domain::Bank, "bank list", async move {
                        let entries = bank::list(&session, &config).await?;
                        println!("--- {} bank ---", session.tag());
                        for e in &entries {
                            println!(
                                "  slot {:<3} {:<20} x{:<3} {}",
                                e.slot,
                                e.name,
                                e.count,
                                e.label.as_deref().unwrap_or("")
                            );
                        }
                        Ok(())
                    });
                }
            }
            Command::BankTake(slot) => {
                let slot = *slot;
                for m in self.targets(&line)? {
                    let session = m.session.clone();
                    let config = fleet.bank_config().clone();
                    fleet.enqueue(m, Domain::Bank, &format!("bank take {slot}"), async move {
                        bank::take(&session, &config, slot).await
                    });
                }
            }
            Command::WarpList => {
                for m in self.targets(&line)? {
                    let session = m.session.clone();
                    let config = fleet.warp_config().clone();
                    fleet.enqueue(m, Domain::Warp, "warp list", async move {
                        let warps = warp::list(&session, &config).await?;
                        println!("--- {} warps ---", session.tag());
                        if warps.is_empty() {
                            println!("  (none)");
                        }
                        for w in &warps {
                            println!("  {}", w.name);
                        }
                        Ok(())
                    });
                }
            }
            Command::WarpTp(name) => {
                for m in self.targets(&line)? {
                    let session = m.session.clone();
                    let config = fleet.warp_config().clone();
                    let name = name.clone();
                    fleet.enqueue(m, Domain::Warp, &format!("warp tp {name}"), async move {
                        warp::teleport(&session, &config, &name).await
                    });
                }
            }
            Command::AutoWithdraw(switch) => {
                for m in self.targets(&line)? {
                    let auto = &m.auto_withdraw;
                    match switch {
                        Switch::On => {
                            auto.set_enabled(true);
                            tracing::info!(bot = %m.tag(), "Auto-withdraw on");
                        }
                        Switch::Off => {
                            auto.set_enabled(false);
                            tracing::info!(bot = %m.tag(), "Auto-withdraw off");
                        }
                        Switch::Status => {
                            let state = match (auto.is_enabled(), m.session.is_online()) {
                                (true, true) => "running",
                                (true, false) => "on, waiting for login",
                                (false, _) => "stopped",
                            };
                            println!(
                                "{}: auto-withdraw {} | threshold ${} | every {} min",
                                m.tag(),
                                state,
                                auto.threshold,
                                auto.interval.as_secs() / 60
                            );
                        }
                    }
                }
            }
            Command::Raw(text) => {
                for m in self.targets(&line)? {
                    dispatch(m, text).await;
                }
            }
            Command::RawAll(text) => {
                for m in fleet.members().iter().filter(|m| m.session.is_online()) {
                    dispatch(m, text).await;
                }
            }
        }
        Ok(Flow::Continue)
    }
}

async fn dispatch(member: &Member, text: &str) {
    match member.session.dispatch(text).await {
        Ok(()) => tracing::info!(bot = %member.tag(), command = text, "Sent"),
        Err(e) => tracing::warn!(bot = %member.tag(), command = text, error = %e, "Not sent"),
    }
}

fn print_status(member: &Member) {
    let s = member.session.snapshot();
    println!("[{}] {} {}", member.index, member.tag(), s.status);
    println!("  endpoint:      {}", s.endpoint);
    println!(
        "  failures:      {} consecutive, {} quick, {} recent attempts",
        s.consecutive_fails, s.quick_disconnects, s.recent_attempts
    );
    if let Some(at) = s.last_login_at {
        println!("  last login:    {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(at) = s.reconnect_at {
        println!("  reconnect at:  {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(reason) = &s.last_disconnect {
        println!("  last drop:     {reason}");
    }
    if !s.blacklisted.is_empty() {
        println!("  blacklisted:   {}", s.blacklisted.join(", "));
    }
}
