//! Configuration file model.
//!
//! One TOML file holds the server groups, the bots, the shared reconnect
//! policy and the window settings for the bank and warp domains:
//!
//! ```toml
//! [servers.main]
//! primary = { host = "play.example.net", port = 25565 }
//! backups = [{ host = "backup.example.net", port = 25565 }]
//!
//! [[bots]]
//! tag = "miner1"
//! username = "Miner_One"
//! server = "main"
//! reconnect_on_duplicate_login = { enabled = true, delay_minutes = 60 }
//! auto_withdraw = { enabled = true, interval_minutes = 15, threshold = 8000 }
//!
//! [chat.whitelist]
//! Friend = { tpa = true, tpahere = false }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use outpost_sdk::client::Endpoint;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::policy::{Backoff, ReconnectPolicy};

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/outpost.toml";

/// Upper bound for every delay read from the file.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `secs` as a delay, clamped to [`MAX_DELAY`].
pub fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_DELAY)
}

/// `minutes` as a delay, clamped to [`MAX_DELAY`].
pub fn minutes(minutes: u64) -> Duration {
    secs(minutes.saturating_mul(60))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerGroup>,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub bank: BankConfig,
    #[serde(default)]
    pub warp: WarpConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl EndpointConfig {
    fn usable(&self) -> Option<Endpoint> {
        (!self.host.trim().is_empty() && self.port != 0)
            .then(|| Endpoint::new(self.host.trim(), self.port))
    }
}

/// A primary endpoint plus ranked backups.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerGroup {
    pub primary: Option<EndpointConfig>,
    #[serde(default)]
    pub backups: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    pub tag: String,
    /// Account name; defaults to the tag.
    pub username: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Server group name. Takes precedence over `host`/`port`.
    pub server: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub reconnect_on_duplicate_login: DuplicateLoginConfig,
    #[serde(default)]
    pub auto_withdraw: AutoWithdrawConfig,
    /// Teleport grants for this bot only, on top of `[chat.whitelist]`.
    #[serde(default)]
    pub quick_actions: BTreeMap<String, TeleportGrant>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DuplicateLoginConfig {
    pub enabled: bool,
    pub delay_minutes: u64,
}

impl Default for DuplicateLoginConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoWithdrawConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Withdraw when the balance reaches this amount.
    pub threshold: u64,
}

impl Default for AutoWithdrawConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 15,
            threshold: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    Exponential,
    Ladder,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub schedule: Schedule,
    pub base_secs: u64,
    pub cap_secs: u64,
    pub ladder_secs: Vec<u64>,
    /// Aggressive variant: quick disconnects also feed the backoff.
    pub quick_disconnect_counts_as_failure: bool,
    pub blacklist_minutes: u64,
    /// A connection without login after this long is dropped.
    pub login_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            schedule: Schedule::Exponential,
            base_secs: 15,
            cap_secs: 120,
            ladder_secs: vec![5, 10, 15, 30, 60],
            quick_disconnect_counts_as_failure: false,
            blacklist_minutes: 5,
            login_timeout_secs: 60,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        let backoff = match self.schedule {
            Schedule::Exponential => Backoff::Exponential {
                base: secs(self.base_secs),
                cap: secs(self.cap_secs),
            },
            Schedule::Ladder => {
                Backoff::Ladder(self.ladder_secs.iter().copied().map(secs).collect())
            }
        };
        ReconnectPolicy {
            backoff,
            quick_counts_as_failure: self.quick_disconnect_counts_as_failure,
            ..ReconnectPolicy::default()
        }
    }

    pub fn blacklist_cooldown(&self) -> Duration {
        minutes(self.blacklist_minutes)
    }

    pub fn login_timeout(&self) -> Duration {
        secs(self.login_timeout_secs)
    }
}

/// One withdrawable denomination and the window slot that dispenses it.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct Denomination {
    pub value: u64,
    pub slot: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BankConfig {
    pub command: String,
    pub match_hint: String,
    pub balance_slot: u32,
    pub balance_marker: String,
    pub denominations: Vec<Denomination>,
    pub settle_ms: u64,
    pub timeout_secs: u64,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            command: "/atm".to_string(),
            match_hint: "Balance".to_string(),
            balance_slot: 13,
            balance_marker: "Balance $".to_string(),
            denominations: vec![
                Denomination { value: 10000, slot: 9 },
                Denomination { value: 1000, slot: 10 },
                Denomination { value: 100, slot: 11 },
                Denomination { value: 10, slot: 12 },
            ],
            settle_ms: 800,
            timeout_secs: 15,
        }
    }
}

impl BankConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms).min(MAX_DELAY)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarpConfig {
    pub command: String,
    pub match_hint: String,
    pub timeout_secs: u64,
    /// Entries whose label contains one of these are not warps.
    pub ignore_labels: Vec<String>,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            command: "/homelist".to_string(),
            match_hint: "Instructions".to_string(),
            timeout_secs: 15,
            ignore_labels: vec!["Instructions".to_string()],
        }
    }
}

impl WarpConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

/// What a whitelisted player may ask the bot to accept.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TeleportGrant {
    /// The bot may go to the player.
    pub tpa: bool,
    /// The player may come to the bot.
    pub tpahere: bool,
}

/// Reactions to chat messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    /// Request to send the bot to a player. Group 1 is the player name.
    pub tpa_pattern: String,
    /// Request to bring a player to the bot. Group 1 is the player name.
    pub tpahere_pattern: String,
    pub accept_command: String,
    pub accept_delay_ms: u64,
    /// Players allowed to teleport with the bot, matched case-insensitively.
    pub whitelist: BTreeMap<String, TeleportGrant>,
    /// Proxy message of a stuck server switch. Forces a reconnect.
    pub lockup_marker: String,
    /// Message announcing the earning cap. Triggers a withdrawal.
    pub earning_cap_marker: String,
    pub earning_cap_delay_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            tpa_pattern: "^(.+?) 請求您傳送過去。".to_string(),
            tpahere_pattern: "^(.+?) 請求傳送過來。".to_string(),
            accept_command: "/tpyes".to_string(),
            accept_delay_ms: 1500,
            whitelist: BTreeMap::new(),
            lockup_marker: "You are already trying to connect to a server!".to_string(),
            earning_cap_marker: "達到在線賺錢上限".to_string(),
            earning_cap_delay_ms: 1500,
        }
    }
}

impl ChatConfig {
    pub fn accept_delay(&self) -> Duration {
        Duration::from_millis(self.accept_delay_ms).min(MAX_DELAY)
    }

    pub fn earning_cap_delay(&self) -> Duration {
        Duration::from_millis(self.earning_cap_delay_ms).min(MAX_DELAY)
    }
}

fn default_true() -> bool {
    true
}

/// A bot with its endpoints resolved.
#[derive(Debug, Clone)]
pub struct BotSpec {
    pub tag: String,
    pub username: String,
    pub enabled: bool,
    pub endpoints: Vec<Endpoint>,
    pub duplicate_login_retry: Option<Duration>,
    pub auto_withdraw: AutoWithdrawConfig,
    pub quick_actions: BTreeMap<String, TeleportGrant>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: PathBuf::from(path),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that make the whole file unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reconnect;
        match r.schedule {
            Schedule::Exponential if r.base_secs == 0 || r.cap_secs < r.base_secs => {
                return Err(ConfigError::Invalid(
                    "reconnect.base_secs must be positive and not above cap_secs".into(),
                ));
            }
            Schedule::Ladder if r.ladder_secs.is_empty() => {
                return Err(ConfigError::Invalid("reconnect.ladder_secs is empty".into()));
            }
            _ => {}
        }
        if self.bank.denominations.iter().any(|d| d.value == 0) {
            return Err(ConfigError::Invalid("bank denominations must be positive".into()));
        }
        if r.login_timeout_secs == 0 {
            return Err(ConfigError::Invalid("reconnect.login_timeout_secs must be positive".into()));
        }
        crate::chat::ChatRules::compile(&self.chat)?;
        Ok(())
    }

    /// Resolve every bot. Bots that cannot be resolved are returned as
    /// errors next to the usable ones, in file order.
    pub fn resolve(&self) -> (Vec<BotSpec>, Vec<ConfigError>) {
        let mut specs = Vec::new();
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for bot in &self.bots {
            let tag = bot.tag.trim();
            if tag.is_empty() {
                errors.push(ConfigError::Invalid("bot without a tag".into()));
                continue;
            }
            if !seen.insert(tag.to_string()) {
                errors.push(ConfigError::DuplicateTag(tag.to_string()));
                continue;
            }
            match self.endpoints_for(bot) {
                Ok(endpoints) => specs.push(BotSpec {
                    tag: tag.to_string(),
                    username: bot.username.clone().unwrap_or_else(|| tag.to_string()),
                    enabled: bot.enabled,
                    endpoints,
                    duplicate_login_retry: bot
                        .reconnect_on_duplicate_login
                        .enabled
                        .then(|| minutes(bot.reconnect_on_duplicate_login.delay_minutes)),
                    auto_withdraw: bot.auto_withdraw.clone(),
                    quick_actions: bot.quick_actions.clone(),
                }),
                Err(e) => errors.push(e),
            }
        }
        (specs, errors)
    }

    fn endpoints_for(&self, bot: &BotConfig) -> Result<Vec<Endpoint>, ConfigError> {
        let tag = bot.tag.trim().to_string();
        let endpoints: Vec<Endpoint> = match &bot.server {
            Some(group) => {
                let servers =
                    self.servers
                        .get(group)
                        .ok_or_else(|| ConfigError::UnknownServerGroup {
                            tag: tag.clone(),
                            group: group.clone(),
                        })?;
                servers
                    .primary
                    .iter()
                    .chain(&servers.backups)
                    .filter_map(EndpointConfig::usable)
                    .collect()
            }
            None => EndpointConfig {
                host: bot.host.clone().unwrap_or_default(),
                port: bot.port.unwrap_or(0),
            }
            .usable()
            .into_iter()
            .collect(),
        };
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints { tag });
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [servers.main]
        primary = { host = "a.example", port = 25565 }
        backups = [
            { host = "b.example", port = 25566 },
            { host = "", port = 25567 },
        ]

        [servers.broken]
        primary = { host = "", port = 0 }

        [[bots]]
        tag = "one"
        server = "main"
        reconnect_on_duplicate_login = { enabled = true, delay_minutes = 30 }

        [[bots]]
        tag = "two"
        username = "Two_Account"
        host = "direct.example"
        port = 19132
        enabled = false
        auto_withdraw = { enabled = true, threshold = 5000 }
        quick_actions = { Boss = { tpahere = true } }

        [[bots]]
        tag = "three"
        server = "missing"

        [[bots]]
        tag = "four"
        server = "broken"

        [[bots]]
        tag = "one"
        host = "x"
        port = 1

        [reconnect]
        schedule = "ladder"
    "#;

    #[test]
    fn resolves_bots_and_reports_bad_ones() {
        let config = Config::parse(SAMPLE).unwrap();
        let (bots, errors) = config.resolve();

        assert_eq!(bots.len(), 2);
        assert_eq!(bots[0].tag, "one");
        assert_eq!(bots[0].username, "one");
        assert_eq!(
            bots[0].endpoints,
            vec![Endpoint::new("a.example", 25565), Endpoint::new("b.example", 25566)]
        );
        assert_eq!(bots[0].duplicate_login_retry, Some(Duration::from_secs(1800)));
        assert!(bots[0].enabled);

        assert_eq!(bots[1].username, "Two_Account");
        assert!(!bots[1].enabled);
        assert_eq!(bots[1].endpoints, vec![Endpoint::new("direct.example", 19132)]);
        assert!(bots[1].auto_withdraw.enabled);
        assert_eq!(bots[1].auto_withdraw.interval_minutes, 15);
        assert_eq!(bots[1].auto_withdraw.threshold, 5000);
        assert_eq!(bots[1].duplicate_login_retry, None);
        assert_eq!(bots[1].quick_actions["Boss"], TeleportGrant { tpa: false, tpahere: true });
        assert!(bots[0].quick_actions.is_empty());

        assert_eq!(errors.len(), 3);
        assert!(matches!(&errors[0], ConfigError::UnknownServerGroup { tag, .. } if tag == "three"));
        assert!(matches!(&errors[1], ConfigError::NoEndpoints { tag } if tag == "four"));
        assert!(matches!(&errors[2], ConfigError::DuplicateTag(tag) if tag == "one"));
    }

    #[test]
    fn defaults_and_policy() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.bank.command, "/atm");
        assert_eq!(config.bank.balance_slot, 13);
        assert_eq!(config.bank.denominations.len(), 4);
        assert_eq!(config.warp.command, "/homelist");
        assert_eq!(config.reconnect.blacklist_cooldown(), Duration::from_secs(300));
        assert_eq!(config.reconnect.policy(), ReconnectPolicy::default());

        let ladder = Config::parse(SAMPLE).unwrap().reconnect.policy();
        assert_eq!(ladder.backoff, Backoff::aggressive());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            Config::parse("[reconnect]\nschedule = \"ladder\"\nladder_secs = []"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[reconnect]\nbase_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(Config::parse("bots = 3"), Err(ConfigError::Parse(_))));
        assert!(matches!(Config::parse("[surprise]\nx = 1"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn huge_delays_are_clamped() {
        let text = format!(
            "[[bots]]\ntag = \"slow\"\nhost = \"h\"\nport = 1\n\
             reconnect_on_duplicate_login = {{ enabled = true, delay_minutes = {max} }}\n\
             auto_withdraw = {{ enabled = true, interval_minutes = {max} }}\n\
             [reconnect]\nbase_secs = {max}\ncap_secs = {max}\nblacklist_minutes = {max}\n\
             login_timeout_secs = {max}\n",
            max = i64::MAX
        );
        let config = Config::parse(&text).unwrap();
        let (bots, _) = config.resolve();
        assert_eq!(bots[0].duplicate_login_retry, Some(MAX_DELAY));
        assert_eq!(config.reconnect.blacklist_cooldown(), MAX_DELAY);
        assert_eq!(config.reconnect.login_timeout(), MAX_DELAY);
        assert_eq!(config.reconnect.policy().backoff.delay_for(30), MAX_DELAY);
        assert_eq!(minutes(bots[0].auto_withdraw.interval_minutes), MAX_DELAY);
        assert_eq!(minutes(2), Duration::from_secs(120));
    }

    #[test]
    fn chat_section() {
        let config = Config::parse(
            "[chat]\naccept_delay_ms = 200\n[chat.whitelist]\nFriend = { tpa = true }\n",
        )
        .unwrap();
        assert_eq!(config.chat.accept_command, "/tpyes");
        assert_eq!(config.chat.accept_delay(), Duration::from_millis(200));
        assert_eq!(
            config.chat.whitelist["Friend"],
            TeleportGrant { tpa: true, tpahere: false }
        );
        assert!(matches!(
            Config::parse("[chat]\ntpa_pattern = \"(unclosed\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[reconnect]\nlogin_timeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[bots]]\ntag = \"solo\"\nhost = \"h\"\nport = 1").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.resolve().0[0].endpoints, vec![Endpoint::new("h", 1)]);

        let missing = file.path().with_extension("absent");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));
    }
}
