//! Warp (home) window: list entries, teleport by name.

use std::time::Duration;

use anyhow::{Context, anyhow};
use outpost_sdk::client::Button;
use outpost_sdk::event::Item;

use crate::config::WarpConfig;
use crate::session::Session;
use crate::window::{self, OpenWindow};

/// Pause after the teleport click so the server can act before the close.
const TELEPORT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warp {
    pub slot: u32,
    pub name: String,
}

async fn open_warps(session: &Session, config: &WarpConfig) -> anyhow::Result<OpenWindow> {
    window::open(
        session,
        &config.command,
        Some(&config.match_hint),
        config.timeout(),
    )
    .await
    .with_context(|| format!("opening {}", config.command))
}

/// Labelled, non-empty entries that are not instruction items.
pub fn warps<'a>(items: impl IntoIterator<Item = &'a Item>, config: &WarpConfig) -> Vec<Warp> {
    items
        .into_iter()
        .filter(|item| !item.is_empty())
        .filter_map(|item| {
            let name = item.plain_label()?.trim().to_string();
            let ignored = config
                .ignore_labels
                .iter()
                .any(|ignore| name.contains(ignore.as_str()));
            (!name.is_empty() && !ignored).then_some(Warp {
                slot: item.slot,
                name,
            })
        })
        .collect()
}

/// Case-insensitive lookup by plain label.
pub fn find<'a>(warps: &'a [Warp], name: &str) -> Option<&'a Warp> {
    let wanted = name.trim().to_lowercase();
    warps.iter().find(|w| w.name.to_lowercase() == wanted)
}

pub async fn list(session: &Session, config: &WarpConfig) -> anyhow::Result<Vec<Warp>> {
    let window = open_warps(session, config).await?;
    let found = warps(window.items(), config);
    window.close().await;
    Ok(found)
}

pub async fn teleport(session: &Session, config: &WarpConfig, name: &str) -> anyhow::Result<()> {
    let mut window = open_warps(session, config).await?;
    let all = warps(window.items(), config);
    let target = find(&all, name).ok_or_else(|| anyhow!("no warp named {name:?}"))?;
    tracing::info!(bot = %session.tag(), warp = %target.name, slot = target.slot, "Teleporting");
    window.click(target.slot, Button::Left).await?;
    tokio::time::sleep(TELEPORT_SETTLE).await;
    window.close().await;
    Ok(())
}
