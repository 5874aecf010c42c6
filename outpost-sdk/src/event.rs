//! Events emitted by a transport connection for the session layer to consume.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned identifier of an open window (container).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub i32);

impl WindowId {
    /// The player's own inventory. Never the target of a window interaction.
    pub const INVENTORY: WindowId = WindowId(0);

    pub fn is_inventory(self) -> bool {
        self == Self::INVENTORY
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One addressable entry in a window snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Slot index inside the window.
    pub slot: u32,
    /// Internal item name (e.g. `gold_ingot`). Empty for an air slot.
    #[serde(default)]
    pub name: String,
    /// Custom display label, still carrying `§` formatting codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub count: u32,
}

impl Item {
    /// Air / empty slots are reported by some servers as items with no name
    /// and a zero count.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() || self.count == 0
    }

    /// Label with formatting codes removed.
    pub fn plain_label(&self) -> Option<String> {
        self.label.as_deref().map(crate::text::strip_formatting)
    }
}

/// Events that a transport connection emits to its consumer.
///
/// Serialized with `#[serde(tag = "type")]` so the line transport can read
/// them straight off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Login handshake accepted.
    Login { username: String },

    /// Player entity spawned in the world.
    Spawn,

    /// A window was opened by the server.
    WindowOpened {
        window: WindowId,
        #[serde(default)]
        title: String,
        #[serde(default)]
        items: Vec<Item>,
    },

    /// Full content of a window was (re)sent.
    WindowContentUpdated {
        window: WindowId,
        #[serde(default)]
        items: Vec<Item>,
    },

    /// The server closed a window.
    WindowClosed { window: WindowId },

    /// A chat or system message.
    Chat { text: String },

    /// Kicked by the server.
    Kicked { reason: String },

    /// Transport-level error. The connection is unusable afterwards.
    Error { message: String },

    /// Connection ended.
    End { reason: String },

    /// Answer to a keepalive ping. Consumed by the line transport.
    Pong,
}

impl Event {
    /// True for events after which the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Event::Kicked { .. } | Event::Error { .. } | Event::End { .. }
        )
    }

    /// Reason text of a disconnect-class event.
    pub fn disconnect_reason(&self) -> Option<&str> {
        match self {
            Event::Kicked { reason } | Event::End { reason } => Some(reason),
            Event::Error { message } => Some(message),
            _ => None,
        }
    }
}
