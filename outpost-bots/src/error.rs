//! Error taxonomy shared by the session, window and config layers.

use std::path::PathBuf;

use outpost_sdk::client::TransportError;
use outpost_sdk::text::strip_formatting;

/// Why a connection ended, derived from the disconnect reason text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Another client logged in with the same account.
    DuplicateLogin,
    /// Credentials rejected. Terminal.
    Authentication,
    /// Connection reset or timed out.
    Network,
    Generic,
}

const DUPLICATE_LOGIN_MARKERS: &[&str] = &[
    "logged_in_elsewhere",
    "duplicate_login",
    "already connected to this proxy",
    "another location",
];

const AUTHENTICATION_MARKERS: &[&str] = &["authentication error"];

const NETWORK_MARKERS: &[&str] = &["econnreset", "connection reset", "timed out"];

impl DisconnectCause {
    /// Classify a kick/error/end reason. Duplicate login is checked before
    /// authentication so a proxy message mentioning both stays retryable.
    pub fn classify(reason: &str) -> Self {
        let text = strip_formatting(reason).to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));
        if has(DUPLICATE_LOGIN_MARKERS) {
            DisconnectCause::DuplicateLogin
        } else if has(AUTHENTICATION_MARKERS) {
            DisconnectCause::Authentication
        } else if has(NETWORK_MARKERS) {
            DisconnectCause::Network
        } else {
            DisconnectCause::Generic
        }
    }

    pub fn is_network(self) -> bool {
        self == DisconnectCause::Network
    }
}

/// Failures of a window interaction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WindowError {
    #[error("another window operation is in progress")]
    Busy,
    #[error("session is not online")]
    NotOnline,
    #[error("no matching window opened within {0:?}")]
    OpenTimedOut(std::time::Duration),
    #[error("window content did not refresh within {0:?}")]
    ContentTimedOut(std::time::Duration),
    #[error("connection lost while waiting for the window")]
    Disconnected,
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bot {tag}: unknown server group {group:?}")]
    UnknownServerGroup { tag: String, group: String },
    #[error("bot {tag}: no usable endpoint")]
    NoEndpoints { tag: String },
    #[error("duplicate bot tag {0:?}")]
    DuplicateTag(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
