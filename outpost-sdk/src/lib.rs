//! outpost-sdk: the transport contract for long-lived game-server sessions.
//!
//! The session engine in `outpost-bots` depends only on what lives here:
//! - [`event::Event`]: the typed inbound event stream of one connection
//! - [`client::Transport`]: connect to an endpoint, get a handle + events
//! - [`client::ClientHandle`]: outbound commands (chat, click, close)
//!
//! [`client::LineTransport`] is a reference implementation that talks
//! newline-delimited JSON to a protocol bridge. [`mock::MockTransport`] is
//! an in-memory transport for tests.

pub mod client;
pub mod event;
pub mod mock;
pub mod text;
