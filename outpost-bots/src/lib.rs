//! outpost-bots: a fleet of self-healing game-server sessions.
//!
//! - Per-session state machine with backoff, quick-disconnect detection and
//!   multi-endpoint failover
//! - Per-domain task queues that serialize window interactions
//! - Bank and warp operations built on the window protocol
//! - Chat reactions: whitelisted teleports, lock-up reconnects, earning-cap
//!   withdrawals
//! - An operator console to drive it all

pub mod bank;
pub mod chat;
pub mod config;
pub mod console;
pub mod error;
pub mod failover;
pub mod manager;
pub mod policy;
pub mod queue;
pub mod session;
pub mod warp;
pub mod window;
