//! In-memory transport for tests.
//!
//! [`MockTransport`] records every connect attempt, refuses endpoints on
//! request, and hands each accepted connection to the test as a
//! [`MockConnection`] that can push events and read dispatched commands.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::client::{ClientHandle, Command, Connection, Endpoint, Identity, Transport, TransportError};
use crate::event::Event;

#[derive(Default)]
struct MockState {
    refused: HashSet<Endpoint>,
    refuse_all: bool,
    attempts: Vec<Endpoint>,
    accepted: VecDeque<MockConnection>,
}

/// Scriptable transport. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    accepted: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every future connect to `endpoint`.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.state.lock().refused.insert(endpoint.clone());
    }

    /// Undo [`MockTransport::refuse`].
    pub fn accept(&self, endpoint: &Endpoint) {
        self.state.lock().refused.remove(endpoint);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    /// Every endpoint a connect was attempted against, in order.
    pub fn attempts(&self) -> Vec<Endpoint> {
        self.state.lock().attempts.clone()
    }

    /// Wait for the next accepted connection.
    pub async fn next_connection(&self) -> MockConnection {
        loop {
            if let Some(conn) = self.state.lock().accepted.pop_front() {
                return conn;
            }
            self.accepted.notified().await;
        }
    }

    /// Like [`MockTransport::next_connection`] but gives up after `timeout`.
    pub async fn try_next_connection(&self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.next_connection()).await.ok()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let result = {
            let mut state = self.state.lock();
            state.attempts.push(endpoint.clone());
            if state.refuse_all || state.refused.contains(endpoint) {
                Err(TransportError::ConnectionFailed {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".to_string(),
                })
            } else {
                let (event_tx, event_rx) = mpsc::channel(256);
                let (cmd_tx, cmd_rx) = mpsc::channel(256);
                state.accepted.push_back(MockConnection {
                    endpoint: endpoint.clone(),
                    username: identity.username.clone(),
                    events: event_tx,
                    commands: cmd_rx,
                });
                Ok((ClientHandle::new(cmd_tx), event_rx))
            }
        };
        if result.is_ok() {
            self.accepted.notify_one();
        }
        Box::pin(async move { result })
    }
}

/// The server side of one mock connection.
pub struct MockConnection {
    pub endpoint: Endpoint,
    pub username: String,
    events: mpsc::Sender<Event>,
    commands: mpsc::Receiver<Command>,
}

impl MockConnection {
    /// Push an event to the client. Errors are ignored: the client may
    /// already have dropped the connection.
    pub async fn send(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    /// Another sender for this connection's events. The stream stays open
    /// while any clone is alive.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Next command the client dispatched, or `None` once the handle is gone.
    pub async fn next_command(&mut self) -> Option<Command> {
        self.commands.recv().await
    }

    /// A command that is already buffered, without waiting.
    pub fn try_command(&mut self) -> Option<Command> {
        self.commands.try_recv().ok()
    }

    /// Drain every buffered command.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }

    /// Drop the event sender, closing the client's stream without an event.
    pub fn hang_up(self) {}
}
