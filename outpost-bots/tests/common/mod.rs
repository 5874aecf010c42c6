//! Shared helpers: sessions against the in-memory transport and a scripted
//! window server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use outpost_bots::failover::FailoverRegistry;
use outpost_bots::session::{BackgroundTask, Session, SessionPolicy, Status};
use outpost_sdk::client::{Command, Endpoint, Identity};
use outpost_sdk::event::{Event, Item, WindowId};
use outpost_sdk::mock::{MockConnection, MockTransport};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to wait for something that should happen right away.
pub const SOON: Duration = Duration::from_secs(1);

pub fn endpoints(hosts: &[&str]) -> Vec<Endpoint> {
    hosts.iter().map(|h| Endpoint::new(*h, 25565)).collect()
}

pub fn spawn_session(
    transport: &MockTransport,
    hosts: &[&str],
    policy: SessionPolicy,
    background: Vec<BackgroundTask>,
) -> Session {
    let registry = FailoverRegistry::new(endpoints(hosts), Duration::from_secs(300))
        .expect("at least one endpoint");
    Session::spawn(
        Identity {
            tag: "bot1".into(),
            username: "Bot_One".into(),
        },
        registry,
        policy,
        Arc::new(transport.clone()),
        background,
    )
}

/// Connect, accept the connection and log in.
pub async fn go_online(session: &Session, transport: &MockTransport) -> MockConnection {
    session.connect().await;
    let conn = transport
        .try_next_connection(SOON)
        .await
        .expect("connect attempt");
    conn.send(Event::Login {
        username: conn.username.clone(),
    })
    .await;
    assert!(session.wait_for_status(Status::Online, SOON).await);
    conn
}

pub fn item(slot: u32, name: &str, label: &str) -> Item {
    Item {
        slot,
        name: name.into(),
        label: Some(label.into()),
        count: 1,
    }
}

/// Serves a connection: every command is recorded and answered with the
/// events `respond` returns.
pub struct FakeServer {
    pub commands: Arc<Mutex<Vec<Command>>>,
    events: mpsc::Sender<Event>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub fn start<F>(mut conn: MockConnection, mut respond: F) -> Self
    where
        F: FnMut(&Command) -> Vec<Event> + Send + 'static,
    {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = commands.clone();
        let events = conn.event_sender();
        let task = tokio::spawn(async move {
            while let Some(cmd) = conn.next_command().await {
                let replies = respond(&cmd);
                log.lock().push(cmd);
                for event in replies {
                    conn.send(event).await;
                }
            }
        });
        Self { commands, events, task }
    }

    /// Send an event unprompted.
    pub async fn push(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn chats(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Chat { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn clicks(&self) -> Vec<u32> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Click { slot, .. } => Some(slot),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<WindowId> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::CloseWindow { window } => Some(window),
                _ => None,
            })
            .collect()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
