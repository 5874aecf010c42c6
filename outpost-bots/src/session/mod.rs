//! The session actor: one task per managed connection.
//!
//! The actor owns the [`SessionState`], the reconnect timer and the current
//! transport connection. Everything reaches it through one channel:
//! operator commands, connect results and connection events (tagged with
//! the connection generation). Callers hold a cheap [`Session`] handle.
//!
//! Events from the current connection are re-broadcast to window
//! operations; dropping a [`broadcast::Receiver`] is the unsubscribe.
//!
//! The actor runs until every owning handle is gone. Handles given to
//! background tasks do not keep it alive.

pub mod state;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use outpost_sdk::client::{ClientHandle, Connection, Endpoint, Identity, Transport, TransportError};
use outpost_sdk::event::{Event, WindowId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::failover::FailoverRegistry;
use crate::policy::DelayClass;
pub use state::{Effect, Input, ReconnectContext, SessionPolicy, SessionState, Status};

/// Work started on login and aborted when the session leaves ONLINE.
pub type BackgroundTask = Arc<dyn Fn(Session) -> BoxFuture<'static, ()> + Send + Sync>;

/// Point-in-time view published after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: Status,
    pub endpoint: String,
    pub consecutive_fails: u32,
    pub quick_disconnects: u32,
    pub recent_attempts: usize,
    pub context: ReconnectContext,
    pub last_login_at: Option<DateTime<Local>>,
    pub reconnect_at: Option<DateTime<Local>>,
    pub last_disconnect: Option<String>,
    pub blacklisted: Vec<String>,
}

enum SessionCommand {
    Connect,
    Disconnect { done: Option<oneshot::Sender<()>> },
    /// Treat the current connection as lost.
    ForceDrop { reason: String },
}

enum Internal {
    Connected {
        generation: u64,
        result: Result<Connection, TransportError>,
    },
    Event { generation: u64, event: Event },
    Closed { generation: u64 },
    LoginTimeout { generation: u64 },
}

struct Shared {
    identity: Identity,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<Event>,
    client: Mutex<Option<ClientHandle>>,
    /// Last non-inventory window the server opened and has not closed.
    open_window: Mutex<Option<WindowId>>,
    window_busy: AtomicBool,
}

#[derive(Clone)]
enum Link {
    Owner(mpsc::Sender<SessionCommand>),
    Task(mpsc::WeakSender<SessionCommand>),
}

impl Link {
    fn sender(&self) -> Option<mpsc::Sender<SessionCommand>> {
        match self {
            Link::Owner(tx) => Some(tx.clone()),
            Link::Task(weak) => weak.upgrade(),
        }
    }
}

/// Handle to a running session actor. Clones share the actor.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
    link: Link,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tag", &self.inner.identity.tag)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    /// Spawn the actor. The session starts OFFLINE; call [`Session::connect`].
    pub fn spawn(
        identity: Identity,
        registry: FailoverRegistry,
        policy: SessionPolicy,
        transport: Arc<dyn Transport>,
        background: Vec<BackgroundTask>,
    ) -> Session {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);

        let state = SessionState::new(identity.tag.clone(), registry);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&state, None, None));

        let shared = Arc::new(Shared {
            identity,
            snapshot: snapshot_rx,
            events,
            client: Mutex::new(None),
            open_window: Mutex::new(None),
            window_busy: AtomicBool::new(false),
        });

        let actor = Actor {
            shared: shared.clone(),
            commands: cmd_tx.downgrade(),
            state,
            policy,
            transport,
            background,
            running: Vec::new(),
            timer: None,
            cmd_rx,
            internal_tx,
            internal_rx,
            snapshot_tx,
            last_login_at: None,
            reconnect_at: None,
        };
        tokio::spawn(actor.run());
        Session {
            inner: shared,
            link: Link::Owner(cmd_tx),
        }
    }

    async fn send(&self, cmd: SessionCommand) -> bool {
        match self.link.sender() {
            Some(tx) => tx.send(cmd).await.is_ok(),
            None => false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.inner.identity.tag
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn status(&self) -> Status {
        self.inner.snapshot.borrow().status
    }

    pub fn is_online(&self) -> bool {
        self.status() == Status::Online
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver that changes on every transition.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Events of the current connection from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Handle of the current connection, if any.
    pub fn client(&self) -> Option<ClientHandle> {
        self.inner.client.lock().clone()
    }

    /// Window the server currently shows, as far as the session knows.
    pub fn open_window(&self) -> Option<WindowId> {
        *self.inner.open_window.lock()
    }

    pub(crate) fn forget_window(&self, window: WindowId) {
        self.inner.forget_window(window);
    }

    pub(crate) fn window_flag(&self) -> &AtomicBool {
        &self.inner.window_busy
    }

    pub async fn connect(&self) {
        self.send(SessionCommand::Connect).await;
    }

    /// Stop the session and wait until the actor has processed it.
    pub async fn disconnect(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(SessionCommand::Disconnect { done: Some(done) }).await {
            let _ = rx.await;
        }
    }

    /// Close the current connection as if it had dropped with `reason`.
    /// The usual reconnect rules apply afterwards.
    pub async fn force_drop(&self, reason: &str) {
        self.send(SessionCommand::ForceDrop {
            reason: reason.to_string(),
        })
        .await;
    }

    /// Send a chat line or slash command. Requires ONLINE.
    pub async fn dispatch(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::NotConnected);
        }
        let client = self.client().ok_or(TransportError::NotConnected)?;
        client.dispatch(text).await
    }

    /// Wait until the session reports `want`. Returns false on timeout.
    pub async fn wait_for_status(&self, want: Status, timeout: Duration) -> bool {
        let mut rx = self.watch();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.status == want))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl Shared {
    fn forget_window(&self, window: WindowId) {
        let mut open = self.open_window.lock();
        if *open == Some(window) {
            *open = None;
        }
    }
}

struct Actor {
    shared: Arc<Shared>,
    commands: mpsc::WeakSender<SessionCommand>,
    state: SessionState,
    policy: SessionPolicy,
    transport: Arc<dyn Transport>,
    background: Vec<BackgroundTask>,
    running: Vec<JoinHandle<()>>,
    timer: Option<Pin<Box<Sleep>>>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    last_login_at: Option<DateTime<Local>>,
    reconnect_at: Option<DateTime<Local>>,
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Connect) => self.apply(Input::Connect),
                        Some(SessionCommand::Disconnect { done }) => {
                            self.apply(Input::Disconnect);
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                        }
                        Some(SessionCommand::ForceDrop { reason }) => {
                            let generation = self.state.generation;
                            self.apply(Input::Dropped { generation, reason });
                        }
                        None => {
                            tracing::debug!(bot = %self.state.tag, "All handles dropped, stopping");
                            self.apply(Input::Disconnect);
                            break;
                        }
                    }
                }
                Some(msg) = self.internal_rx.recv() => self.on_internal(msg),
                _ = fire(&mut self.timer), if self.timer.is_some() => {
                    self.timer = None;
                    self.reconnect_at = None;
                    self.apply(Input::ReconnectTimerFired);
                }
            }
        }
        self.stop_background();
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected { generation, result } => {
                let current = generation == self.state.generation
                    && self.state.status == Status::Connecting;
                match result {
                    Ok((handle, events)) if current => {
                        *self.shared.client.lock() = Some(handle);
                        self.forward(generation, events);
                    }
                    Ok((handle, _)) => {
                        tokio::spawn(async move {
                            let _ = handle.quit(Some("superseded")).await;
                        });
                    }
                    Err(e) => self.apply(Input::Dropped {
                        generation,
                        reason: e.to_string(),
                    }),
                }
            }
            Internal::Event { generation, event } => {
                if generation != self.state.generation {
                    return;
                }
                match &event {
                    Event::WindowOpened { window, .. } if !window.is_inventory() => {
                        *self.shared.open_window.lock() = Some(*window);
                    }
                    Event::WindowClosed { window } => self.shared.forget_window(*window),
                    _ => {}
                }
                let _ = self.shared.events.send(event.clone());
                match &event {
                    Event::Login { .. } | Event::Spawn => {
                        self.apply(Input::LoggedIn { generation })
                    }
                    ev if ev.is_disconnect() => {
                        let reason = ev.disconnect_reason().unwrap_or_default().to_string();
                        self.apply(Input::Dropped { generation, reason });
                    }
                    _ => {}
                }
            }
            Internal::Closed { generation } => self.apply(Input::Dropped {
                generation,
                reason: "connection closed".to_string(),
            }),
            Internal::LoginTimeout { generation } => self.apply(Input::LoginTimedOut { generation }),
        }
    }

    fn forward(&self, generation: u64, mut events: mpsc::Receiver<Event>) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Event { generation, event }).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Internal::Closed { generation }).await;
        });
    }

    fn apply(&mut self, input: Input) {
        let effects = self.state.apply(input, Instant::now(), &self.policy);
        for effect in effects {
            self.perform(effect);
        }
        self.publish();
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport { endpoint, generation } => self.open(endpoint, generation),
            Effect::CloseTransport { reason } => {
                *self.shared.open_window.lock() = None;
                if let Some(client) = self.shared.client.lock().take() {
                    tokio::spawn(async move {
                        let _ = client.quit(Some(&reason)).await;
                    });
                }
            }
            Effect::ArmReconnect(decision) => {
                self.timer = Some(Box::pin(tokio::time::sleep(decision.delay)));
                self.reconnect_at = chrono::Duration::from_std(decision.delay)
                    .ok()
                    .map(|d| Local::now() + d);
                if decision.class == DelayClass::Suspension {
                    tracing::warn!(
                        bot = %self.state.tag,
                        "Too many reconnect attempts, suspending"
                    );
                }
            }
            Effect::CancelReconnect => {
                self.timer = None;
                self.reconnect_at = None;
            }
            Effect::StartBackground => {
                self.last_login_at = Some(Local::now());
                self.stop_background();
                let session = Session {
                    inner: self.shared.clone(),
                    link: Link::Task(self.commands.clone()),
                };
                for task in &self.background {
                    let work = (task.as_ref())(session.clone());
                    self.running.push(tokio::spawn(work));
                }
            }
            Effect::StopBackground => self.stop_background(),
        }
    }

    fn open(&mut self, endpoint: Endpoint, generation: u64) {
        let connecting = self.transport.connect(&endpoint, &self.shared.identity);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connecting.await;
            let _ = tx.send(Internal::Connected { generation, result }).await;
        });

        // Covers both a hanging connect and a connection that never logs in.
        let tx = self.internal_tx.downgrade();
        let timeout = self.policy.login_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Internal::LoginTimeout { generation }).await;
            }
        });
    }

    fn stop_background(&mut self) {
        for handle in self.running.drain(..) {
            handle.abort();
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(snapshot_of(
            &self.state,
            self.last_login_at,
            self.reconnect_at,
        ));
    }
}

fn snapshot_of(
    state: &SessionState,
    last_login_at: Option<DateTime<Local>>,
    reconnect_at: Option<DateTime<Local>>,
) -> SessionSnapshot {
    let now = Instant::now();
    SessionSnapshot {
        status: state.status,
        endpoint: state.registry.current().to_string(),
        consecutive_fails: state.history.consecutive_fails,
        quick_disconnects: state.history.quick_disconnects,
        recent_attempts: state.history.attempts.len(),
        context: state.context,
        last_login_at,
        reconnect_at,
        last_disconnect: state
            .last_disconnect
            .as_ref()
            .map(|(cause, reason)| format!("{cause:?}: {reason}")),
        blacklisted: state
            .registry
            .blacklisted(now)
            .into_iter()
            .map(|(ep, _)| ep.to_string())
            .collect(),
    }
}
