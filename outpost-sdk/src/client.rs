//! Transport contract and the reference line-oriented client.
//!
//! The session layer only ever sees [`Transport`], [`ClientHandle`] and the
//! [`Event`] stream. A transport opens one connection per call to
//! [`Transport::connect`]; the connection lives until its event stream
//! yields a disconnect-class event (or closes) or the handle sends
//! [`Command::Quit`].
//!
//! ## Line transport
//!
//! [`LineTransport`] speaks newline-delimited JSON to a protocol bridge:
//! one serialized [`Command`] per outbound line, one serialized [`Event`]
//! per inbound line. The bridge owns the actual game protocol.
//!
//! ## Reconnection
//!
//! Transports do not reconnect on their own. The session engine decides
//! when and where to reconnect after a disconnect-class event.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::event::{Event, WindowId};

/// A connectable `(host, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Who a session logs in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Operator-facing tag, unique per process.
    pub tag: String,
    /// Account name presented to the server.
    pub username: String,
}

/// Mouse button used for window clicks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Left,
    Right,
}

/// Commands the consumer can send through a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Sent first on every line-transport connection.
    Hello { username: String },
    /// Chat line or slash command.
    Chat { text: String },
    /// Click a slot in an open window.
    Click {
        window: WindowId,
        slot: u32,
        button: Button,
    },
    /// Ask the server to close a window.
    CloseWindow { window: WindowId },
    /// Leave the server.
    Quit { reason: Option<String> },
    /// Keepalive. The bridge answers with any line, usually `pong`.
    Ping,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed")]
    SendFailed,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A live connection: outbound handle plus inbound event stream.
pub type Connection = (ClientHandle, mpsc::Receiver<Event>);

/// Opens connections. Implementations must be cheap to share.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

/// A handle to a running connection.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    pub fn new(cmd_tx: mpsc::Sender<Command>) -> Self {
        Self { cmd_tx }
    }

    /// Send a chat line or slash command.
    pub async fn dispatch(&self, text: &str) -> Result<(), TransportError> {
        self.send(Command::Chat { text: text.to_string() }).await
    }

    pub async fn click(
        &self,
        window: WindowId,
        slot: u32,
        button: Button,
    ) -> Result<(), TransportError> {
        self.send(Command::Click { window, slot, button }).await
    }

    pub async fn close_window(&self, window: WindowId) -> Result<(), TransportError> {
        self.send(Command::CloseWindow { window }).await
    }

    /// Close a window without awaiting. Used from `Drop` paths.
    pub fn try_close_window(&self, window: WindowId) -> Result<(), TransportError> {
        self.cmd_tx
            .try_send(Command::CloseWindow { window })
            .map_err(|_| TransportError::SendFailed)
    }

    pub async fn quit(&self, reason: Option<&str>) -> Result<(), TransportError> {
        self.send(Command::Quit {
            reason: reason.map(|s| s.to_string()),
        })
        .await
    }

    /// True once the connection task has gone away.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    async fn send(&self, cmd: Command) -> Result<(), TransportError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Liveness settings for a line connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Send a ping after this long without inbound data.
    pub interval: Duration,
    /// Give up after this long without inbound data.
    pub timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Newline-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct LineTransport {
    pub connect_timeout: Duration,
    pub keepalive: Keepalive,
}

impl Default for LineTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive: Keepalive::default(),
        }
    }
}

impl Transport for LineTransport {
    fn connect(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let endpoint = endpoint.clone();
        let username = identity.username.clone();
        let connect_timeout = self.connect_timeout;
        let keepalive = self.keepalive;
        Box::pin(async move {
            let addr = endpoint.to_string();
            tracing::debug!("Resolving {addr}...");
            let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await
            {
                Ok(Ok(tcp)) => tcp,
                Ok(Err(e)) => {
                    return Err(TransportError::ConnectionFailed {
                        endpoint: addr,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(TransportError::ConnectionFailed {
                        endpoint: addr,
                        reason: "connect timed out".to_string(),
                    });
                }
            };
            tracing::debug!("TCP connected to {addr}");
            Ok(connect_with_stream(tcp, username, keepalive))
        })
    }
}

/// Run the line protocol over an already-established stream.
///
/// Returns a handle for sending commands and a receiver for events.
/// The protocol runs in a spawned task. A connection that stays silent for
/// `keepalive.timeout` ends with [`Event::End`].
pub fn connect_with_stream<S>(stream: S, username: String, keepalive: Keepalive) -> Connection
where
    S: tokio::io::AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);

    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(stream);
        let lines = BufReader::new(reader).lines();
        if let Err(e) = run_lines(lines, writer, username, keepalive, &event_tx, cmd_rx).await {
            let _ = event_tx
                .send(Event::Error {
                    message: e.to_string(),
                })
                .await;
        }
    });

    (ClientHandle::new(cmd_tx), event_rx)
}

async fn run_lines<R, W>(
    mut lines: Lines<R>,
    mut writer: W,
    username: String,
    keepalive: Keepalive,
    event_tx: &mpsc::Sender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_command(&mut writer, &Command::Hello { username }).await?;

    let mut last_activity = Instant::now();
    let mut next_ping = last_activity + keepalive.interval;
    loop {
        tokio::select! {
            // `next_line` keeps partial input across cancellation.
            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = event_tx.send(Event::End { reason: "EOF".to_string() }).await;
                    break;
                };
                last_activity = Instant::now();
                next_ping = last_activity + keepalive.interval;
                let raw = line.trim_end();
                if raw.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(raw) {
                    Ok(Event::Pong) => {}
                    Ok(event) => {
                        let last = event.is_disconnect();
                        let _ = event_tx.send(event).await;
                        if last {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, line = raw, "Ignoring unparsable line"),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        let quit = matches!(cmd, Command::Quit { .. });
                        write_command(&mut writer, &cmd).await?;
                        if quit {
                            let _ = writer.shutdown().await;
                            let _ = event_tx.send(Event::End { reason: "Client quit".to_string() }).await;
                            break;
                        }
                    }
                    // Every handle dropped: nobody is listening any more.
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(next_ping) => {
                if last_activity.elapsed() >= keepalive.timeout {
                    let _ = event_tx
                        .send(Event::End { reason: "Read timed out".to_string() })
                        .await;
                    break;
                }
                write_command(&mut writer, &Command::Ping).await?;
                next_ping = (Instant::now() + keepalive.interval).min(last_activity + keepalive.timeout);
            }
        }
    }

    Ok(())
}

async fn write_command<W: AsyncWrite + Unpin>(writer: &mut W, cmd: &Command) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(cmd)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn line_protocol_roundtrip() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (handle, mut events) = connect_with_stream(client_side, "steve".to_string(), Keepalive::default());

        let (server_read, mut server_write) = tokio::io::split(server_side);
        let mut server_lines = BufReader::new(server_read).lines();

        let hello = server_lines.next_line().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Command>(&hello).unwrap(),
            Command::Hello { username: "steve".to_string() }
        );

        server_write
            .write_all(b"{\"type\":\"login\",\"username\":\"steve\"}\n")
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Login { username: "steve".to_string() }
        );

        handle.dispatch("/bank").await.unwrap();
        let line = server_lines.next_line().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Command>(&line).unwrap(),
            Command::Chat { text: "/bank".to_string() }
        );

        server_write
            .write_all(b"{\"type\":\"kicked\",\"reason\":\"bye\"}\n")
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Kicked { reason: "bye".to_string() }
        );
        // The connection task stops after a disconnect-class event.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn eof_ends_connection() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (_handle, mut events) = connect_with_stream(client_side, "alex".to_string(), Keepalive::default());
        drop(server_side);
        match events.recv().await.unwrap() {
            Event::End { .. } | Event::Error { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn line_split_across_a_command_is_kept_whole() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (handle, mut events) =
            connect_with_stream(client_side, "steve".to_string(), Keepalive::default());
        let (server_read, mut server_write) = tokio::io::split(server_side);
        let mut server_lines = BufReader::new(server_read).lines();
        server_lines.next_line().await.unwrap().unwrap();

        let line = "{\"type\":\"window_opened\",\"window\":4,\"title\":\"Bank\"}\n";
        let (head, tail) = line.split_at(20);
        server_write.write_all(head.as_bytes()).await.unwrap();
        tokio::task::yield_now().await;

        // The command wakes the select loop while half a line is buffered.
        handle.dispatch("/atm").await.unwrap();
        let sent = server_lines.next_line().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Command>(&sent).unwrap(),
            Command::Chat { text: "/atm".to_string() }
        );

        server_write.write_all(tail.as_bytes()).await.unwrap();
        server_write.write_all(b"{\"type\":\"spawn\"}\n").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::WindowOpened {
                window: crate::event::WindowId(4),
                title: "Bank".to_string(),
                items: Vec::new(),
            }
        );
        assert_eq!(events.recv().await.unwrap(), Event::Spawn);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_pinged_then_dropped() {
        let keepalive = Keepalive {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(25),
        };
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (_handle, mut events) = connect_with_stream(client_side, "alex".to_string(), keepalive);
        let (server_read, mut server_write) = tokio::io::split(server_side);
        let mut server_lines = BufReader::new(server_read).lines();
        server_lines.next_line().await.unwrap().unwrap();

        let ping = server_lines.next_line().await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Command>(&ping).unwrap(), Command::Ping);

        // A pong counts as activity and is not forwarded.
        server_write.write_all(b"{\"type\":\"pong\"}\n").await.unwrap();
        let start = tokio::time::Instant::now();
        let ping = server_lines.next_line().await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Command>(&ping).unwrap(), Command::Ping);
        assert!(start.elapsed() >= Duration::from_secs(9));

        // One more ping, then silence until the timeout.
        let ping = server_lines.next_line().await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Command>(&ping).unwrap(), Command::Ping);
        let end = events.recv().await.unwrap();
        assert_eq!(end, Event::End { reason: "Read timed out".to_string() });
        assert!(start.elapsed() >= Duration::from_secs(24));
        assert!(start.elapsed() < Duration::from_secs(26));
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new("play.example.net", 25565).to_string(), "play.example.net:25565");
    }
}
