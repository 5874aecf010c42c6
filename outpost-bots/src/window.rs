//! Window interactions: open a server-pushed window, read its items, click,
//! refresh, close.
//!
//! One window operation per session at a time. [`open`] takes the session's
//! busy flag and hands it to the returned [`OpenWindow`]; dropping that value
//! closes the window on the server and releases the flag, whatever path the
//! caller took out.
//!
//! Every wait goes through [`wait_for`]: the caller subscribes before it
//! dispatches, and the receiver is dropped (unsubscribed) when the wait's
//! owner goes away.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use outpost_sdk::client::{Button, ClientHandle};
use outpost_sdk::event::{Event, Item, WindowId};
use outpost_sdk::text::strip_formatting;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::error::WindowError;
use crate::session::{Session, SessionSnapshot, Status};

/// Pause after closing a leftover window before dispatching the next command.
pub const PRE_CLOSE_DELAY: Duration = Duration::from_millis(250);
/// How long to wait for items after the open event arrived empty.
pub const CONTENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of [`wait_for`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Matched(T),
    TimedOut,
    /// The connection dropped or the session left ONLINE.
    Disconnected,
}

/// Wait for the first event `matcher` accepts, up to `timeout`.
///
/// Events the matcher rejects are skipped. A disconnect-class event, a
/// closed event stream or a status change away from ONLINE ends the wait
/// with [`WaitOutcome::Disconnected`].
pub async fn wait_for<T, F>(
    events: &mut broadcast::Receiver<Event>,
    status: &mut watch::Receiver<SessionSnapshot>,
    timeout: Duration,
    mut matcher: F,
) -> WaitOutcome<T>
where
    F: FnMut(&Event) -> Option<T>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if let Some(found) = matcher(&event) {
                        return WaitOutcome::Matched(found);
                    }
                    if event.is_disconnect() {
                        return WaitOutcome::Disconnected;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return WaitOutcome::Disconnected,
            },
            changed = status.changed() => {
                if changed.is_err() || status.borrow().status != Status::Online {
                    return WaitOutcome::Disconnected;
                }
            }
            _ = &mut deadline => return WaitOutcome::TimedOut,
        }
    }
}

/// Releases the session's window flag on drop.
struct BusyGuard {
    session: Session,
}

impl BusyGuard {
    fn acquire(session: &Session) -> Option<Self> {
        session
            .window_flag()
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BusyGuard {
                session: session.clone(),
            })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.session.window_flag().store(false, Ordering::SeqCst);
    }
}

/// True when another window operation holds the session.
pub fn is_busy(session: &Session) -> bool {
    session.window_flag().load(Ordering::SeqCst)
}

/// A window opened by [`open`]. Closed on [`OpenWindow::close`] or drop.
pub struct OpenWindow {
    session: Session,
    client: ClientHandle,
    id: WindowId,
    title: String,
    items: Vec<Item>,
    opened_at: Instant,
    events: broadcast::Receiver<Event>,
    status: watch::Receiver<SessionSnapshot>,
    closed: bool,
    // Dropped after `Drop::drop` has sent the close.
    _busy: BusyGuard,
}

impl std::fmt::Debug for OpenWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenWindow")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("items", &self.items.len())
            .finish()
    }
}

fn labels_contain(items: &[Item], hint: &str) -> bool {
    items
        .iter()
        .filter_map(|i| i.label.as_deref())
        .any(|label| strip_formatting(label).contains(hint))
}

/// Dispatch `command` and wait for the window it opens.
///
/// With a `hint`, only a window whose title or item labels contain it is
/// accepted; other windows are ignored and the wait continues. The player
/// inventory never matches.
pub async fn open(
    session: &Session,
    command: &str,
    hint: Option<&str>,
    timeout: Duration,
) -> Result<OpenWindow, WindowError> {
    let tag = session.tag().to_string();
    let busy = BusyGuard::acquire(session).ok_or(WindowError::Busy)?;
    if !session.is_online() {
        return Err(WindowError::NotOnline);
    }
    let client = session.client().ok_or(WindowError::NotOnline)?;

    if let Some(previous) = session.open_window() {
        tracing::debug!(bot = %tag, window = %previous, "Closing leftover window");
        let _ = client.close_window(previous).await;
        session.forget_window(previous);
        tokio::time::sleep(PRE_CLOSE_DELAY).await;
    }

    let mut events = session.subscribe();
    let mut status = session.watch();
    client.dispatch(command).await?;
    tracing::debug!(bot = %tag, %command, "Waiting for window");

    let mut titles: HashMap<WindowId, String> = HashMap::new();
    let outcome = wait_for(&mut events, &mut status, timeout, |event| match event {
        Event::WindowOpened {
            window,
            title,
            items,
        } if !window.is_inventory() => {
            titles.insert(*window, title.clone());
            let accepted = match hint {
                None => true,
                Some(hint) => strip_formatting(title).contains(hint) || labels_contain(items, hint),
            };
            if !accepted {
                tracing::debug!(window = %window, "Not the requested window, still waiting");
            }
            accepted.then(|| (*window, title.clone(), items.clone()))
        }
        Event::WindowContentUpdated { window, items } if !window.is_inventory() => {
            let hint = hint?;
            labels_contain(items, hint).then(|| {
                let title = titles.get(window).cloned().unwrap_or_default();
                (*window, title, items.clone())
            })
        }
        _ => None,
    })
    .await;

    let (id, title, items) = match outcome {
        WaitOutcome::Matched(found) => found,
        WaitOutcome::TimedOut => {
            tracing::warn!(bot = %tag, %command, "No window opened in time");
            return Err(WindowError::OpenTimedOut(timeout));
        }
        WaitOutcome::Disconnected => return Err(WindowError::Disconnected),
    };
    tracing::debug!(bot = %tag, window = %id, %title, items = items.len(), "Window opened");

    let mut window = OpenWindow {
        session: session.clone(),
        client,
        id,
        title,
        items,
        opened_at: Instant::now(),
        events,
        status,
        closed: false,
        _busy: busy,
    };

    if window.occupied().next().is_none() {
        match window.refresh(CONTENT_TIMEOUT).await {
            Ok(_) => {}
            Err(WindowError::ContentTimedOut(_)) => {
                tracing::warn!(bot = %tag, window = %id, "Window stayed empty");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(window)
}

impl OpenWindow {
    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Latest snapshot, including empty slots.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Non-empty entries.
    pub fn occupied(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|i| !i.is_empty())
    }

    /// The non-empty item in `slot`, if any.
    pub fn slot(&self, slot: u32) -> Option<&Item> {
        self.occupied().find(|i| i.slot == slot)
    }

    /// Click a slot. Does not wait for the server's answer; use
    /// [`OpenWindow::refresh`] for the post-click state.
    pub async fn click(&mut self, slot: u32, button: Button) -> Result<(), WindowError> {
        if !self.session.is_online() {
            return Err(WindowError::NotOnline);
        }
        self.drain_pending();
        tracing::debug!(bot = %self.session.tag(), window = %self.id, slot, "Click");
        self.client.click(self.id, slot, button).await?;
        Ok(())
    }

    /// Wait for the next content update of this window.
    pub async fn refresh(&mut self, timeout: Duration) -> Result<&[Item], WindowError> {
        let id = self.id;
        let outcome = wait_for(&mut self.events, &mut self.status, timeout, |event| match event {
            Event::WindowContentUpdated { window, items } if *window == id => Some(items.clone()),
            Event::WindowOpened { window, items, .. } if *window == id && !items.is_empty() => {
                Some(items.clone())
            }
            _ => None,
        })
        .await;
        match outcome {
            WaitOutcome::Matched(items) => {
                self.items = items;
                Ok(&self.items)
            }
            WaitOutcome::TimedOut => Err(WindowError::ContentTimedOut(timeout)),
            WaitOutcome::Disconnected => Err(WindowError::Disconnected),
        }
    }

    /// Close the window and release the session.
    pub async fn close(mut self) {
        self.closed = true;
        let _ = self.client.close_window(self.id).await;
        self.session.forget_window(self.id);
        tracing::debug!(bot = %self.session.tag(), window = %self.id, "Window closed");
    }

    /// Apply updates already buffered so the next refresh sees only what
    /// follows the next click.
    fn drain_pending(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(Event::WindowContentUpdated { window, items }) if window == self.id => {
                    self.items = items;
                }
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    }
}

impl Drop for OpenWindow {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.client.try_close_window(self.id);
        self.session.forget_window(self.id);
        tracing::debug!(bot = %self.session.tag(), window = %self.id, "Window closed on drop");
    }
}
