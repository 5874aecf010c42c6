//! Session actor against the in-memory transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use outpost_bots::session::{BackgroundTask, ReconnectContext, SessionPolicy, Status};
use outpost_sdk::client::Command;
use outpost_sdk::event::Event;
use outpost_sdk::mock::MockTransport;

use common::{SOON, endpoints, go_online, spawn_session};

#[tokio::test(start_paused = true)]
async fn reconnects_after_drop_with_base_delay() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let conn = go_online(&session, &transport).await;

    // Stable for two minutes, then the server goes away.
    tokio::time::sleep(Duration::from_secs(120)).await;
    conn.send(Event::End {
        reason: "Server closed".into(),
    })
    .await;
    assert!(session.wait_for_status(Status::Offline, SOON).await);
    assert_eq!(session.snapshot().quick_disconnects, 0);

    // Nothing before the base delay.
    assert!(transport.try_next_connection(Duration::from_secs(14)).await.is_none());
    let again = transport.try_next_connection(Duration::from_secs(2)).await;
    assert!(again.is_some());
    assert_eq!(session.status(), Status::Connecting);
    assert_eq!(transport.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn hang_up_counts_as_disconnect() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let conn = go_online(&session, &transport).await;
    conn.hang_up();
    assert!(session.wait_for_status(Status::Offline, SOON).await);
    assert!(session.snapshot().reconnect_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn quick_disconnect_is_counted() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let conn = go_online(&session, &transport).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    conn.send(Event::Kicked {
        reason: "Server restarting".into(),
    })
    .await;
    assert!(session.wait_for_status(Status::Offline, SOON).await);
    assert_eq!(session.snapshot().quick_disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn failover_rotates_through_endpoints() {
    let transport = MockTransport::new();
    let hosts = endpoints(&["a", "b", "c"]);
    transport.refuse(&hosts[0]);
    transport.refuse(&hosts[1]);
    let session = spawn_session(&transport, &["a", "b", "c"], SessionPolicy::default(), Vec::new());

    session.connect().await;
    let conn = transport
        .try_next_connection(Duration::from_secs(600))
        .await
        .expect("third endpoint accepted");
    assert_eq!(conn.endpoint, hosts[2]);
    assert_eq!(transport.attempts(), hosts);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.consecutive_fails, 2);
    assert_eq!(snapshot.blacklisted.len(), 2);

    conn.send(Event::Spawn).await;
    assert!(session.wait_for_status(Status::Online, SOON).await);
    assert_eq!(session.snapshot().consecutive_fails, 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_between_failures() {
    let transport = MockTransport::new();
    transport.refuse_all(true);
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    session.connect().await;

    // Attempts at 0s, then after 15s, 30s and 60s.
    let start = tokio::time::Instant::now();
    for (at, expected) in [(1, 1), (14, 1), (16, 2), (44, 2), (46, 3), (104, 3), (106, 4)] {
        tokio::time::sleep_until(start + Duration::from_secs(at)).await;
        assert_eq!(transport.attempts().len(), expected, "at {at}s");
    }
    assert_eq!(session.status(), Status::Offline);
    assert_eq!(session.snapshot().consecutive_fails, 4);
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_stops_for_good() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let mut conn = go_online(&session, &transport).await;

    session.disconnect().await;
    assert_eq!(session.status(), Status::Stopped);
    assert!(matches!(
        conn.next_command().await,
        Some(Command::Quit { .. })
    ));

    // Late events from the old connection change nothing.
    conn.send(Event::Kicked { reason: "bye".into() }).await;
    conn.send(Event::Login { username: "Bot_One".into() }).await;
    assert!(transport.try_next_connection(Duration::from_secs(3600)).await.is_none());
    assert_eq!(session.status(), Status::Stopped);

    // Idempotent.
    session.disconnect().await;
    assert_eq!(session.status(), Status::Stopped);

    // Only an explicit connect leaves STOPPED.
    go_online(&session, &transport).await;
}

#[tokio::test(start_paused = true)]
async fn authentication_error_is_terminal() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let conn = go_online(&session, &transport).await;
    conn.send(Event::Kicked {
        reason: "Authentication error: bad token".into(),
    })
    .await;
    assert!(session.wait_for_status(Status::Stopped, SOON).await);
    assert!(transport.try_next_connection(Duration::from_secs(3600)).await.is_none());
    assert_eq!(transport.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_login_waits_configured_delay() {
    let transport = MockTransport::new();
    let policy = SessionPolicy {
        duplicate_login_retry: Some(Duration::from_secs(60 * 60)),
        ..SessionPolicy::default()
    };
    let session = spawn_session(&transport, &["a"], policy, Vec::new());
    let conn = go_online(&session, &transport).await;

    conn.send(Event::Kicked {
        reason: "You logged in from another location".into(),
    })
    .await;
    assert!(session.wait_for_status(Status::Offline, SOON).await);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.context, ReconnectContext::DuplicateLogin);
    assert_eq!(snapshot.recent_attempts, 0);

    assert!(transport.try_next_connection(Duration::from_secs(59 * 60)).await.is_none());
    assert!(transport.try_next_connection(Duration::from_secs(2 * 60)).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn duplicate_login_without_retry_stops() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let conn = go_online(&session, &transport).await;
    conn.send(Event::Kicked {
        reason: "multiplayer.disconnect.duplicate_login".into(),
    })
    .await;
    assert!(session.wait_for_status(Status::Stopped, SOON).await);
    assert_eq!(session.snapshot().context, ReconnectContext::DuplicateLogin);
}

#[tokio::test(start_paused = true)]
async fn connect_while_online_is_ignored() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let _conn = go_online(&session, &transport).await;
    session.connect().await;
    assert!(transport.try_next_connection(SOON).await.is_none());
    assert_eq!(transport.attempts().len(), 1);
    assert_eq!(session.status(), Status::Online);
}

#[tokio::test(start_paused = true)]
async fn background_work_follows_online_state() {
    let transport = MockTransport::new();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    let background: BackgroundTask = Arc::new(move |_session| {
        let counter = counter.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
        .boxed()
    });
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), vec![background]);
    assert_eq!(ticks.load(Ordering::SeqCst), 0);

    let conn = go_online(&session, &transport).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let while_online = ticks.load(Ordering::SeqCst);
    assert!(while_online >= 3);

    conn.send(Event::End { reason: "bye".into() }).await;
    assert!(session.wait_for_status(Status::Offline, SOON).await);
    let at_drop = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    // The reconnect has not succeeded, so the loop stays stopped.
    assert!(ticks.load(Ordering::SeqCst) <= at_drop + 1);
}

#[tokio::test(start_paused = true)]
async fn raw_dispatch_requires_online() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    assert!(session.dispatch("/spawn").await.is_err());

    let mut conn = go_online(&session, &transport).await;
    session.dispatch("/spawn").await.unwrap();
    assert_eq!(
        conn.next_command().await,
        Some(Command::Chat { text: "/spawn".into() })
    );
}

#[tokio::test(start_paused = true)]
async fn silent_connection_times_out_and_fails_over() {
    let transport = MockTransport::new();
    let policy = SessionPolicy {
        login_timeout: Duration::from_secs(60),
        ..SessionPolicy::default()
    };
    let session = spawn_session(&transport, &["a", "b"], policy, Vec::new());
    session.connect().await;

    // Accepted but never logs in.
    let mut first = transport.try_next_connection(SOON).await.unwrap();
    assert_eq!(first.endpoint, endpoints(&["a"])[0]);
    tokio::time::sleep(Duration::from_secs(55)).await;
    assert_eq!(session.status(), Status::Connecting);

    assert!(session.wait_for_status(Status::Offline, Duration::from_secs(10)).await);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.consecutive_fails, 1);
    assert_eq!(snapshot.blacklisted, vec!["a:25565".to_string()]);
    assert!(snapshot.last_disconnect.unwrap().contains("login timed out"));
    assert!(matches!(first.next_command().await, Some(Command::Quit { .. })));

    let second = transport.try_next_connection(Duration::from_secs(20)).await.unwrap();
    assert_eq!(second.endpoint, endpoints(&["b"])[0]);
    second.send(Event::Login { username: second.username.clone() }).await;
    assert!(session.wait_for_status(Status::Online, SOON).await);

    // The timer of an established connection never fires a drop.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(session.status(), Status::Online);
}

#[tokio::test(start_paused = true)]
async fn forced_drop_reconnects() {
    let transport = MockTransport::new();
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), Vec::new());
    let mut conn = go_online(&session, &transport).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    session.force_drop("stuck in connect").await;
    assert!(session.wait_for_status(Status::Offline, SOON).await);
    assert!(matches!(conn.next_command().await, Some(Command::Quit { .. })));
    assert!(transport.try_next_connection(Duration::from_secs(20)).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_stops_the_actor() {
    let transport = MockTransport::new();
    // Background work holds its own handle for as long as it runs.
    let background: BackgroundTask = Arc::new(|session| {
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let _ = session.status();
            }
        }
        .boxed()
    });
    let session = spawn_session(&transport, &["a"], SessionPolicy::default(), vec![background]);
    let mut conn = go_online(&session, &transport).await;
    let mut watch = session.watch();

    drop(session);
    assert!(matches!(conn.next_command().await, Some(Command::Quit { .. })));
    // The actor is gone once the snapshot sender closes.
    let closed = tokio::time::timeout(SOON, async {
        while watch.changed().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(watch.borrow().status, Status::Stopped);
}
