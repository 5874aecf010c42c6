//! Fleet construction, staggered connect, queue routing and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use outpost_bots::config::Config;
use outpost_bots::console::{Console, Flow};
use outpost_bots::manager::{Domain, Fleet, FleetOptions, Target};
use outpost_bots::session::Status;
use outpost_sdk::client::{Command, Endpoint};
use outpost_sdk::event::Event;
use outpost_sdk::mock::MockTransport;

use common::SOON;

const CONFIG: &str = r#"
    [servers.main]
    primary = { host = "main.example", port = 25565 }
    backups = [{ host = "backup.example", port = 25565 }]

    [[bots]]
    tag = "miner"
    username = "Miner_One"
    server = "main"

    [[bots]]
    tag = "trader"
    host = "solo.example"
    port = 25570

    [[bots]]
    tag = "spare"
    server = "main"
    enabled = false

    [[bots]]
    tag = "lost"
    server = "nowhere"
"#;

fn build(transport: &MockTransport) -> Arc<Fleet> {
    let config = Config::parse(CONFIG).unwrap();
    let (specs, errors) = config.resolve();
    assert_eq!(errors.len(), 1);
    Arc::new(Fleet::build(
        &config,
        specs,
        Arc::new(transport.clone()),
        FleetOptions::default(),
    ))
}

/// Accept and log in every connection that arrives within `window`.
async fn accept_all(transport: &MockTransport, window: Duration) -> Vec<outpost_sdk::mock::MockConnection> {
    let mut conns = Vec::new();
    while let Some(conn) = transport.try_next_connection(window).await {
        conn.send(Event::Login { username: conn.username.clone() }).await;
        conns.push(conn);
    }
    conns
}

#[tokio::test(start_paused = true)]
async fn builds_members_in_file_order() {
    let transport = MockTransport::new();
    let fleet = build(&transport);
    let tags: Vec<&str> = fleet.members().iter().map(|m| m.tag()).collect();
    assert_eq!(tags, vec!["miner", "trader", "spare"]);
    assert_eq!(fleet.members()[2].index, 3);
    assert!(!fleet.members()[2].enabled);
    assert_eq!(fleet.members()[0].session.identity().username, "Miner_One");
    assert_eq!(fleet.members()[1].session.identity().username, "trader");

    let (members, unknown) = fleet.resolve(&[Target::Index(2), Target::Tag("miner".into()), Target::Index(9)]);
    let tags: Vec<&str> = members.iter().map(|m| m.tag()).collect();
    assert_eq!(tags, vec!["miner", "trader"]);
    assert_eq!(unknown, vec!["9".to_string()]);
    assert_eq!(fleet.resolve(&[Target::All]).0.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn connects_enabled_bots_staggered() {
    let transport = MockTransport::new();
    let fleet = build(&transport);

    let start = tokio::time::Instant::now();
    let connecting = tokio::spawn({
        let fleet = fleet.clone();
        async move { fleet.connect_enabled().await }
    });

    let first = transport.try_next_connection(SOON).await.unwrap();
    assert_eq!(first.endpoint, Endpoint::new("main.example", 25565));
    assert!(transport.try_next_connection(Duration::from_secs(5)).await.is_none());
    let second = transport.try_next_connection(Duration::from_secs(2)).await.unwrap();
    assert_eq!(second.endpoint, Endpoint::new("solo.example", 25570));
    assert!(start.elapsed() >= Duration::from_secs(6));

    connecting.await.unwrap();
    assert!(transport.try_next_connection(Duration::from_secs(30)).await.is_none());
    assert_eq!(fleet.members()[2].session.status(), Status::Offline);
}

#[tokio::test(start_paused = true)]
async fn enqueue_requires_online_session() {
    let transport = MockTransport::new();
    let fleet = build(&transport);
    let miner = &fleet.members()[0];

    assert!(!fleet.enqueue(miner, Domain::Bank, "noop", async { Ok(()) }));

    miner.session.connect().await;
    let _conns = accept_all(&transport, SOON).await;
    assert!(miner.session.wait_for_status(Status::Online, SOON).await);
    assert!(fleet.enqueue(miner, Domain::Warp, "noop", async { Ok(()) }));
    assert!(miner.warp_queue.wait_for_completion(SOON).await);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_then_disconnects() {
    let transport = MockTransport::new();
    let fleet = build(&transport);
    fleet.connect_enabled().await;
    let mut conns = accept_all(&transport, SOON).await;
    assert_eq!(conns.len(), 2);
    let miner = &fleet.members()[0];
    assert!(miner.session.wait_for_status(Status::Online, SOON).await);

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    assert!(fleet.enqueue(miner, Domain::Bank, "slow", async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let _ = done_tx.send(());
        Ok(())
    }));
    assert!(fleet.enqueue(miner, Domain::Bank, "never runs", async {
        anyhow::bail!("dropped on shutdown")
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    fleet.shutdown().await;
    assert!(done_rx.await.is_ok());
    assert!(fleet.is_shutting_down());
    assert!(miner.bank_queue.is_empty());
    for member in fleet.members() {
        assert_eq!(member.session.status(), Status::Stopped);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    for conn in &mut conns {
        let commands = conn.drain_commands();
        assert!(commands.iter().any(|c| matches!(c, Command::Quit { .. })));
    }

    // Nothing new after shutdown.
    assert!(!fleet.enqueue(miner, Domain::Bank, "late", async { Ok(()) }));
}

#[tokio::test(start_paused = true)]
async fn console_routes_to_selected_and_targeted_bots() {
    let transport = MockTransport::new();
    let fleet = build(&transport);
    fleet.connect_enabled().await;
    let mut conns = accept_all(&transport, SOON).await;
    assert!(fleet.members()[1].session.wait_for_status(Status::Online, SOON).await);

    let mut console = Console::new(fleet.clone());
    assert_eq!(console.selected(), Some("miner"));

    assert_eq!(console.handle("/spawn").await.unwrap(), Flow::Continue);
    assert_eq!(console.handle("/home @2").await.unwrap(), Flow::Continue);
    assert_eq!(console.handle("//hub").await.unwrap(), Flow::Continue);
    console.handle("bot trader").await.unwrap();
    assert_eq!(console.selected(), Some("trader"));
    assert!(console.handle("bot nobody").await.is_err());
    assert!(console.handle("dance").await.is_err());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let chats = |conn: &mut outpost_sdk::mock::MockConnection| -> Vec<String> {
        conn.drain_commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Chat { text } => Some(text),
                _ => None,
            })
            .collect()
    };
    assert_eq!(chats(&mut conns[0]), vec!["/spawn", "/hub"]);
    assert_eq!(chats(&mut conns[1]), vec!["/home", "/hub"]);

    console.handle("disconnect @all").await.unwrap();
    assert_eq!(fleet.members()[0].session.status(), Status::Stopped);
    assert_eq!(console.handle("exit").await.unwrap(), Flow::Exit);
}

#[tokio::test(start_paused = true)]
async fn console_connect_returns_before_staggering_ends() {
    let transport = MockTransport::new();
    let fleet = build(&transport);
    let mut console = Console::new(fleet.clone());

    let start = tokio::time::Instant::now();
    assert_eq!(console.handle("connect @all").await.unwrap(), Flow::Continue);
    assert_eq!(start.elapsed(), Duration::ZERO);
    // The prompt still answers while bots are being connected.
    assert_eq!(console.handle("bot trader").await.unwrap(), Flow::Continue);

    let first = transport.try_next_connection(SOON).await.unwrap();
    assert_eq!(first.endpoint, Endpoint::new("main.example", 25565));
    let second = transport.try_next_connection(Duration::from_secs(7)).await.unwrap();
    assert_eq!(second.endpoint, Endpoint::new("solo.example", 25570));
    let third = transport.try_next_connection(Duration::from_secs(7)).await.unwrap();
    assert_eq!(third.endpoint, Endpoint::new("main.example", 25565));
    assert!(start.elapsed() >= Duration::from_secs(12));
}

#[tokio::test(start_paused = true)]
async fn console_switches_auto_withdraw() {
    let transport = MockTransport::new();
    let fleet = build(&transport);
    let miner = &fleet.members()[0];
    assert!(!miner.auto_withdraw.is_enabled());

    miner.session.connect().await;
    let conn = transport.try_next_connection(SOON).await.unwrap();
    conn.send(Event::Login { username: conn.username.clone() }).await;
    assert!(miner.session.wait_for_status(Status::Online, SOON).await);
    let server = common::FakeServer::start(conn, |cmd| match cmd {
        Command::Chat { text } if text == "/atm" => vec![Event::WindowOpened {
            window: outpost_sdk::event::WindowId(3),
            title: "ATM".into(),
            items: vec![common::item(13, "paper", "Balance $100")],
        }],
        _ => Vec::new(),
    });

    let mut console = Console::new(fleet.clone());
    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    assert!(server.chats().is_empty());

    console.handle("autowithdraw on @miner").await.unwrap();
    assert!(miner.auto_withdraw.is_enabled());
    console.handle("autowithdraw status").await.unwrap();
    tokio::time::sleep(Duration::from_secs(15 * 60 + 5)).await;
    assert!(miner.bank_queue.wait_for_completion(Duration::from_secs(30)).await);
    assert_eq!(server.chats(), vec!["/atm".to_string()]);

    console.handle("autowithdraw off @1").await.unwrap();
    assert!(!miner.auto_withdraw.is_enabled());
    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    assert_eq!(server.chats(), vec!["/atm".to_string()]);
}
