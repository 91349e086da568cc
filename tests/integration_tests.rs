//! End-to-end tests over loopback TCP.
//!
//! Each test starts a real server on an ephemeral port and drives it either
//! with raw frames or with the client library.

use client::config::ClientConfig;
use client::game::{ClientStateManager, ReconcileMode};
use client::lobby::LobbyView;
use client::network::{ClientError, ClientEvent, NetworkClient};
use futures_util::{SinkExt, StreamExt};
use server::config::ServerConfig;
use server::game_loop::GameLoop;
use server::network::Server;
use shared::snake::{SnakeGame, SnakeWorld};
use shared::{ClientInput, Message, MessageCodec, MessageKind, PayloadFormat, ServerStateMessage};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_test::assert_ok;

type Events = UnboundedReceiver<ClientEvent<SnakeWorld>>;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        tick_interval: Duration::from_millis(10),
        countdown_step: Duration::from_millis(5),
        world_width: 20,
        world_height: 20,
        food_count: 5,
        seed: Some(42),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (width, height, food) = (config.world_width, config.world_height, config.food_count);
    let server = Server::new(config, move || SnakeGame::new(width, height, food, 42));
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run(listener));
    (addr, shutdown)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_addr: addr.to_string(),
        sync_interval: Duration::from_secs(3600),
        ..ClientConfig::default()
    }
}

async fn connect(addr: SocketAddr) -> (NetworkClient, Events) {
    NetworkClient::connect::<SnakeWorld>(&client_config(addr))
        .await
        .unwrap()
}

/// Waits for the first event matching `wanted`, skipping everything else.
async fn wait_for<F>(events: &mut Events, mut wanted: F) -> ClientEvent<SnakeWorld>
where
    F: FnMut(&ClientEvent<SnakeWorld>) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_lobby(events: &mut Events) -> String {
    match wait_for(events, |e| matches!(e, ClientEvent::LobbyCreated(_))).await {
        ClientEvent::LobbyCreated(code) => code,
        _ => unreachable!(),
    }
}

/// Two clients in one lobby, owner first.
async fn lobby_pair(
    addr: SocketAddr,
) -> ((NetworkClient, Events), (NetworkClient, Events), String) {
    let (owner, mut owner_events) = connect(addr).await;
    let (guest, mut guest_events) = connect(addr).await;

    assert_ok!(owner.create_lobby());
    let code = wait_for_lobby(&mut owner_events).await;

    assert_ok!(guest.join_lobby(&code));
    let guest_id = guest.client_id().to_string();
    for events in [&mut owner_events, &mut guest_events] {
        wait_for(events, |e| *e == ClientEvent::ClientJoined(guest_id.clone())).await;
    }
    ((owner, owner_events), (guest, guest_events), code)
}

async fn start_game(owner: &NetworkClient, guest: &NetworkClient, owner_events: &mut Events) {
    for member in [guest, owner] {
        assert_ok!(member.toggle_ready());
        let id = member.client_id().to_string();
        wait_for(owner_events, |e| *e == ClientEvent::ClientReady(id.clone())).await;
    }
    owner.start_game().unwrap();
}

#[tokio::test]
async fn test_connect_frame_bytes_over_tcp() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let local = stream.local_addr().unwrap().to_string();

    stream.write_all(&[0x02, 0x00, 0x00, 0x00, b'\n']).await.unwrap();

    let mut header = [0u8; 4];
    timeout(WAIT, stream.read_exact(&mut header)).await.unwrap().unwrap();
    assert_eq!(header[0], 0x02);
    assert_eq!(header[1], 0x00);
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;

    let mut rest = vec![0u8; len + 1];
    stream.read_exact(&mut rest).await.unwrap();
    assert_eq!(&rest[..len], local.as_bytes());
    assert_eq!(rest[len], b'\n');

    shutdown.cancel();
}

#[tokio::test]
async fn test_non_connect_first_frame_is_dropped() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, MessageCodec::new());

    framed.send(Message::empty(MessageKind::LobbyCreate)).await.unwrap();

    let next = timeout(WAIT, framed.next()).await.unwrap();
    assert!(next.is_none() || matches!(next, Some(Err(_))));
    shutdown.cancel();
}

#[tokio::test]
async fn test_server_full_rejects_extra_client() {
    let (addr, shutdown) = start_server(ServerConfig {
        max_clients: 1,
        ..fast_config()
    })
    .await;

    let (_first, _events) = connect(addr).await;
    let second = NetworkClient::connect::<SnakeWorld>(&client_config(addr)).await;

    match second {
        Err(ClientError::ServerRejected(reason)) => assert_eq!(reason, "server full"),
        other => panic!("Expected rejection, got {:?}", other.map(|_| ())),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_lobby_list_reflects_created_lobby() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let (owner, mut events) = connect(addr).await;

    assert_ok!(owner.create_lobby());
    let code = wait_for_lobby(&mut events).await;
    owner.sync_lobbies().unwrap();

    let lobbies = match wait_for(&mut events, |e| {
        matches!(e, ClientEvent::LobbiesSynced(list) if !list.is_empty())
    })
    .await
    {
        ClientEvent::LobbiesSynced(list) => list,
        _ => unreachable!(),
    };
    assert_eq!(lobbies.len(), 1);
    assert_eq!(lobbies[0].id, code);
    assert_eq!(lobbies[0].owner_client_id, owner.client_id());
    assert_eq!(lobbies[0].players, 1);
    assert!(!lobbies[0].started);
    shutdown.cancel();
}

#[tokio::test]
async fn test_start_refused_until_everyone_is_ready() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let ((owner, mut owner_events), (_guest, mut guest_events), _code) = lobby_pair(addr).await;

    owner.toggle_ready().unwrap();
    owner.start_game().unwrap();

    for events in [&mut owner_events, &mut guest_events] {
        let event = wait_for(events, |e| matches!(e, ClientEvent::ClientsNotReady(_))).await;
        assert_eq!(
            event,
            ClientEvent::ClientsNotReady("not all clients are ready".to_string())
        );
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_countdown_then_game_start() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let ((owner, mut owner_events), (guest, mut guest_events), _code) = lobby_pair(addr).await;

    start_game(&owner, &guest, &mut owner_events).await;

    for events in [&mut owner_events, &mut guest_events] {
        let mut seen = Vec::new();
        loop {
            match wait_for(events, |e| {
                matches!(e, ClientEvent::Countdown(_) | ClientEvent::GameStarted)
            })
            .await
            {
                ClientEvent::Countdown(n) => seen.push(n),
                _ => break,
            }
        }
        assert_eq!(seen, (0..10).rev().collect::<Vec<_>>());
    }

    let owner_id = owner.client_id().to_string();
    wait_for(&mut owner_events, |e| *e == ClientEvent::GameJoined(owner_id.clone())).await;

    let snapshot = match wait_for(&mut owner_events, |e| {
        matches!(e, ClientEvent::ServerState(_))
    })
    .await
    {
        ClientEvent::ServerState(snapshot) => snapshot,
        _ => unreachable!(),
    };
    assert!(snapshot.game_state.snake(owner.client_id()).is_some());
    assert!(snapshot.game_state.snake(guest.client_id()).is_some());
    assert_eq!(snapshot.acknowledged_for(owner.client_id()), 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_inputs_are_acknowledged_and_reconciled() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let ((owner, mut owner_events), (guest, _guest_events), _code) = lobby_pair(addr).await;

    start_game(&owner, &guest, &mut owner_events).await;
    let owner_id = owner.client_id().to_string();
    wait_for(&mut owner_events, |e| *e == ClientEvent::GameJoined(owner_id.clone())).await;

    let mut state = ClientStateManager::new(SnakeWorld::default(), ReconcileMode::AlwaysAdopt)
        .with_window(Duration::ZERO);
    state.set_client_id(owner.client_id());

    let first = state.apply_local_input("UP").unwrap();
    owner.send_input(&first).unwrap();
    // The server ignores the client id carried on the input.
    owner
        .send_input(&ClientInput::new("someone-else", 2, "LEFT"))
        .unwrap();
    state.apply_local_input("LEFT");

    let snapshot = match wait_for(&mut owner_events, |e| {
        matches!(e, ClientEvent::ServerState(s) if s.acknowledged_for(&owner_id) == 2)
    })
    .await
    {
        ClientEvent::ServerState(snapshot) => snapshot,
        _ => unreachable!(),
    };

    state.reconcile(snapshot.clone());
    assert_eq!(state.pending_inputs(), 0);
    state.update();
    assert_eq!(state.current(), &snapshot.game_state);
    assert_eq!(snapshot.acknowledged_for(guest.client_id()), 0);
    shutdown.cancel();
}

fn latest_snapshot(rx: &mut UnboundedReceiver<Message>) -> ServerStateMessage<SnakeWorld> {
    let mut latest = None;
    while let Ok(message) = rx.try_recv() {
        if message.kind() == MessageKind::ServerState {
            latest = Some(message.decode_payload().unwrap());
        }
    }
    latest.expect("no snapshot broadcast")
}

#[test]
fn test_local_prediction_tracks_authoritative_loop() {
    let tick = Duration::from_millis(33);
    let me = "127.0.0.1:9100";

    // No food, so nothing on the board depends on the server's RNG.
    let mut game_loop = GameLoop::new(
        "TRACK1",
        SnakeGame::new(40, 40, 0, 17),
        tick,
        PayloadFormat::Binary,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    game_loop.join(me, tx);

    let mut state = ClientStateManager::new(SnakeWorld::default(), ReconcileMode::PreserveLocal)
        .with_window(Duration::ZERO)
        .with_tick_interval(tick);
    state.set_client_id(me);

    let start = Instant::now();
    let initial = game_loop.snapshot_message().unwrap().decode_payload().unwrap();
    state.reconcile_at(initial, start);
    state.update_at(start);

    let turns = ["UP", "LEFT", "DOWN", "RIGHT"];
    for i in 1..=20u32 {
        let input = state.apply_local_input(turns[i as usize % turns.len()]).unwrap();
        game_loop.queue_input(input);
        assert_ok!(game_loop.tick(tick.as_secs_f32()));

        let now = start + tick * i;
        state.update_at(now);
        state.reconcile_at(latest_snapshot(&mut rx), now);
    }

    assert_eq!(state.predictions_held(), 20);
    assert_eq!(state.pending_inputs(), 0);
    assert_eq!(
        state.update_at(start + tick * 20).snake(me),
        game_loop.game().world().snake(me)
    );
}

#[tokio::test]
async fn test_duplicate_sequence_is_applied_once() {
    // A roomy board keeps the two snakes from meeting during the test.
    let (addr, shutdown) = start_server(ServerConfig {
        world_width: 100,
        world_height: 100,
        ..fast_config()
    })
    .await;
    let ((owner, mut owner_events), (guest, _guest_events), _code) = lobby_pair(addr).await;

    start_game(&owner, &guest, &mut owner_events).await;
    let owner_id = owner.client_id().to_string();
    wait_for(&mut owner_events, |e| *e == ClientEvent::GameJoined(owner_id.clone())).await;

    assert_ok!(owner.send_input(&ClientInput::new(&owner_id, 1, "UP")));
    assert_ok!(owner.send_input(&ClientInput::new(&owner_id, 1, "LEFT")));

    // Let a few more ticks pass once the first input is acknowledged.
    for _ in 0..3 {
        wait_for(&mut owner_events, |e| {
            matches!(e, ClientEvent::ServerState(s) if s.acknowledged_for(&owner_id) == 1)
        })
        .await;
    }
    let snapshot = match wait_for(&mut owner_events, |e| {
        matches!(e, ClientEvent::ServerState(_))
    })
    .await
    {
        ClientEvent::ServerState(snapshot) => snapshot,
        _ => unreachable!(),
    };

    assert_eq!(snapshot.acknowledged_for(&owner_id), 1);
    let snake = snapshot.game_state.snake(&owner_id).unwrap();
    assert_eq!(snake.direction, shared::snake::Direction::Up);
    shutdown.cancel();
}

#[tokio::test]
async fn test_owner_leaving_promotes_next_member() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let ((owner, mut owner_events), (guest, mut guest_events), code) = lobby_pair(addr).await;
    let owner_id = owner.client_id().to_string();
    let guest_id = guest.client_id().to_string();

    owner.leave_lobby(&code).unwrap();

    wait_for(&mut owner_events, |e| *e == ClientEvent::ClientLeft(owner_id.clone())).await;
    wait_for(&mut guest_events, |e| *e == ClientEvent::ClientLeft(owner_id.clone())).await;
    wait_for(&mut guest_events, |e| *e == ClientEvent::Promoted(guest_id.clone())).await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_kick_removes_member() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let ((owner, mut owner_events), (guest, mut guest_events), code) = lobby_pair(addr).await;
    let guest_id = guest.client_id().to_string();

    let mut view = LobbyView::new(&guest_id);
    view.request_join(&code);
    view.apply(&ClientEvent::<SnakeWorld>::ClientJoined(guest_id.clone()));
    assert!(view.in_lobby());

    // Only the owner may kick.
    guest.kick(owner.client_id()).unwrap();
    owner.kick(&guest_id).unwrap();

    let kicked = wait_for(&mut guest_events, |e| matches!(e, ClientEvent::Kicked(_))).await;
    assert_eq!(kicked, ClientEvent::Kicked(guest_id.clone()));
    view.apply(&kicked);
    assert!(!view.in_lobby());

    wait_for(&mut owner_events, |e| *e == ClientEvent::Kicked(guest_id.clone())).await;

    // The kicked client is free to create its own lobby.
    guest.create_lobby().unwrap();
    let own = wait_for_lobby(&mut guest_events).await;
    assert_ne!(own, code);
    shutdown.cancel();
}

#[tokio::test]
async fn test_ready_toggle_cancels_countdown() {
    let (addr, shutdown) = start_server(ServerConfig {
        countdown_step: Duration::from_millis(300),
        ..fast_config()
    })
    .await;
    let ((owner, mut owner_events), (guest, mut guest_events), _code) = lobby_pair(addr).await;

    start_game(&owner, &guest, &mut owner_events).await;
    wait_for(&mut guest_events, |e| *e == ClientEvent::Countdown(9)).await;
    guest.toggle_ready().unwrap();

    let notice =
        wait_for(&mut owner_events, |e| matches!(e, ClientEvent::ClientsNotReady(_))).await;
    assert_eq!(
        notice,
        ClientEvent::ClientsNotReady("countdown cancelled".to_string())
    );

    // No further ticks from the cancelled countdown.
    let late = timeout(Duration::from_millis(700), async {
        loop {
            match owner_events.recv().await {
                Some(ClientEvent::Countdown(n)) => return Some(n),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await;
    assert!(late.is_err());
    shutdown.cancel();
}

#[tokio::test]
async fn test_last_member_leaving_deletes_lobby() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let (owner, mut owner_events) = connect(addr).await;
    let (_idle, mut idle_events) = connect(addr).await;

    assert_ok!(owner.create_lobby());
    let code = wait_for_lobby(&mut owner_events).await;
    owner.leave_lobby(&code).unwrap();

    wait_for(&mut idle_events, |e| *e == ClientEvent::LobbyDeleted(code.clone())).await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_disconnect_cleans_up_lobby_membership() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let ((owner, mut owner_events), (guest, mut guest_events), _code) = lobby_pair(addr).await;
    let owner_id = owner.client_id().to_string();
    let guest_id = guest.client_id().to_string();

    owner.disconnect();
    owner.closed().await;

    wait_for(&mut guest_events, |e| *e == ClientEvent::ClientLeft(owner_id.clone())).await;
    wait_for(&mut guest_events, |e| *e == ClientEvent::Promoted(guest_id.clone())).await;
    wait_for(&mut owner_events, |e| matches!(e, ClientEvent::Disconnected(_))).await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_auth_required_before_lobby_operations() {
    let (addr, shutdown) = start_server(ServerConfig {
        auth_token: Some("secret".to_string()),
        ..fast_config()
    })
    .await;

    let (anonymous, mut events) = connect(addr).await;
    anonymous.create_lobby().unwrap();
    anonymous.authenticate("wrong").unwrap();
    anonymous.authenticate("secret").unwrap();

    // The rejected create produces nothing, so the ack comes first.
    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(first, ClientEvent::AuthAck(anonymous.client_id().to_string()));

    anonymous.create_lobby().unwrap();
    wait_for_lobby(&mut events).await;

    let (authed, mut authed_events) = NetworkClient::connect::<SnakeWorld>(&ClientConfig {
        auth_token: Some("secret".to_string()),
        ..client_config(addr)
    })
    .await
    .unwrap();
    let ack = wait_for(&mut authed_events, |e| matches!(e, ClientEvent::AuthAck(_))).await;
    assert_eq!(ack, ClientEvent::AuthAck(authed.client_id().to_string()));
    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let (addr, shutdown) = start_server(fast_config()).await;
    let (client, mut events) = connect(addr).await;

    shutdown.cancel();

    wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected(_))).await;
    timeout(WAIT, client.closed()).await.unwrap();
}
