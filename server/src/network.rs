//! Server network layer: per-connection reader/writer tasks and the lobby
//! orchestrator that owns the client registry and all lobbies.
//!
//! Connection tasks never touch shared state. They forward decoded frames to
//! the orchestrator as [`ServerMessage`]s and drain an outbound queue that the
//! orchestrator (and, once a game runs, the lobby's game loop) writes into.

use crate::client_manager::{ClientManager, ClientSession};
use crate::config::ServerConfig;
use crate::game_loop::{GameLoop, LoopCommand};
use crate::lobby::{generate_code, Lobby, LobbyError};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{
    ClientInput, Countdown, GameState, LobbyMembership, LobbySummary, Message, MessageCodec,
    MessageKind, PayloadFormat,
};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

pub const SERVER_FULL_REASON: &str = "server full";
pub const NOT_READY_REASON: &str = "not all clients are ready";
pub const COUNTDOWN_CANCELLED_REASON: &str = "countdown cancelled";
pub const STARTED_TEXT: &str = "started";

/// Events delivered to the orchestrator task.
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        client_id: String,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    },
    MessageReceived {
        client_id: String,
        message: Message,
    },
    Disconnected {
        client_id: String,
    },
    CountdownTick {
        lobby_id: String,
        epoch: u64,
    },
}

/// Builds a fresh simulation for each lobby that starts a game.
pub type GameFactory<G> = Box<dyn Fn() -> G + Send>;

/// Lobby orchestrator. Owns every piece of mutable server state and is only
/// ever driven from its own task.
pub struct Server<G: GameState> {
    config: ServerConfig,
    clients: ClientManager,
    lobbies: HashMap<String, Lobby>,
    new_game: GameFactory<G>,
    rng: StdRng,
    next_epoch: u64,
    shutdown: CancellationToken,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl<G: GameState> Server<G> {
    pub fn new<F>(config: ServerConfig, new_game: F) -> Self
    where
        F: Fn() -> G + Send + 'static,
    {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            clients: ClientManager::new(config.max_clients),
            config,
            lobbies: HashMap::new(),
            new_game: Box::new(new_game),
            rng,
            next_epoch: 0,
            shutdown: CancellationToken::new(),
            server_tx,
            server_rx,
        }
    }

    /// Cancelling this token stops the accept loop, every connection and
    /// every game loop, then makes [`Server::run`] return.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn lobby_count(&self) -> usize {
        self.lobbies.len()
    }

    pub fn lobby(&self, lobby_id: &str) -> Option<&Lobby> {
        self.lobbies.get(lobby_id)
    }

    /// Accepts connections on `listener` and runs the orchestrator until
    /// shutdown.
    pub async fn run(mut self, listener: TcpListener) -> io::Result<()> {
        info!("Server listening on {}", listener.local_addr()?);
        self.spawn_acceptor(listener);

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Server shutting down");
                    break;
                }
                message = self.server_rx.recv() => match message {
                    Some(message) => self.handle_server_message(message),
                    None => break,
                },
            }
        }

        for lobby in self.lobbies.values_mut() {
            lobby.shutdown();
        }
        Ok(())
    }

    /// Spawns task that accepts connections and starts their session tasks
    fn spawn_acceptor(&self, listener: TcpListener) {
        let server_tx = self.server_tx.clone();
        let shutdown = self.shutdown.clone();
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            tokio::spawn(handle_connection(
                                stream,
                                addr.to_string(),
                                server_tx.clone(),
                                idle_timeout,
                                shutdown.child_token(),
                            ));
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                }
            }
        });
    }

    pub fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected {
                client_id,
                outbound,
                cancel,
            } => self.register(client_id, outbound, cancel),
            ServerMessage::MessageReceived { client_id, message } => {
                let kind = message.kind();
                if let Err(e) = self.dispatch(&client_id, &message) {
                    warn!("{:?} from {} ignored: {}", kind, client_id, e);
                }
            }
            ServerMessage::Disconnected { client_id } => self.unregister(&client_id),
            ServerMessage::CountdownTick { lobby_id, epoch } => {
                if let Err(e) = self.advance_countdown(&lobby_id, epoch) {
                    error!("Countdown for lobby {} failed: {}", lobby_id, e);
                }
            }
        }
    }

    fn register(
        &mut self,
        client_id: String,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) {
        let authenticated = !self.config.requires_auth();
        let session = ClientSession::new(client_id.clone(), outbound, cancel, authenticated);

        match self.clients.add_client(session) {
            Ok(()) => match Message::text(MessageKind::Connect, &client_id) {
                Ok(ack) => {
                    self.clients.send_to(&client_id, ack);
                }
                Err(e) => error!("Failed to build connect ack for {}: {}", client_id, e),
            },
            Err(session) => {
                warn!(
                    "Rejecting {}: {} of {} clients connected",
                    session.id,
                    self.clients.len(),
                    self.config.max_clients
                );
                if let Ok(notice) = Message::text(MessageKind::Disconnect, SERVER_FULL_REASON) {
                    session.send(notice);
                }
                // Dropping the session closes the queue once the notice is written.
            }
        }
    }

    fn unregister(&mut self, client_id: &str) {
        let Some(session) = self.clients.remove_client(client_id) else {
            debug!("Disconnect for unregistered connection {}", client_id);
            return;
        };
        session.close();

        if let Some(code) = &session.lobby {
            let result = Message::text(MessageKind::LobbyClientLeave, client_id)
                .map_err(LobbyError::from)
                .and_then(|notice| self.remove_from_lobby(code, client_id, notice));
            if let Err(e) = result {
                warn!("Cleanup of {} in lobby {} failed: {}", client_id, code, e);
            }
        }
    }

    fn dispatch(&mut self, client_id: &str, message: &Message) -> Result<(), LobbyError> {
        let authenticated = self.session(client_id)?.authenticated;

        match message.kind() {
            MessageKind::Auth => return self.authenticate(client_id, message),
            _ if !authenticated => return Err(LobbyError::NotAuthenticated),
            _ => {}
        }

        match message.kind() {
            MessageKind::LobbyCreate => self.create_lobby(client_id),
            MessageKind::LobbyClientJoin => self.join_lobby(client_id, message),
            MessageKind::LobbyClientLeave => self.leave_lobby(client_id),
            MessageKind::LobbyClientReady => self.toggle_ready(client_id),
            MessageKind::LobbyGameStart => self.start_game(client_id),
            MessageKind::LobbyPromote => self.promote(client_id, message),
            MessageKind::LobbyKick => self.kick(client_id, message),
            MessageKind::LobbiesSync => self.sync_lobbies(client_id),
            MessageKind::ClientInput => self.forward_input(client_id, message),
            other => {
                debug!("Unexpected {:?} from {}", other, client_id);
                Ok(())
            }
        }
    }

    fn session(&self, client_id: &str) -> Result<&ClientSession, LobbyError> {
        self.clients
            .get(client_id)
            .ok_or_else(|| LobbyError::ClientNotFound(client_id.to_string()))
    }

    fn current_lobby(&self, client_id: &str) -> Result<String, LobbyError> {
        self.session(client_id)?
            .lobby
            .clone()
            .ok_or(LobbyError::NotInLobby)
    }

    fn authenticate(&mut self, client_id: &str, message: &Message) -> Result<(), LobbyError> {
        let token = message.payload_text()?;
        if let Some(expected) = &self.config.auth_token {
            if token != expected.as_str() {
                return Err(LobbyError::BadToken);
            }
        }

        let session = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| LobbyError::ClientNotFound(client_id.to_string()))?;
        session.authenticated = true;
        session.send(Message::text(MessageKind::AuthAck, client_id)?);
        info!("{} authenticated", client_id);
        Ok(())
    }

    fn create_lobby(&mut self, client_id: &str) -> Result<(), LobbyError> {
        if let Some(current) = &self.session(client_id)?.lobby {
            return Err(LobbyError::AlreadyInLobby(current.clone()));
        }

        let lobbies = &self.lobbies;
        let code = generate_code(&mut self.rng, |candidate| lobbies.contains_key(candidate));
        let created = Message::text(MessageKind::LobbyCreated, &code)?;

        self.lobbies.insert(
            code.clone(),
            Lobby::new(code.clone(), client_id, self.config.max_players),
        );
        if let Some(session) = self.clients.get_mut(client_id) {
            session.lobby = Some(code.clone());
        }

        info!("{} created lobby {}", client_id, code);
        self.clients.send_to(client_id, created);
        Ok(())
    }

    fn join_lobby(&mut self, client_id: &str, message: &Message) -> Result<(), LobbyError> {
        // The session id wins over whatever client id the payload names.
        let code = match message.format() {
            PayloadFormat::Text => message.payload_text()?.trim().to_string(),
            _ => message.decode_payload::<LobbyMembership>()?.lobby_id,
        };

        let session = self.session(client_id)?;
        if let Some(current) = &session.lobby {
            return Err(LobbyError::AlreadyInLobby(current.clone()));
        }
        let outbound = session.outbound();

        let lobby = find_lobby(&mut self.lobbies, &code)?;
        lobby.add_member(client_id)?;
        let cancelled = lobby.cancel_countdown();
        if let Some(session) = self.clients.get_mut(client_id) {
            session.lobby = Some(code.clone());
        }

        info!("{} joined lobby {}", client_id, code);
        self.clients.broadcast(
            lobby.members(),
            &Message::text(MessageKind::LobbyClientJoin, client_id)?,
        );
        if cancelled {
            self.clients
                .broadcast(lobby.members(), &countdown_cancelled_notice()?);
        }
        if let Some(game) = lobby.game() {
            game.send(LoopCommand::Join {
                client_id: client_id.to_string(),
                outbound,
            });
        }
        Ok(())
    }

    fn leave_lobby(&mut self, client_id: &str) -> Result<(), LobbyError> {
        let code = self.current_lobby(client_id)?;
        let notice = Message::text(MessageKind::LobbyClientLeave, client_id)?;
        self.remove_from_lobby(&code, client_id, notice)
    }

    /// Shared exit path for leave, kick and disconnect. `notice` goes to every
    /// member, the departing client included, before it is removed.
    fn remove_from_lobby(
        &mut self,
        code: &str,
        client_id: &str,
        notice: Message,
    ) -> Result<(), LobbyError> {
        let lobby = find_lobby(&mut self.lobbies, code)?;
        if !lobby.contains(client_id) {
            return Err(LobbyError::ClientNotFound(client_id.to_string()));
        }

        self.clients.broadcast(lobby.members(), &notice);
        let cancelled = lobby.cancel_countdown();
        let new_owner = lobby.remove_member(client_id);
        if let Some(game) = lobby.game() {
            game.send(LoopCommand::Leave {
                client_id: client_id.to_string(),
            });
        }
        if let Some(session) = self.clients.get_mut(client_id) {
            session.lobby = None;
        }
        info!("{} left lobby {}", client_id, code);

        if lobby.is_empty() {
            return self.destroy_lobby(code);
        }

        if cancelled {
            self.clients
                .broadcast(lobby.members(), &countdown_cancelled_notice()?);
        }
        if let Some(owner) = new_owner {
            info!("{} is the new owner of lobby {}", owner, code);
            self.clients.broadcast(
                lobby.members(),
                &Message::text(MessageKind::LobbyPromoted, &owner)?,
            );
        }
        Ok(())
    }

    fn destroy_lobby(&mut self, code: &str) -> Result<(), LobbyError> {
        if let Some(mut lobby) = self.lobbies.remove(code) {
            lobby.shutdown();
            info!("Lobby {} destroyed", code);

            let notice = Message::text(MessageKind::LobbyDeleted, code)?;
            self.clients
                .broadcast(&self.clients.idle_client_ids(), &notice);
        }
        Ok(())
    }

    fn toggle_ready(&mut self, client_id: &str) -> Result<(), LobbyError> {
        let code = self.current_lobby(client_id)?;
        let lobby = find_lobby(&mut self.lobbies, &code)?;

        let ready = lobby.toggle_ready(client_id)?;
        let cancelled = lobby.cancel_countdown();
        debug!("{} ready={} in lobby {}", client_id, ready, code);

        self.clients.broadcast(
            lobby.members(),
            &Message::text(MessageKind::LobbyClientReady, client_id)?,
        );
        if cancelled {
            self.clients
                .broadcast(lobby.members(), &countdown_cancelled_notice()?);
        }
        Ok(())
    }

    fn start_game(&mut self, client_id: &str) -> Result<(), LobbyError> {
        let code = self.current_lobby(client_id)?;
        let lobby = find_lobby(&mut self.lobbies, &code)?;

        if !lobby.is_owner(client_id) {
            return Err(LobbyError::NotOwner);
        }
        if lobby.is_started() {
            return Err(LobbyError::AlreadyStarted(code));
        }
        if lobby.is_counting_down() {
            return Err(LobbyError::CountdownInProgress(code));
        }

        if !lobby.all_ready() {
            info!("Start of lobby {} refused: not all clients ready", code);
            self.clients.broadcast(
                lobby.members(),
                &Message::text(MessageKind::LobbyClientsNotReady, NOT_READY_REASON)?,
            );
            return Ok(());
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let cancel = self.shutdown.child_token();
        lobby.begin_countdown(epoch, self.config.countdown_start, cancel.clone());

        spawn_countdown(
            self.server_tx.clone(),
            code.clone(),
            epoch,
            self.config.countdown_start,
            self.config.countdown_step,
            cancel,
        );
        info!("Lobby {} counting down", code);
        Ok(())
    }

    fn advance_countdown(&mut self, code: &str, epoch: u64) -> Result<(), LobbyError> {
        let Some(lobby) = self.lobbies.get_mut(code) else {
            return Ok(());
        };
        let Some(remaining) = lobby.countdown_tick(epoch) else {
            return Ok(());
        };

        let countdown = Message::structured(
            MessageKind::LobbyGameStarted,
            PayloadFormat::Json,
            &Countdown {
                countdown: remaining,
            },
        )?;
        self.clients.broadcast(lobby.members(), &countdown);
        if remaining > 0 {
            return Ok(());
        }

        self.clients.broadcast(
            lobby.members(),
            &Message::text(MessageKind::LobbyGameStarted, STARTED_TEXT)?,
        );

        let game_loop = GameLoop::new(
            code,
            (self.new_game)(),
            self.config.tick_interval,
            self.config.snapshot_format,
        );
        let handle = game_loop.spawn(self.shutdown.child_token());
        for member in lobby.members() {
            if let Some(session) = self.clients.get(member) {
                handle.send(LoopCommand::Join {
                    client_id: member.clone(),
                    outbound: session.outbound(),
                });
            }
        }
        lobby.mark_started(handle);
        info!(
            "Lobby {} started with {} players",
            code,
            lobby.members().len()
        );
        Ok(())
    }

    fn promote(&mut self, client_id: &str, message: &Message) -> Result<(), LobbyError> {
        let target = message.payload_text()?.trim().to_string();
        let code = self.current_lobby(client_id)?;
        let lobby = find_lobby(&mut self.lobbies, &code)?;

        if !lobby.is_owner(client_id) {
            return Err(LobbyError::NotOwner);
        }
        lobby.set_owner(&target)?;

        info!("{} promoted {} in lobby {}", client_id, target, code);
        self.clients.broadcast(
            lobby.members(),
            &Message::text(MessageKind::LobbyPromoted, &target)?,
        );
        Ok(())
    }

    fn kick(&mut self, client_id: &str, message: &Message) -> Result<(), LobbyError> {
        let target = message.payload_text()?.trim().to_string();
        let code = self.current_lobby(client_id)?;
        let lobby = find_lobby(&mut self.lobbies, &code)?;

        if !lobby.is_owner(client_id) {
            return Err(LobbyError::NotOwner);
        }
        if !lobby.contains(&target) {
            return Err(LobbyError::ClientNotFound(target));
        }

        info!("{} kicked {} from lobby {}", client_id, target, code);
        let notice = Message::text(MessageKind::LobbyKicked, &target)?;
        self.remove_from_lobby(&code, &target, notice)
    }

    fn sync_lobbies(&mut self, client_id: &str) -> Result<(), LobbyError> {
        let mut summaries: Vec<LobbySummary> = self.lobbies.values().map(Lobby::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));

        let synced =
            Message::structured(MessageKind::LobbiesSynced, PayloadFormat::Json, &summaries)?;
        self.clients.send_to(client_id, synced);
        Ok(())
    }

    fn forward_input(&mut self, client_id: &str, message: &Message) -> Result<(), LobbyError> {
        let mut input: ClientInput = message.decode_payload()?;
        input.client_id = client_id.to_string();

        let code = self.current_lobby(client_id)?;
        let lobby = self
            .lobbies
            .get(&code)
            .ok_or_else(|| LobbyError::LobbyNotFound(code.clone()))?;
        let game = lobby
            .game()
            .ok_or_else(|| LobbyError::GameNotStarted(code.clone()))?;

        game.send(LoopCommand::Input(input));
        Ok(())
    }
}

fn find_lobby<'a>(
    lobbies: &'a mut HashMap<String, Lobby>,
    code: &str,
) -> Result<&'a mut Lobby, LobbyError> {
    lobbies
        .get_mut(code)
        .ok_or_else(|| LobbyError::LobbyNotFound(code.to_string()))
}

fn countdown_cancelled_notice() -> Result<Message, LobbyError> {
    Ok(Message::text(
        MessageKind::LobbyClientsNotReady,
        COUNTDOWN_CANCELLED_REASON,
    )?)
}

/// Spawns task that emits one countdown tick per step, the first right away.
fn spawn_countdown(
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    lobby_id: String,
    epoch: u64,
    ticks: i32,
    step: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = interval(step.max(Duration::from_millis(1)));
        for _ in 0..ticks {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = timer.tick() => {
                    let tick = ServerMessage::CountdownTick { lobby_id: lobby_id.clone(), epoch };
                    if server_tx.send(tick).is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// Drives one client connection.
///
/// The first frame must be `connect`; anything else closes the stream. After
/// that the connection is registered with the orchestrator, a writer task
/// drains the outbound queue, and this task keeps reading until the peer
/// disconnects, a frame fails to decode, the idle timeout passes, or `cancel`
/// fires. Every exit path ends in a single `Disconnected` event.
pub async fn handle_connection<S>(
    stream: S,
    client_id: String,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, MessageCodec::new());
    let mut writer = FramedWrite::new(write_half, MessageCodec::new());

    match timeout(idle_timeout, reader.next()).await {
        Ok(Some(Ok(message))) if message.kind() == MessageKind::Connect => {}
        Ok(Some(Ok(message))) => {
            warn!(
                "{} sent {:?} before connect, closing",
                client_id,
                message.kind()
            );
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("Bad handshake frame from {}: {}", client_id, e);
            return;
        }
        Ok(None) => return,
        Err(_) => {
            warn!("{} never sent connect", client_id);
            return;
        }
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let registered = server_tx.send(ServerMessage::Connected {
        client_id: client_id.clone(),
        outbound: outbound_tx,
        cancel: cancel.clone(),
    });
    if registered.is_err() {
        return;
    }

    let writer_cancel = cancel.clone();
    let writer_id = client_id.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_cancel.cancelled() => break,
                message = outbound_rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = writer.send(message).await {
                            warn!("Write to {} failed: {}", writer_id, e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.close().await;
        writer_cancel.cancel();
        debug!("Writer for {} finished", writer_id);
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = timeout(idle_timeout, reader.next()) => match frame {
                Ok(Some(Ok(message))) => {
                    if message.kind() == MessageKind::Disconnect {
                        info!("{} disconnected", client_id);
                        break;
                    }
                    let forwarded = server_tx.send(ServerMessage::MessageReceived {
                        client_id: client_id.clone(),
                        message,
                    });
                    if forwarded.is_err() {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!("Dropping {}: {}", client_id, e);
                    break;
                }
                Ok(None) => {
                    info!("{} closed the connection", client_id);
                    break;
                }
                Err(_) => {
                    warn!("{} idle for {:?}, dropping", client_id, idle_timeout);
                    break;
                }
            },
        }
    }

    cancel.cancel();
    let _ = server_tx.send(ServerMessage::Disconnected { client_id });
}
