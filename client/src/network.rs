//! Client network agent.
//!
//! Performs the `connect` handshake, then runs a writer task draining the
//! outbound queue, a reader task turning frames into [`ClientEvent`]s, and a
//! timer that periodically asks for the lobby list. All outbound operations
//! are fire-and-forget enqueues.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use shared::{
    ClientInput, Countdown, LobbyMembership, LobbySummary, Message, MessageCodec, MessageKind,
    PayloadFormat, ProtoError, ServerStateMessage,
};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingClientId,
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("server rejected the connection: {0}")]
    ServerRejected(String),
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("not connected")]
    NotConnected,
}

/// Inbound server messages, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<S> {
    AuthAck(String),
    /// A `connect` after the handshake: a game loop took this client in.
    GameJoined(String),
    LobbyCreated(String),
    LobbyDeleted(String),
    LobbiesSynced(Vec<LobbySummary>),
    ClientJoined(String),
    ClientLeft(String),
    ClientReady(String),
    ClientsNotReady(String),
    Promoted(String),
    Kicked(String),
    Countdown(i32),
    GameStarted,
    ServerState(ServerStateMessage<S>),
    Disconnected(Option<String>),
}

/// Maps a frame to an event. Kinds a client never receives map to `None`.
pub fn decode_event<S: DeserializeOwned>(
    message: &Message,
) -> Result<Option<ClientEvent<S>>, ProtoError> {
    let text = || message.payload_text().map(str::to_string);

    let event = match message.kind() {
        MessageKind::AuthAck => ClientEvent::AuthAck(text()?),
        MessageKind::Connect => ClientEvent::GameJoined(text()?),
        MessageKind::LobbyCreated => ClientEvent::LobbyCreated(text()?),
        MessageKind::LobbyDeleted => ClientEvent::LobbyDeleted(text()?),
        MessageKind::LobbiesSynced => ClientEvent::LobbiesSynced(message.decode_payload()?),
        MessageKind::LobbyClientJoin => ClientEvent::ClientJoined(text()?),
        MessageKind::LobbyClientLeave => ClientEvent::ClientLeft(text()?),
        MessageKind::LobbyClientReady => ClientEvent::ClientReady(text()?),
        MessageKind::LobbyClientsNotReady => ClientEvent::ClientsNotReady(text()?),
        MessageKind::LobbyPromoted => ClientEvent::Promoted(text()?),
        MessageKind::LobbyKicked => ClientEvent::Kicked(text()?),
        MessageKind::LobbyGameStarted => match message.format() {
            PayloadFormat::Text => ClientEvent::GameStarted,
            _ => ClientEvent::Countdown(message.decode_payload::<Countdown>()?.countdown),
        },
        MessageKind::ServerState => ClientEvent::ServerState(message.decode_payload()?),
        MessageKind::Disconnect => ClientEvent::Disconnected(Some(text()?)),
        other => {
            debug!("Ignoring {:?} from server", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Handle to a live connection. Dropping it does not close the connection;
/// call [`NetworkClient::disconnect`].
#[derive(Debug, Clone)]
pub struct NetworkClient {
    client_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    input_format: PayloadFormat,
}

impl NetworkClient {
    /// Connects over TCP and completes the handshake.
    pub async fn connect<S>(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent<S>>), ClientError>
    where
        S: DeserializeOwned + Send + 'static,
    {
        info!("Connecting to {}", config.server_addr);
        let stream = TcpStream::connect(&config.server_addr).await?;
        stream.set_nodelay(true)?;
        Self::connect_with(stream, config).await
    }

    /// Runs the handshake over an already open stream.
    pub async fn connect_with<T, S>(
        stream: T,
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent<S>>), ClientError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        S: DeserializeOwned + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, MessageCodec::new());
        let mut writer = FramedWrite::new(write_half, MessageCodec::new());

        let handshake = async {
            writer.send(Message::empty(MessageKind::Connect)).await?;
            state_tx.send_replace(ConnectionState::AwaitingClientId);
            let client_id = await_client_id(&mut reader).await?;
            Ok::<_, ClientError>(client_id)
        };
        let client_id = match timeout(config.handshake_timeout, handshake).await {
            Ok(Ok(client_id)) => client_id,
            Ok(Err(e)) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ClientError::HandshakeTimeout);
            }
        };

        state_tx.send_replace(ConnectionState::Connected);
        info!("Connected as {}", client_id);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_writer(writer, outbound_rx, cancel.clone()));
        tokio::spawn(run_reader(reader, event_tx, state_tx, cancel.clone()));
        tokio::spawn(run_lobby_sync(
            outbound_tx.clone(),
            config.sync_interval,
            cancel.clone(),
        ));

        let client = Self {
            client_id,
            outbound: outbound_tx,
            state: state_rx,
            cancel,
            input_format: config.input_format,
        };
        if let Some(token) = &config.auth_token {
            client.authenticate(token)?;
        }
        Ok((client, event_rx))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel that follows the connection state.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Resolves once the connection has started shutting down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::NotConnected)
    }

    fn send_text(&self, kind: MessageKind, text: &str) -> Result<(), ClientError> {
        self.send(Message::text(kind, text)?)
    }

    pub fn send_input(&self, input: &ClientInput) -> Result<(), ClientError> {
        self.send(Message::structured(
            MessageKind::ClientInput,
            self.input_format,
            input,
        )?)
    }

    pub fn authenticate(&self, token: &str) -> Result<(), ClientError> {
        self.send_text(MessageKind::Auth, token)
    }

    pub fn create_lobby(&self) -> Result<(), ClientError> {
        self.send(Message::empty(MessageKind::LobbyCreate))
    }

    pub fn sync_lobbies(&self) -> Result<(), ClientError> {
        self.send(Message::empty(MessageKind::LobbiesSync))
    }

    pub fn join_lobby(&self, lobby_id: &str) -> Result<(), ClientError> {
        self.send_membership(MessageKind::LobbyClientJoin, lobby_id)
    }

    pub fn leave_lobby(&self, lobby_id: &str) -> Result<(), ClientError> {
        self.send_membership(MessageKind::LobbyClientLeave, lobby_id)
    }

    fn send_membership(&self, kind: MessageKind, lobby_id: &str) -> Result<(), ClientError> {
        let membership = LobbyMembership {
            lobby_id: lobby_id.to_string(),
            client_id: self.client_id.clone(),
        };
        self.send(Message::structured(kind, PayloadFormat::Json, &membership)?)
    }

    pub fn toggle_ready(&self) -> Result<(), ClientError> {
        self.send(Message::empty(MessageKind::LobbyClientReady))
    }

    /// Owner-only on the server; not checked here.
    pub fn kick(&self, client_id: &str) -> Result<(), ClientError> {
        self.send_text(MessageKind::LobbyKick, client_id)
    }

    pub fn promote(&self, client_id: &str) -> Result<(), ClientError> {
        self.send_text(MessageKind::LobbyPromote, client_id)
    }

    pub fn start_game(&self) -> Result<(), ClientError> {
        self.send(Message::empty(MessageKind::LobbyGameStart))
    }

    /// Queues a `disconnect` frame; the writer stops after sending it.
    pub fn disconnect(&self) {
        if self.send(Message::empty(MessageKind::Disconnect)).is_err() {
            self.cancel.cancel();
        }
    }
}

async fn await_client_id<R>(reader: &mut FramedRead<R, MessageCodec>) -> Result<String, ClientError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(message)) => match message.kind() {
                MessageKind::Connect => return Ok(message.payload_text()?.to_string()),
                MessageKind::Disconnect => {
                    return Err(ClientError::ServerRejected(
                        message.payload_text()?.to_string(),
                    ))
                }
                other => debug!("Ignoring {:?} during handshake", other),
            },
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::ClosedDuringHandshake),
        }
    }
}

async fn run_writer<W>(
    mut writer: FramedWrite<W, MessageCodec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => {
                    let last = message.kind() == MessageKind::Disconnect;
                    if let Err(e) = writer.send(message).await {
                        warn!("Write failed: {}", e);
                        break;
                    }
                    if last {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.close().await;
    cancel.cancel();
}

async fn run_reader<T, S>(
    mut reader: FramedRead<ReadHalf<T>, MessageCodec>,
    events: mpsc::UnboundedSender<ClientEvent<S>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) where
    T: AsyncRead,
    S: DeserializeOwned,
{
    let mut reason = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(message)) => match decode_event::<S>(&message) {
                    Ok(Some(ClientEvent::Disconnected(why))) => {
                        reason = why;
                        break;
                    }
                    Ok(Some(event)) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Bad {:?} payload from server: {}", message.kind(), e),
                },
                Some(Err(e)) => {
                    warn!("Connection desynchronized: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    state.send_replace(ConnectionState::Disconnected);
    info!("Disconnected{}", reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default());
    let _ = events.send(ClientEvent::Disconnected(reason));
}

async fn run_lobby_sync(
    outbound: mpsc::UnboundedSender<Message>,
    every: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut timer = interval(every.max(std::time::Duration::from_millis(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                if outbound.send(Message::empty(MessageKind::LobbiesSync)).is_err() {
                    break;
                }
            }
        }
    }
}
