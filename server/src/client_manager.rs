//! Registry of connected client sessions.
//!
//! The registry is owned by the orchestrator task and only mutated there, so
//! it needs no locking. Each session carries the sending half of that
//! connection's outbound queue; dropping the session closes the queue and lets
//! the writer task finish.

use log::info;
use shared::Message;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Server-side state for one live connection.
#[derive(Debug)]
pub struct ClientSession {
    /// Remote address of the connection, used as the client id
    pub id: String,
    /// Code of the lobby the client is in, if any
    pub lobby: Option<String>,
    /// False until the shared token was presented, when one is configured
    pub authenticated: bool,
    /// When the session was registered
    pub connected_at: Instant,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl ClientSession {
    pub fn new(
        id: String,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
        authenticated: bool,
    ) -> Self {
        Self {
            id,
            lobby: None,
            authenticated,
            connected_at: Instant::now(),
            outbound,
            cancel,
        }
    }

    /// Queues a message for the writer task.
    ///
    /// Delivery is best effort: if the writer is already gone the message is
    /// dropped and `false` is returned.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Returns a handle other tasks (a lobby's game loop) can send through.
    pub fn outbound(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound.clone()
    }

    /// Stops both connection tasks without draining the outbound queue.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Capacity-limited set of sessions keyed by client id.
#[derive(Debug)]
pub struct ClientManager {
    clients: HashMap<String, ClientSession>,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a session.
    ///
    /// The session is handed back when the server is full or the id is
    /// already taken, so the caller can still reach the connection.
    pub fn add_client(&mut self, session: ClientSession) -> Result<(), ClientSession> {
        if self.is_full() || self.clients.contains_key(&session.id) {
            return Err(session);
        }

        info!("Client {} registered", session.id);
        self.clients.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<ClientSession> {
        let session = self.clients.remove(client_id);
        if session.is_some() {
            info!("Client {} removed", client_id);
        }
        session
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientSession> {
        self.clients.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut ClientSession> {
        self.clients.get_mut(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Sends to one client; unknown ids are ignored.
    pub fn send_to(&self, client_id: &str, message: Message) -> bool {
        self.clients
            .get(client_id)
            .map(|session| session.send(message))
            .unwrap_or(false)
    }

    pub fn broadcast<'a, I>(&self, client_ids: I, message: &Message)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for client_id in client_ids {
            self.send_to(client_id, message.clone());
        }
    }

    /// Ids of clients that are connected but not in any lobby.
    pub fn idle_client_ids(&self) -> Vec<String> {
        self.clients
            .values()
            .filter(|session| session.lobby.is_none())
            .map(|session| session.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }
}
