//! Lobby bookkeeping: membership, readiness, ownership and the countdown.
//!
//! A `Lobby` is plain data owned by the orchestrator. It never talks to the
//! network itself; the orchestrator reads the outcome of each operation and
//! decides what to broadcast.

use rand::Rng;
use shared::{LobbySummary, ProtoError};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::game_loop::GameHandle;

pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const CODE_LEN: usize = 6;

/// Routing failures. None of these end the connection; the request is
/// logged and dropped.
#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("lobby {0} not found")]
    LobbyNotFound(String),
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("client is not in a lobby")]
    NotInLobby,
    #[error("client is already in lobby {0}")]
    AlreadyInLobby(String),
    #[error("lobby {0} is full")]
    LobbyFull(String),
    #[error("only the lobby owner may do this")]
    NotOwner,
    #[error("lobby {0} has already started")]
    AlreadyStarted(String),
    #[error("lobby {0} is already counting down")]
    CountdownInProgress(String),
    #[error("lobby {0} has no running game")]
    GameNotStarted(String),
    #[error("client has not authenticated")]
    NotAuthenticated,
    #[error("invalid auth token")]
    BadToken,
    #[error("bad payload: {0}")]
    Payload(#[from] ProtoError),
}

/// Draws random codes until one is not taken.
pub fn generate_code<R, F>(rng: &mut R, is_taken: F) -> String
where
    R: Rng + ?Sized,
    F: Fn(&str) -> bool,
{
    loop {
        let code: String = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        if !is_taken(&code) {
            return code;
        }
    }
}

#[derive(Debug)]
struct Countdown {
    epoch: u64,
    remaining: i32,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct Lobby {
    pub id: String,
    owner: String,
    // Join order; used to pick the next owner.
    members: Vec<String>,
    ready: HashMap<String, bool>,
    max_players: usize,
    started: bool,
    countdown: Option<Countdown>,
    game: Option<GameHandle>,
}

impl Lobby {
    pub fn new(id: String, owner: &str, max_players: usize) -> Self {
        let mut ready = HashMap::new();
        ready.insert(owner.to_string(), false);
        Self {
            id,
            owner: owner.to_string(),
            members: vec![owner.to_string()],
            ready,
            max_players: max_players.max(1),
            started: false,
            countdown: None,
            game: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.members.iter().any(|m| m == client_id)
    }

    pub fn is_owner(&self, client_id: &str) -> bool {
        self.owner == client_id
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_players
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_ready(&self, client_id: &str) -> bool {
        self.ready.get(client_id).copied().unwrap_or(false)
    }

    pub fn add_member(&mut self, client_id: &str) -> Result<(), LobbyError> {
        if self.contains(client_id) {
            return Err(LobbyError::AlreadyInLobby(self.id.clone()));
        }
        if self.is_full() {
            return Err(LobbyError::LobbyFull(self.id.clone()));
        }
        self.members.push(client_id.to_string());
        self.ready.insert(client_id.to_string(), false);
        Ok(())
    }

    /// Removes a member. Returns the new owner when the owner left and
    /// someone is still in the lobby.
    pub fn remove_member(&mut self, client_id: &str) -> Option<String> {
        self.members.retain(|m| m != client_id);
        self.ready.remove(client_id);

        if self.owner != client_id {
            return None;
        }
        let next = self.members.first()?.clone();
        self.owner = next.clone();
        Some(next)
    }

    pub fn set_owner(&mut self, client_id: &str) -> Result<(), LobbyError> {
        if !self.contains(client_id) {
            return Err(LobbyError::ClientNotFound(client_id.to_string()));
        }
        self.owner = client_id.to_string();
        Ok(())
    }

    /// Flips a member's ready flag and returns the new value.
    pub fn toggle_ready(&mut self, client_id: &str) -> Result<bool, LobbyError> {
        let flag = self
            .ready
            .get_mut(client_id)
            .ok_or_else(|| LobbyError::ClientNotFound(client_id.to_string()))?;
        *flag = !*flag;
        Ok(*flag)
    }

    pub fn all_ready(&self) -> bool {
        self.members.iter().all(|m| self.is_ready(m))
    }

    pub fn begin_countdown(&mut self, epoch: u64, start: i32, cancel: CancellationToken) {
        self.countdown = Some(Countdown {
            epoch,
            remaining: start,
            cancel,
        });
    }

    pub fn is_counting_down(&self) -> bool {
        self.countdown.is_some()
    }

    pub fn countdown_remaining(&self) -> Option<i32> {
        self.countdown.as_ref().map(|c| c.remaining)
    }

    /// Stops a running countdown. Returns whether one was running.
    pub fn cancel_countdown(&mut self) -> bool {
        match self.countdown.take() {
            Some(countdown) => {
                countdown.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Decrements the countdown started under `epoch` and returns the new
    /// value. Ticks from a cancelled countdown yield `None`.
    pub fn countdown_tick(&mut self, epoch: u64) -> Option<i32> {
        let countdown = self.countdown.as_mut().filter(|c| c.epoch == epoch)?;
        countdown.remaining -= 1;
        let remaining = countdown.remaining;
        if remaining <= 0 {
            self.countdown = None;
        }
        Some(remaining.max(0))
    }

    pub fn mark_started(&mut self, game: GameHandle) {
        self.started = true;
        self.game = Some(game);
    }

    pub fn game(&self) -> Option<&GameHandle> {
        self.game.as_ref()
    }

    /// Stops the countdown and the game loop, if any.
    pub fn shutdown(&mut self) {
        self.cancel_countdown();
        if let Some(game) = self.game.take() {
            game.stop();
        }
    }

    pub fn summary(&self) -> LobbySummary {
        LobbySummary {
            id: self.id.clone(),
            owner_client_id: self.owner.clone(),
            players: self.members.len(),
            max_players: self.max_players,
            started: self.started,
        }
    }
}
