//! Local view of the lobby this client is in.

use shared::LobbySummary;
use std::collections::HashMap;

use crate::network::ClientEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyPhase {
    Idle,
    Waiting,
    Countdown(i32),
    Playing,
}

#[derive(Debug, Clone)]
pub struct LobbyView {
    local_id: String,
    lobby_id: Option<String>,
    // Code asked for with `join` but not confirmed yet.
    requested: Option<String>,
    owner: Option<String>,
    members: Vec<String>,
    ready: HashMap<String, bool>,
    phase: LobbyPhase,
    available: Vec<LobbySummary>,
}

impl LobbyView {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            lobby_id: None,
            requested: None,
            owner: None,
            members: Vec::new(),
            ready: HashMap::new(),
            phase: LobbyPhase::Idle,
            available: Vec::new(),
        }
    }

    pub fn lobby_id(&self) -> Option<&str> {
        self.lobby_id.as_deref()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn is_ready(&self, client_id: &str) -> bool {
        self.ready.get(client_id).copied().unwrap_or(false)
    }

    pub fn available(&self) -> &[LobbySummary] {
        &self.available
    }

    pub fn in_lobby(&self) -> bool {
        self.lobby_id.is_some()
    }

    pub fn is_owner(&self) -> bool {
        self.owner.as_deref() == Some(self.local_id.as_str())
    }

    /// Steering only means something while a game is running.
    pub fn is_playing(&self) -> bool {
        self.phase == LobbyPhase::Playing
    }

    /// Whether `event` takes this client out of its lobby and any game in
    /// it. Must be checked before the event is applied.
    pub fn is_departure<S>(&self, event: &ClientEvent<S>) -> bool {
        match event {
            ClientEvent::ClientLeft(id) | ClientEvent::Kicked(id) => *id == self.local_id,
            ClientEvent::LobbyDeleted(code) => self.lobby_id.as_deref() == Some(code.as_str()),
            ClientEvent::Disconnected(_) => true,
            _ => false,
        }
    }

    /// Remembers a code so the join broadcast can be matched to it.
    pub fn request_join(&mut self, code: &str) {
        self.requested = Some(code.to_string());
    }

    fn enter(&mut self, code: String) {
        self.requested = None;
        self.lobby_id = Some(code);
        self.ready.clear();
        self.phase = LobbyPhase::Waiting;
    }

    fn clear(&mut self) {
        self.lobby_id = None;
        self.requested = None;
        self.owner = None;
        self.members.clear();
        self.ready.clear();
        self.phase = LobbyPhase::Idle;
    }

    fn refresh_owner(&mut self) {
        let Some(code) = self.lobby_id.as_deref() else {
            return;
        };
        if let Some(summary) = self.available.iter().find(|s| s.id == code) {
            self.owner = Some(summary.owner_client_id.clone());
            if summary.started && self.phase == LobbyPhase::Waiting {
                self.phase = LobbyPhase::Playing;
            }
        }
    }

    /// Folds a server event into the view. Returns whether anything changed.
    pub fn apply<S>(&mut self, event: &ClientEvent<S>) -> bool {
        match event {
            ClientEvent::LobbyCreated(code) => {
                self.enter(code.clone());
                self.owner = Some(self.local_id.clone());
                self.members = vec![self.local_id.clone()];
                true
            }
            ClientEvent::ClientJoined(id) => {
                if *id == self.local_id {
                    match self.requested.take() {
                        Some(code) => self.enter(code),
                        None if self.in_lobby() => {}
                        None => return false,
                    }
                    self.refresh_owner();
                }
                if !self.members.contains(id) {
                    self.members.push(id.clone());
                }
                true
            }
            ClientEvent::ClientLeft(id) | ClientEvent::Kicked(id) => {
                if *id == self.local_id {
                    self.clear();
                } else {
                    self.members.retain(|m| m != id);
                    self.ready.remove(id);
                }
                true
            }
            ClientEvent::Promoted(id) => {
                self.owner = Some(id.clone());
                true
            }
            ClientEvent::ClientReady(id) => {
                if !self.in_lobby() {
                    return false;
                }
                let flag = self.ready.entry(id.clone()).or_insert(false);
                *flag = !*flag;
                true
            }
            ClientEvent::LobbyDeleted(code) => {
                self.available.retain(|s| &s.id != code);
                if self.lobby_id.as_deref() == Some(code.as_str()) {
                    self.clear();
                }
                true
            }
            ClientEvent::LobbiesSynced(lobbies) => {
                self.available = lobbies.clone();
                self.refresh_owner();
                true
            }
            ClientEvent::Countdown(remaining) => {
                self.phase = LobbyPhase::Countdown(*remaining);
                true
            }
            ClientEvent::ClientsNotReady(_) => {
                // Covers a cancelled countdown as well.
                if matches!(self.phase, LobbyPhase::Countdown(_)) {
                    self.phase = LobbyPhase::Waiting;
                }
                true
            }
            ClientEvent::GameStarted | ClientEvent::GameJoined(_) => {
                self.phase = LobbyPhase::Playing;
                true
            }
            ClientEvent::Disconnected(_) => {
                self.clear();
                true
            }
            ClientEvent::AuthAck(_) | ClientEvent::ServerState(_) => false,
        }
    }
}
