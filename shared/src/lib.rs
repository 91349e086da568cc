//! Wire protocol and game contracts shared by the snake server and client.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod snake;
pub mod state;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use codec::MessageCodec;
pub use error::ProtoError;
pub use protocol::{decode, encode, Message, MessageKind, PayloadFormat};
pub use state::{GameState, PredictedState};

/// A single sequenced input from one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInput {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub sequence: u32,
    pub input: String,
}

impl ClientInput {
    pub fn new(client_id: &str, sequence: u32, input: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            sequence,
            input: input.to_string(),
        }
    }
}

/// Per-tick broadcast: the authoritative snapshot plus, for every client, the
/// highest input sequence already folded into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStateMessage<T> {
    #[serde(rename = "gameState")]
    pub game_state: T,
    #[serde(rename = "acknowledgedSeq")]
    pub acknowledged_seq: HashMap<String, u32>,
}

impl<T> ServerStateMessage<T> {
    pub fn acknowledged_for(&self, client_id: &str) -> u32 {
        self.acknowledged_seq.get(client_id).copied().unwrap_or(0)
    }
}

/// Payload of join and leave requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyMembership {
    #[serde(rename = "lobbyID")]
    pub lobby_id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    pub countdown: i32,
}

/// One row of a lobbies-synced listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySummary {
    pub id: String,
    #[serde(rename = "ownerClientID")]
    pub owner_client_id: String,
    pub players: usize,
    #[serde(rename = "maxPlayers")]
    pub max_players: usize,
    pub started: bool,
}
