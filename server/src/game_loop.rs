//! Authoritative per-lobby tick loop.
//!
//! Every tick applies each player's queued inputs in sequence order, advances
//! the simulation once, and broadcasts the snapshot together with every
//! player's last applied sequence number.

use log::{debug, error, info, warn};
use shared::{
    ClientInput, GameState, Message, MessageKind, PayloadFormat, ProtoError, ServerStateMessage,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Commands the orchestrator sends to a running loop.
#[derive(Debug)]
pub enum LoopCommand {
    Join {
        client_id: String,
        outbound: mpsc::UnboundedSender<Message>,
    },
    Leave {
        client_id: String,
    },
    Input(ClientInput),
}

/// Orchestrator-side handle to a spawned loop.
#[derive(Debug)]
pub struct GameHandle {
    commands: mpsc::UnboundedSender<LoopCommand>,
    cancel: CancellationToken,
}

impl GameHandle {
    pub fn send(&self, command: LoopCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// One player's input queue inside a running game.
#[derive(Debug)]
struct PlayerSlot {
    outbound: mpsc::UnboundedSender<Message>,
    last_applied: u32,
    pending: Vec<ClientInput>,
}

impl PlayerSlot {
    fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outbound,
            last_applied: 0,
            pending: Vec::new(),
        }
    }
}

pub struct GameLoop<G: GameState> {
    lobby_id: String,
    game: G,
    players: BTreeMap<String, PlayerSlot>,
    tick_interval: Duration,
    snapshot_format: PayloadFormat,
    tick: u64,
    binary_fallback_logged: bool,
}

impl<G: GameState> GameLoop<G> {
    pub fn new(
        lobby_id: &str,
        game: G,
        tick_interval: Duration,
        snapshot_format: PayloadFormat,
    ) -> Self {
        Self {
            lobby_id: lobby_id.to_string(),
            game,
            players: BTreeMap::new(),
            tick_interval,
            snapshot_format,
            tick: 0,
            binary_fallback_logged: false,
        }
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Adds a player, creates its entity and acknowledges with its id.
    pub fn join(&mut self, client_id: &str, outbound: mpsc::UnboundedSender<Message>) {
        if self.players.contains_key(client_id) {
            debug!("{} is already playing in {}", client_id, self.lobby_id);
            return;
        }

        self.game.init_entity(client_id);
        match Message::text(MessageKind::Connect, client_id) {
            Ok(ack) => {
                let _ = outbound.send(ack);
            }
            Err(e) => error!("Failed to build connect ack for {}: {}", client_id, e),
        }
        self.players
            .insert(client_id.to_string(), PlayerSlot::new(outbound));
        info!("{} joined game in lobby {}", client_id, self.lobby_id);
    }

    /// Removes a player, its entity and anything still queued for it.
    pub fn leave(&mut self, client_id: &str) {
        if self.players.remove(client_id).is_some() {
            self.game.remove_entity(client_id);
            info!("{} left game in lobby {}", client_id, self.lobby_id);
        }
    }

    pub fn queue_input(&mut self, input: ClientInput) {
        match self.players.get_mut(&input.client_id) {
            Some(slot) => slot.pending.push(input),
            None => debug!(
                "Dropping input from {} not playing in {}",
                input.client_id, self.lobby_id
            ),
        }
    }

    pub fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Join {
                client_id,
                outbound,
            } => self.join(&client_id, outbound),
            LoopCommand::Leave { client_id } => self.leave(&client_id),
            LoopCommand::Input(input) => self.queue_input(input),
        }
    }

    /// Applies queued inputs newer than each player's last applied sequence.
    /// Stale and duplicate sequence numbers are dropped.
    pub fn process_inputs(&mut self) {
        for slot in self.players.values_mut() {
            slot.pending.sort_by_key(|input| input.sequence);
            for input in slot.pending.drain(..) {
                if input.sequence > slot.last_applied {
                    self.game.apply(&input);
                    slot.last_applied = input.sequence;
                }
            }
        }
    }

    pub fn acknowledged(&self) -> HashMap<String, u32> {
        self.players
            .iter()
            .map(|(id, slot)| (id.clone(), slot.last_applied))
            .collect()
    }

    /// Builds the broadcast for the current tick. A JSON snapshot that no
    /// longer fits in one frame is sent as binary instead.
    pub fn snapshot_message(&self) -> Result<Message, ProtoError> {
        let state = ServerStateMessage {
            game_state: self.game.snapshot(),
            acknowledged_seq: self.acknowledged(),
        };
        match Message::structured(MessageKind::ServerState, self.snapshot_format, &state) {
            Err(ProtoError::PayloadTooLarge(_)) if self.snapshot_format == PayloadFormat::Json => {
                Message::structured(MessageKind::ServerState, PayloadFormat::Binary, &state)
            }
            result => result,
        }
    }

    /// Runs one full tick: inputs, simulation, broadcast.
    pub fn tick(&mut self, dt: f32) -> Result<(), ProtoError> {
        self.process_inputs();
        self.game.advance(dt);
        self.tick += 1;

        let message = self.snapshot_message()?;
        if message.format() != self.snapshot_format && !self.binary_fallback_logged {
            warn!(
                "Lobby {} snapshot outgrew a {:?} frame, broadcasting {:?}",
                self.lobby_id,
                self.snapshot_format,
                message.format()
            );
            self.binary_fallback_logged = true;
        }
        for slot in self.players.values() {
            // A closed queue means the player is on its way out.
            let _ = slot.outbound.send(message.clone());
        }
        Ok(())
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LoopCommand>,
        cancel: CancellationToken,
    ) {
        let mut tick_interval = interval(self.tick_interval);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        tick_interval.tick().await;
        let mut last_tick = Instant::now();

        info!(
            "Game loop for lobby {} started ({} players)",
            self.lobby_id,
            self.players.len()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    if let Err(e) = self.tick(dt) {
                        error!("Failed to broadcast state for lobby {}: {}", self.lobby_id, e);
                    }

                    if self.tick % 300 == 0 {
                        debug!(
                            "Lobby {} tick {}: {} players, {:.1}Hz",
                            self.lobby_id,
                            self.tick,
                            self.players.len(),
                            1.0 / dt.max(f32::EPSILON)
                        );
                    }
                },
            }
        }

        info!(
            "Game loop for lobby {} stopped after {} ticks",
            self.lobby_id, self.tick
        );
    }

    /// Spawns the loop on the runtime and returns its handle.
    pub fn spawn(self, cancel: CancellationToken) -> GameHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(self.run(receiver, cancel.clone()));
        GameHandle { commands, cancel }
    }
}
