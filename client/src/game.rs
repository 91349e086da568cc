//! Client-side prediction, reconciliation and interpolation.

use log::debug;
use shared::{ClientInput, PredictedState, ServerStateMessage};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Time over which a new authoritative snapshot is blended in.
pub const INTERPOLATION_WINDOW: Duration = Duration::from_millis(100);

/// Server tick length the local entity is stepped at.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 30);

// Steps run at most per update after a stall; the rest is dropped.
const MAX_CATCH_UP_STEPS: u32 = 8;

/// What to do with the local entity when a snapshot arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// The server snapshot always becomes the target.
    #[default]
    AlwaysAdopt,
    /// Keep the locally predicted entity when the server agrees with the
    /// prediction at the acknowledged sequence.
    PreserveLocal,
}

pub struct ClientStateManager<S: PredictedState> {
    client_id: Option<String>,
    mode: ReconcileMode,
    window: Duration,
    last_sequence: u32,

    current: S,
    // What was on screen when the pending target arrived.
    origin: S,
    target: Option<S>,
    interpolation_start: Instant,
    interpolation_deadline: Option<Instant>,

    tick_interval: Duration,
    last_step: Option<Instant>,

    input_history: BTreeMap<u32, String>,
    state_history: BTreeMap<u32, S>,
    // Sequences whose recorded prediction still waits for the next step.
    unstepped: Vec<u32>,
    predictions_held: u64,
}

impl<S: PredictedState> ClientStateManager<S> {
    pub fn new(initial: S, mode: ReconcileMode) -> Self {
        Self {
            client_id: None,
            mode,
            window: INTERPOLATION_WINDOW,
            last_sequence: 0,
            origin: initial.clone(),
            current: initial,
            target: None,
            interpolation_start: Instant::now(),
            interpolation_deadline: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            last_step: None,
            input_history: BTreeMap::new(),
            state_history: BTreeMap::new(),
            unstepped: Vec::new(),
            predictions_held: 0,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets how often the local entity moves on its own. Zero turns local
    /// stepping off.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn set_client_id(&mut self, client_id: &str) {
        self.client_id = Some(client_id.to_string());
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    pub fn current(&self) -> &S {
        &self.current
    }

    pub fn target(&self) -> Option<&S> {
        self.target.as_ref()
    }

    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub fn pending_inputs(&self) -> usize {
        self.input_history.len()
    }

    pub fn interpolation_deadline(&self) -> Option<Instant> {
        self.interpolation_deadline
    }

    /// Snapshots whose local entity agreed with the prediction made for the
    /// acknowledged sequence.
    pub fn predictions_held(&self) -> u64 {
        self.predictions_held
    }

    // Where the local entity is heading, ignoring the blend in progress.
    fn predicted(&self) -> &S {
        self.target.as_ref().unwrap_or(&self.current)
    }

    /// Applies a local input right away and records it for reconciliation.
    ///
    /// Returns the sequenced input to send, or `None` before the server has
    /// assigned a client id.
    pub fn apply_local_input(&mut self, input: &str) -> Option<ClientInput> {
        let client_id = self.client_id.clone()?;
        self.last_sequence += 1;
        let sequence = self.last_sequence;

        self.current.apply_input(&client_id, input);
        // Keep the prediction visible while a snapshot is still blending in.
        if let Some(target) = self.target.as_mut() {
            target.apply_input(&client_id, input);
        }

        self.input_history.insert(sequence, input.to_string());
        let predicted = self.predicted().clone();
        self.state_history.insert(sequence, predicted);
        self.unstepped.push(sequence);

        Some(ClientInput::new(&client_id, sequence, input))
    }

    pub fn reconcile(&mut self, message: ServerStateMessage<S>) {
        self.reconcile_at(message, Instant::now());
    }

    /// Makes an authoritative snapshot the new interpolation target.
    ///
    /// History up to the acknowledged sequence is dropped. Inputs the server
    /// has not applied yet are replayed onto the target unless the local
    /// entity was kept as is.
    pub fn reconcile_at(&mut self, message: ServerStateMessage<S>, now: Instant) {
        let Some(client_id) = self.client_id.clone() else {
            self.set_target(message.game_state, now);
            return;
        };

        let acknowledged = message.acknowledged_for(&client_id);
        let prediction_held = self
            .state_history
            .get(&acknowledged)
            .map(|predicted| predicted.entity_matches(&message.game_state, &client_id))
            .unwrap_or(false);

        self.input_history.retain(|sequence, _| *sequence > acknowledged);
        self.state_history.retain(|sequence, _| *sequence > acknowledged);
        self.unstepped.retain(|sequence| *sequence > acknowledged);
        if prediction_held {
            self.predictions_held += 1;
        }

        let mut target = message.game_state;
        if self.mode == ReconcileMode::PreserveLocal && prediction_held {
            target.graft_entity(self.predicted(), &client_id);
        } else {
            if !prediction_held && acknowledged > 0 {
                debug!("Prediction diverged at sequence {}", acknowledged);
            }
            for input in self.input_history.values() {
                target.apply_input(&client_id, input);
            }
        }

        self.set_target(target, now);
    }

    fn set_target(&mut self, target: S, now: Instant) {
        self.origin = self.current.clone();
        self.target = Some(target);
        self.interpolation_start = now;
        self.interpolation_deadline = Some(now + self.window);
    }

    pub fn update(&mut self) -> &S {
        self.update_at(Instant::now())
    }

    /// Moves the local entity for every tick interval elapsed since the last
    /// step, then advances the blend towards the pending target. Once the
    /// window has elapsed the target becomes the current state.
    pub fn update_at(&mut self, now: Instant) -> &S {
        self.step_due(now);

        let Some(target) = self.target.as_ref() else {
            return &self.current;
        };

        let elapsed = now.saturating_duration_since(self.interpolation_start);
        let factor = if self.window.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f32() / self.window.as_secs_f32()).clamp(0.0, 1.0)
        };

        if factor >= 1.0 {
            if let Some(target) = self.target.take() {
                self.current = target;
            }
            self.interpolation_deadline = None;
        } else {
            self.current = self.origin.interpolate(target, factor);
        }
        &self.current
    }

    fn step_due(&mut self, now: Instant) {
        if self.tick_interval.is_zero() {
            return;
        }
        let Some(last_step) = self.last_step else {
            self.last_step = Some(now);
            return;
        };

        let due = now.saturating_duration_since(last_step).as_nanos()
            / self.tick_interval.as_nanos();
        if due == 0 {
            return;
        }
        let steps = due.min(MAX_CATCH_UP_STEPS as u128) as u32;

        if let Some(client_id) = self.client_id.clone() {
            for _ in 0..steps {
                self.step_local(&client_id);
            }
        }

        self.last_step = if due > steps as u128 {
            Some(now)
        } else {
            Some(last_step + self.tick_interval * steps)
        };
    }

    fn step_local(&mut self, client_id: &str) {
        match self.target.as_mut() {
            Some(target) => target.advance_entity(client_id),
            None => self.current.advance_entity(client_id),
        }

        // The server acknowledges a sequence with the state after the tick
        // that applied it, so that is the prediction to compare against.
        let predicted = self.target.as_ref().unwrap_or(&self.current);
        for sequence in self.unstepped.drain(..) {
            self.state_history.insert(sequence, predicted.clone());
        }
    }

    /// Forgets all predictions, for example after leaving a game.
    pub fn reset(&mut self, state: S) {
        self.origin = state.clone();
        self.current = state;
        self.target = None;
        self.interpolation_deadline = None;
        self.last_step = None;
        self.input_history.clear();
        self.state_history.clear();
        self.unstepped.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::snake::{Direction, Position, Snake, SnakeWorld};
    use std::collections::HashMap;

    const ME: &str = "127.0.0.1:7000";
    const OTHER: &str = "127.0.0.1:7001";

    fn world(me: (i32, i32), other: (i32, i32)) -> SnakeWorld {
        let mut world = SnakeWorld::new(20, 20);
        for (id, (x, y)) in [(ME, me), (OTHER, other)] {
            world
                .snakes
                .insert(id.to_string(), Snake::new(id, Position::new(x, y)));
        }
        world
    }

    fn snapshot(state: SnakeWorld, ack: u32) -> ServerStateMessage<SnakeWorld> {
        let mut acknowledged_seq = HashMap::new();
        acknowledged_seq.insert(ME.to_string(), ack);
        ServerStateMessage {
            game_state: state,
            acknowledged_seq,
        }
    }

    // Local stepping is off so blends can be checked against fixed boards.
    fn manager(mode: ReconcileMode) -> ClientStateManager<SnakeWorld> {
        let mut manager = ClientStateManager::new(world((5, 5), (10, 10)), mode)
            .with_tick_interval(Duration::ZERO);
        manager.set_client_id(ME);
        manager
    }

    fn stepping_manager(mode: ReconcileMode) -> ClientStateManager<SnakeWorld> {
        let mut manager = ClientStateManager::new(world((5, 5), (10, 10)), mode)
            .with_window(Duration::ZERO)
            .with_tick_interval(TICK);
        manager.set_client_id(ME);
        manager
    }

    const TICK: Duration = Duration::from_millis(50);

    fn my_head(state: &SnakeWorld) -> Position {
        state.snake(ME).unwrap().head().unwrap()
    }

    fn my_direction(state: &SnakeWorld) -> Direction {
        state.snake(ME).unwrap().direction
    }

    #[test]
    fn test_no_input_before_client_id() {
        let mut manager =
            ClientStateManager::new(SnakeWorld::default(), ReconcileMode::AlwaysAdopt);
        assert!(manager.apply_local_input("UP").is_none());
        assert_eq!(manager.last_sequence(), 0);
    }

    #[test]
    fn test_local_input_is_sequenced_and_predicted() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);

        let first = manager.apply_local_input("UP").unwrap();
        let second = manager.apply_local_input("LEFT").unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.client_id, ME);
        assert_eq!(my_direction(manager.current()), Direction::Left);
        assert_eq!(manager.pending_inputs(), 2);
    }

    #[test]
    fn test_reconcile_prunes_acknowledged_history() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);
        for input in ["UP", "LEFT", "DOWN"] {
            manager.apply_local_input(input);
        }

        manager.reconcile_at(snapshot(world((5, 4), (10, 10)), 2), Instant::now());

        assert_eq!(manager.pending_inputs(), 1);
    }

    #[test]
    fn test_converges_to_target_after_window() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);
        let start = Instant::now();
        let server = world((8, 5), (10, 13));

        manager.reconcile_at(snapshot(server.clone(), 0), start);
        assert_eq!(manager.interpolation_deadline(), Some(start + INTERPOLATION_WINDOW));

        manager.update_at(start + Duration::from_millis(30));
        assert!(manager.target().is_some());

        for step in 1..=3 {
            manager.update_at(start + INTERPOLATION_WINDOW * step);
        }
        assert_eq!(manager.current(), &server);
        assert!(manager.target().is_none());
        assert!(manager.interpolation_deadline().is_none());
    }

    #[test]
    fn test_interpolation_is_linear_between_origin_and_target() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);
        let start = Instant::now();

        manager.reconcile_at(snapshot(world((9, 5), (10, 10)), 0), start);
        let halfway = manager.update_at(start + INTERPOLATION_WINDOW / 2).clone();

        assert_eq!(halfway.snake(ME).unwrap().head(), Some(Position::new(7, 5)));
    }

    #[test]
    fn test_always_adopt_replays_unacknowledged_inputs() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);
        manager.apply_local_input("UP");
        manager.apply_local_input("LEFT");

        // The server has only seen the first input.
        let mut server = world((5, 4), (10, 10));
        server.snakes.get_mut(ME).unwrap().direction = Direction::Up;
        manager.reconcile_at(snapshot(server, 1), Instant::now());

        assert_eq!(my_direction(manager.target().unwrap()), Direction::Left);
    }

    #[test]
    fn test_preserve_local_keeps_matching_prediction() {
        let mut manager = manager(ReconcileMode::PreserveLocal);
        manager.apply_local_input("UP");

        // Server agrees on the snake's segments at sequence 1, other snake moved.
        let server = world((5, 5), (11, 10));
        manager.reconcile_at(snapshot(server, 1), Instant::now());

        let target = manager.target().unwrap();
        assert_eq!(my_direction(target), Direction::Up);
        assert_eq!(
            target.snake(OTHER).unwrap().head(),
            Some(Position::new(11, 10))
        );
    }

    #[test]
    fn test_preserve_local_adopts_server_on_divergence() {
        let mut manager = manager(ReconcileMode::PreserveLocal);
        manager.apply_local_input("UP");

        let server = world((2, 2), (10, 10));
        manager.reconcile_at(snapshot(server.clone(), 1), Instant::now());

        assert_eq!(manager.target(), Some(&server));
    }

    #[test]
    fn test_local_input_during_blend_reaches_target() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);
        let start = Instant::now();
        manager.reconcile_at(snapshot(world((6, 5), (10, 10)), 0), start);

        manager.apply_local_input("DOWN");
        manager.update_at(start + INTERPOLATION_WINDOW);

        assert_eq!(my_direction(manager.current()), Direction::Down);
    }

    #[test]
    fn test_reconcile_at_highest_sequence_prunes_everything() {
        let mut manager = manager(ReconcileMode::PreserveLocal);
        manager.apply_local_input("UP");
        manager.apply_local_input("LEFT");

        manager.reconcile_at(snapshot(world((5, 5), (10, 10)), u32::MAX), Instant::now());

        assert_eq!(manager.pending_inputs(), 0);
        assert_eq!(manager.target(), Some(&world((5, 5), (10, 10))));
    }

    #[test]
    fn test_local_entity_steps_once_per_tick() {
        let mut manager = stepping_manager(ReconcileMode::AlwaysAdopt);
        let start = Instant::now();

        manager.update_at(start);
        assert_eq!(my_head(manager.current()), Position::new(5, 5));

        manager.update_at(start + TICK / 2);
        assert_eq!(my_head(manager.current()), Position::new(5, 5));

        manager.update_at(start + TICK * 3);
        assert_eq!(my_head(manager.current()), Position::new(8, 5));
        // Only the local snake is predicted.
        assert_eq!(
            manager.current().snake(OTHER).unwrap().head(),
            Some(Position::new(10, 10))
        );
    }

    #[test]
    fn test_long_stall_caps_catch_up() {
        let mut manager = stepping_manager(ReconcileMode::AlwaysAdopt);
        let start = Instant::now();

        manager.update_at(start);
        manager.update_at(start + TICK * 100);
        assert_eq!(my_head(manager.current()), Position::new(13, 5));

        manager.update_at(start + TICK * 101);
        assert_eq!(my_head(manager.current()), Position::new(14, 5));
    }

    #[test]
    fn test_stepped_prediction_is_kept_when_server_agrees() {
        let mut manager = stepping_manager(ReconcileMode::PreserveLocal);
        let start = Instant::now();
        manager.update_at(start);

        manager.apply_local_input("UP");
        manager.update_at(start + TICK);
        assert_eq!(my_head(manager.current()), Position::new(5, 4));

        // Applied UP, then moved once; the other snake moved as well.
        let server = world((5, 4), (11, 10));
        manager.reconcile_at(snapshot(server, 1), start + TICK);

        assert_eq!(manager.predictions_held(), 1);
        let target = manager.target().unwrap();
        assert_eq!(my_head(target), Position::new(5, 4));
        assert_eq!(target.snake(OTHER).unwrap().head(), Some(Position::new(11, 10)));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut manager = manager(ReconcileMode::AlwaysAdopt);
        manager.apply_local_input("UP");
        manager.reconcile_at(snapshot(world((1, 1), (2, 2)), 0), Instant::now());

        manager.reset(SnakeWorld::default());

        assert_eq!(manager.pending_inputs(), 0);
        assert!(manager.target().is_none());
        assert_eq!(manager.current(), &SnakeWorld::default());
    }
}
