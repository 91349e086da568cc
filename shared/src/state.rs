//! Contracts between the networking core and a concrete game simulation.
//!
//! The server loop and the client reconciliation logic are written against
//! these traits only, so a different game can be dropped in without touching
//! either side. Implementations must be deterministic: the same prior state
//! and the same inputs always produce the same result, because clients
//! re-derive predicted states independently of the server.

use serde::{de::DeserializeOwned, Serialize};

use crate::ClientInput;

/// Authoritative simulation owned by one server game loop.
pub trait GameState: Send + 'static {
    /// Serializable view broadcast to clients every tick.
    type Snapshot: Serialize + DeserializeOwned + Clone + Send + 'static;

    /// Applies one client input. Sequence gating is done by the caller.
    fn apply(&mut self, input: &ClientInput);

    /// Advances the simulation by one tick of `dt` seconds.
    fn advance(&mut self, dt: f32);

    fn snapshot(&self) -> Self::Snapshot;

    /// Creates the entity controlled by a newly joined client.
    fn init_entity(&mut self, client_id: &str);

    fn remove_entity(&mut self, client_id: &str);
}

/// Client-side view of a snapshot that supports prediction and blending.
pub trait PredictedState: Clone {
    /// Applies a local input to the predicted state right away.
    fn apply_input(&mut self, client_id: &str, input: &str);

    /// Moves only the entity owned by `client_id` by one server tick.
    /// Outcomes that need the server's randomness are left to reconciliation.
    fn advance_entity(&mut self, client_id: &str);

    /// True when the entity owned by `client_id` is identical in both states.
    fn entity_matches(&self, other: &Self, client_id: &str) -> bool;

    /// Replaces this state's entity for `client_id` with the one in `from`.
    fn graft_entity(&mut self, from: &Self, client_id: &str);

    /// Blends positional fields from `self` towards `target`. A factor of 0
    /// yields `self`'s positions, a factor of 1 yields `target`.
    fn interpolate(&self, target: &Self, factor: f32) -> Self;
}
