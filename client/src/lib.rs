//! # Snake Client Library
//!
//! Client side of the multiplayer snake game: a network agent that speaks the
//! frame protocol, a lobby view, and a state manager that predicts local
//! inputs and blends authoritative snapshots in.
//!
//! ## Architecture Overview
//!
//! ### Client-Side Prediction
//! Local inputs are applied to the displayed state immediately and recorded
//! under their sequence number before being sent.
//!
//! ### Server Reconciliation
//! Every snapshot carries the last input sequence the server applied for each
//! client. History up to that sequence is dropped; the remaining inputs are
//! replayed on top of the snapshot, which becomes the new target.
//!
//! ### Interpolation
//! The displayed state moves linearly towards the target over a short window
//! and snaps onto it once the window has passed.
//!
//! ## Module Organization
//!
//! - `config`: connection and reconciliation settings
//! - `network`: handshake, reader/writer tasks, [`network::ClientEvent`]
//! - `lobby`: the local lobby view built from events
//! - `game`: [`game::ClientStateManager`]
//! - `input`: console command parsing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::game::{ClientStateManager, ReconcileMode};
//! use client::network::{ClientEvent, NetworkClient};
//! use shared::snake::SnakeWorld;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default();
//!     let (network, mut events) = NetworkClient::connect::<SnakeWorld>(&config).await?;
//!
//!     let mut state = ClientStateManager::new(SnakeWorld::default(), ReconcileMode::AlwaysAdopt);
//!     state.set_client_id(network.client_id());
//!
//!     network.create_lobby()?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ClientEvent::ServerState(snapshot) => state.reconcile(snapshot),
//!             ClientEvent::Disconnected(_) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod game;
pub mod input;
pub mod lobby;
pub mod network;
