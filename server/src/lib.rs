//! # Snake Server Library
//!
//! Authoritative server for the multiplayer snake game. It accepts client
//! connections, groups clients into lobbies, and runs one authoritative game
//! loop per started lobby.
//!
//! ## Architecture
//!
//! ### Single-Writer Orchestrator
//! All mutable server state (the client registry and the lobby table) is
//! owned by one orchestrator task. Connection tasks and countdown timers talk
//! to it exclusively through [`network::ServerMessage`] events, so nothing on
//! the hot path takes a lock.
//!
//! ### Per-Connection Tasks
//! Every connection gets a reader task that decodes frames with
//! [`shared::MessageCodec`] and a writer task that drains the connection's
//! outbound queue. Any decode or I/O failure ends both tasks and produces a
//! single disconnect event.
//!
//! ### Per-Lobby Game Loops
//! When a lobby finishes its countdown, a [`game_loop::GameLoop`] is spawned
//! for it. The loop applies each player's inputs in sequence order, advances
//! the simulation at a fixed tick rate, and broadcasts the snapshot together
//! with the last applied sequence of every player.
//!
//! ## Module Organization
//!
//! - `config`: server settings and their defaults
//! - `client_manager`: registry of connected sessions
//! - `lobby`: lobby membership, readiness, ownership, countdown state
//! - `game_loop`: the authoritative tick loop
//! - `network`: connection tasks and the orchestrator
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use shared::snake::SnakeGame;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let listener = TcpListener::bind(config.bind_address()).await?;
//!
//!     // Every started lobby gets its own simulation.
//!     let server = Server::new(config, || SnakeGame::new(100, 100, 80, 0));
//!     server.run(listener).await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod game_loop;
pub mod lobby;
pub mod network;
