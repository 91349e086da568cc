use clap::{Parser, ValueEnum};
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use shared::snake::SnakeGame;
use shared::PayloadFormat;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SnapshotFormat {
    Json,
    Binary,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative multiplayer snake server")]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// Maximum number of players per lobby
    #[arg(long, default_value = "4")]
    max_players: usize,

    /// Seconds between countdown broadcasts
    #[arg(long, default_value = "1.0")]
    countdown_step: f64,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "30")]
    idle_timeout: u64,

    /// Shared token clients must present before using lobbies
    #[arg(long)]
    auth_token: Option<String>,

    /// Encoding of server-state payloads
    #[arg(long, value_enum, default_value = "json")]
    snapshot_format: SnapshotFormat,

    /// World width in cells
    #[arg(long, default_value = "100")]
    width: i32,

    /// World height in cells
    #[arg(long, default_value = "100")]
    height: i32,

    /// Number of food items kept on the board
    #[arg(long, default_value = "80")]
    food: usize,

    /// Seed for lobby codes and simulations; random when omitted
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            max_clients: self.max_clients,
            max_players: self.max_players,
            countdown_step: Duration::from_secs_f64(self.countdown_step.max(0.001)),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            auth_token: self.auth_token,
            snapshot_format: match self.snapshot_format {
                SnapshotFormat::Json => PayloadFormat::Json,
                SnapshotFormat::Binary => PayloadFormat::Binary,
            },
            world_width: self.width,
            world_height: self.height,
            food_count: self.food,
            seed: self.seed,
            ..ServerConfig::default()
        }
        .with_tick_rate(self.tick_rate)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = args.into_config();

    info!(
        "Starting server on {} at {:.1}Hz",
        config.bind_address(),
        1.0 / config.tick_interval.as_secs_f64()
    );

    let listener = TcpListener::bind(config.bind_address()).await?;

    let (width, height, food, seed) = (
        config.world_width,
        config.world_height,
        config.food_count,
        config.seed,
    );
    let server = Server::new(config, move || {
        SnakeGame::new(width, height, food, seed.unwrap_or_else(rand::random))
    });
    let shutdown = server.shutdown_token();

    tokio::select! {
        result = server.run(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            shutdown.cancel();
        }
    }

    Ok(())
}
