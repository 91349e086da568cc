use shared::snake::{DEFAULT_FOOD_COUNT, DEFAULT_WORLD_HEIGHT, DEFAULT_WORLD_WIDTH};
use shared::PayloadFormat;
use std::time::Duration;

/// Number of countdown broadcasts before a lobby's game starts.
pub const COUNTDOWN_START: i32 = 10;

/// Runtime settings for the server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tick_interval: Duration,
    pub max_clients: usize,
    pub max_players: usize,
    pub countdown_start: i32,
    pub countdown_step: Duration,
    /// A session that sends nothing for this long is dropped.
    pub idle_timeout: Duration,
    /// When set, sessions must authenticate before using lobbies.
    pub auth_token: Option<String>,
    pub snapshot_format: PayloadFormat,
    pub world_width: i32,
    pub world_height: i32,
    pub food_count: usize,
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tick_interval: Duration::from_secs_f64(1.0 / 30.0),
            max_clients: 32,
            max_players: 4,
            countdown_start: COUNTDOWN_START,
            countdown_step: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            auth_token: None,
            snapshot_format: PayloadFormat::Json,
            world_width: DEFAULT_WORLD_WIDTH,
            world_height: DEFAULT_WORLD_HEIGHT,
            food_count: DEFAULT_FOOD_COUNT,
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_tick_rate(mut self, tick_rate: u32) -> Self {
        self.tick_interval = Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64);
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.auth_token.is_some()
    }
}
