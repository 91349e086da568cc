use shared::PayloadFormat;
use std::time::Duration;

use crate::game::{ReconcileMode, DEFAULT_TICK_INTERVAL};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// Sent right after the handshake when set
    pub auth_token: Option<String>,
    /// How often the lobby list is refreshed
    pub sync_interval: Duration,
    pub handshake_timeout: Duration,
    /// Must match the server's tick length for predictions to hold
    pub tick_interval: Duration,
    pub input_format: PayloadFormat,
    pub reconcile_mode: ReconcileMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8080".to_string(),
            auth_token: None,
            sync_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            tick_interval: DEFAULT_TICK_INTERVAL,
            input_format: PayloadFormat::Json,
            reconcile_mode: ReconcileMode::AlwaysAdopt,
        }
    }
}
