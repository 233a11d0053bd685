use std::time::Duration;

use vortex::MultiverseId;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Shared secret accepted by the token validator.
    pub secret: String,
    /// Connections quiet longer than this are closed by the sweep.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub handler_sweep_interval: Duration,
    /// Reliable frames above this length are treated as protocol abuse.
    pub max_frame_len: usize,
    /// Session every authenticated player is auto-joined into, when set.
    pub open_session: Option<MultiverseId>,
    pub open_session_mode: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 27500,
            secret: "changeme".to_string(),
            idle_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
            handler_sweep_interval: Duration::from_secs(60),
            max_frame_len: 64 * 1024,
            open_session: None,
            open_session_mode: "freeplay".to_string(),
        }
    }
}
