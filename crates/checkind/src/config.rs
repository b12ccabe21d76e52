use checkin_core::config::ConfigError;
use checkin_core::Config;

/// Daemon configuration: the shared pipeline config plus bus settings.
pub struct DaemonConfig {
    pub pipeline: Config,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Requests that may wait for the engine before callers block.
    pub queue_depth: usize,
}

impl DaemonConfig {
    /// Load `CHECKIN_CONFIG` / `CHECKIN_*` for the pipeline and
    /// `CHECKIND_*` for the daemon itself.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline: Config::load()?,
            system_bus: std::env::var("CHECKIND_SYSTEM_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
            queue_depth: env_usize("CHECKIND_QUEUE_DEPTH", 16).max(1),
        })
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
