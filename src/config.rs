use serde::Deserialize;

#[derive(Clone, Deserialize)]
pub struct Config {
    /// Path to the SQLite database file. `None` opens an in-memory store.
    pub db_path: Option<String>,
    /// Pause between polls when a queue is empty, in milliseconds.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// How long `shutdown` waits for each consumer loop, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_idle_interval_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("RELAYQ_").from_env::<Self>()?)
    }

    pub fn idle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            idle_interval_ms: default_idle_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}
