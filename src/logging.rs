use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initializes the fmt subscriber, filtered by the `RELAYQ_LOG` env var
/// (default `info`). Uses `try_init` so tests and embedding applications
/// that already installed a subscriber are left alone.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_env_var("RELAYQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
