use crate::config::LoggingConfig;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Fails if a global subscriber is already installed, which is expected in
/// test binaries that call this more than once.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("datagraph={0},datagraph_core={0},datagraph_graph={0},datagraph_cache={0}", config.level).into())
    };

    match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json())
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().compact())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().pretty())
            .try_init(),
    }
}
