// Tracing setup. RUST_LOG wins over the configured level when set.

pub fn init_tracing(default_level: &str) {
    let default_level = default_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    // try_init: embedding hosts and tests may have installed their own.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
