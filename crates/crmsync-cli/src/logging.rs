use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins when set; otherwise `level` applies to every target.
pub fn init(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
