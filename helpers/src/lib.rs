use tracing_subscriber::EnvFilter;

/// Initialize logging for a demo, falling back to `default` if `RUST_LOG` is
/// not set.
pub fn init_logging(default: &str) {
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}
