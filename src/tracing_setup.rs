use eyre::Result;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize console logging. `debug` lowers the default filter from
/// `info` to `debug`; `RUST_LOG` still wins when set.
pub fn init_tracing(debug: bool) -> Result<()> {
    let default_filter = if debug { "quay=debug,info" } else { "info" };

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false),
        )
        .init();

    Ok(())
}

/// JSON output variant for log collectors.
pub fn init_json_tracing(debug: bool) -> Result<()> {
    let default_filter = if debug { "quay=debug,info" } else { "info" };

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_target(true),
        )
        .init();

    Ok(())
}
