use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "caption_studio=debug,tower_http=info";

/// Log to stdout, filtered by `RUST_LOG` when set.
pub fn init_tracing() {
    let env_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    tracing_subscriber::registry()
        .with(env_layer)
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .init();
}
