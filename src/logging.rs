use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MARKLY_LOG";

/// Installs the global subscriber. `MARKLY_LOG` takes the usual
/// `EnvFilter` directives, e.g. `markly=debug,tower_http=info`.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
