//! tracing subscriber setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "blemesh_linux=info,blemesh_core=info";

/// Install the global fmt subscriber. Precedence: config directive, RUST_LOG, default.
pub fn init(directive: Option<&str>) {
    let filter = match directive {
        Some(d) => EnvFilter::try_new(d).map_err(|_| ()),
        None => EnvFilter::try_from_default_env().map_err(|_| ()),
    }
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
