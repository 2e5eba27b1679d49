//! Logger bootstrap for binaries and integration tests.

use env_logger::{Builder, Env};

/// Filter variable read in place of `RUST_LOG`.
pub const LOG_ENV: &str = "DEVMAPPER_LOG";

/// Install the `env_logger` backend with `default_level` unless the
/// environment says otherwise. Safe to call more than once.
pub fn init(default_level: &str) {
    let env = Env::default()
        .filter_or(LOG_ENV, default_level)
        .write_style_or("DEVMAPPER_LOG_STYLE", "auto");
    let _ = Builder::from_env(env)
        .format_timestamp_secs()
        .format_target(false)
        .try_init();
}
