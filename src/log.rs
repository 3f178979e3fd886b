use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise the global logger from `RUST_LOG`. The CLI stays quiet by
/// default; the daemon's stderr is redirected into the session log file by
/// whoever spawned it.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    });
}
