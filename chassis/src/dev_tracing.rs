//! Development helper: initialize a tracing subscriber when `RUST_LOG` is set.

/// Install a `fmt` subscriber filtered by `RUST_LOG`.
///
/// Examples and tests call `chassis::dev_tracing::init_tracing()` to see the
/// `[RPC]`/`[TRANSPORT]` logs. This is a no-op when `RUST_LOG` is not set
/// or when a global subscriber is already installed.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
    }
}
