use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber` filtered by `AQUILA_LOG` first, then `RUST_LOG`, then `info`.
///
/// Field contract for training logs:
/// - per-step lines carry `step`, `loss`, `accuracy`, `examples_per_sec`, `sec_per_batch`, `lr`;
/// - validation lines carry `step`, `accuracy`, `smoothed`;
/// - pipeline events carry `pipeline` and, for producers, `worker`.
///
/// Calling it again once a subscriber is installed does nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_thread_names(true)
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("AQUILA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
