use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber, filtered by `RUST_LOG` or else by
/// `default_filter`. Returns false when a subscriber was already set, which
/// is normal for an embedding host that configured its own.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Store calls run on the blocking pool; thread ids tell them apart.
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_thread_ids(true)
        .compact()
        .finish();

    let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
    if installed {
        tracing::debug!("Tracing initialized (default filter '{}')", default_filter);
    }
    installed
}
