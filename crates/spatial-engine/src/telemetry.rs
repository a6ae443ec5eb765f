use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor a command-line override is given.
pub const DEFAULT_FILTER: &str = "info,spatial_engine=debug,tower_http=info";

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over `fallback`; `fallback` wins over [`DEFAULT_FILTER`].
pub fn init_tracing(fallback: Option<&str>) {
    let directives = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| fallback.map(str::to_owned))
        .unwrap_or_else(|| DEFAULT_FILTER.into());

    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?} ({}), using {}", directives, e, DEFAULT_FILTER);
        EnvFilter::new(DEFAULT_FILTER)
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    // a second call keeps the first subscriber
    let _ = tracing::subscriber::set_global_default(subscriber);
}
