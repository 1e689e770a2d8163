use crate::failures::FAILED_TARGET;
use std::{fs::OpenOptions, io, path::Path, sync::Mutex};
use tracing::Level;
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Install the global subscriber.
///
/// Stdout gets everything `RUST_LOG` allows (default `info`). The critical
/// log at `critical_log` gets only failed-job events.
pub fn init_logging(critical_log: &Path) -> io::Result<()> {
    if let Some(parent) = critical_log.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(critical_log)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_writer(io::stdout)
        .with_filter(env_filter);

    let critical_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(Targets::new().with_target(FAILED_TARGET, Level::ERROR));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(critical_layer)
        .try_init()
        .map_err(io::Error::other)
}
