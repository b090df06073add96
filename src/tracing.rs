use anyhow::Result;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::DispatcherConfig;

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &DispatcherConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging {
        return Box::new(tracing_subscriber::fmt::layer().json().flatten_event(true));
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

/// Console logging plus a daily-rolled file under `log/` for operator
/// visibility; the daemon never reports errors interactively.
pub fn setup_tracing(config: &DispatcherConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(config.log_dir())?;
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "dispatchd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    let subscriber = tracing_subscriber::Registry::default()
        .with(get_log_layer(config).with_filter(get_env_filter()))
        .with(file_layer.with_filter(get_env_filter()));

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }

    Ok(guard)
}
