use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// The `RUST_LOG` filter used when none is set. Levels below `INFO` only apply to the engine,
/// so a verbose call site does not drown in dependency logs.
fn default_filter(level: LevelFilter) -> String {
    match level {
        LevelFilter::OFF => String::new(),
        level if level > LevelFilter::INFO => format!("INFO,cacheable={level}"),
        level => level.to_string(),
    }
}

/// Hit, miss and coalescing traces are too frequent for Sentry and are dropped. Errors become
/// events, everything else structured logs.
fn sentry_filter(level: &Level) -> EventFilter {
    match *level {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// Installs a JSON subscriber writing to `make_writer`, forwarding to Sentry.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer().event_filter(|md| sentry_filter(md.level())))
        .init();
}

/// Installs the process-wide subscriber described by `config.logging`.
///
/// `RUST_LOG` takes precedence over the configured level.
///
/// # Safety
/// With `enable_backtraces` this sets `RUST_BACKTRACE` through [`std::env::set_var`], so it must
/// be called before any other thread is started.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees that no other thread is running.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(config.logging.level));

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = match (config.logging.format, console::user_attended()) {
        (LogFormat::Json, _) => return init_json_logging(&rust_log, std::io::stdout),
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&rust_log)))
        .with(sentry::integrations::tracing::layer().event_filter(|md| sentry_filter(md.level())))
        .init();
}

/// Logs an error that ends the process, falling back to `stderr` while no subscriber would
/// record it.
pub fn ensure_log_error(error: &anyhow::Error) {
    if Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_levels_only_apply_to_engine() {
        assert_eq!(default_filter(LevelFilter::DEBUG), "INFO,cacheable=DEBUG");
        assert_eq!(default_filter(LevelFilter::TRACE), "INFO,cacheable=TRACE");
        assert_eq!(default_filter(LevelFilter::WARN), "WARN");
        assert_eq!(default_filter(LevelFilter::OFF), "");
    }

    #[test]
    fn test_sentry_ignores_call_traces() {
        assert!(sentry_filter(&Level::ERROR).contains(EventFilter::Event));
        assert!(!sentry_filter(&Level::INFO).contains(EventFilter::Event));
        assert!(!sentry_filter(&Level::TRACE).contains(EventFilter::Log));
    }

    #[test]
    fn test_ensure_log_error_without_subscriber() {
        ensure_log_error(&anyhow::anyhow!("failed to open workloads file"));
    }
}
