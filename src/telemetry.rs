//! Logging setup: tracing-subscriber on stdout (text or JSON) plus an optional
//! daily-rolling JSON file through tracing-appender.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install the global subscriber. `RUST_LOG` wins over `config.log_level`.
///
/// Keep the returned guard alive for the life of the process, otherwise the
/// file writer stops flushing. Calling this twice is harmless; the second
/// install is ignored.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (file_writer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "farm_sync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = config.log_json.then(|| fmt::layer().json().with_target(true));
    let text_layer = (!config.log_json).then(|| fmt::layer().with_target(false));
    let file_layer = file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init();

    guard
}
