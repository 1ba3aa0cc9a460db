use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// webrtc-rs logs every ICE and DTLS step at info
const MEDIA_STACK_DIRECTIVES: &[&str] = &[
    "webrtc=warn",
    "webrtc_ice=warn",
    "webrtc_dtls=warn",
    "webrtc_srtp=warn",
    "webrtc_mdns=error",
];

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level entirely.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))?;
    let writer = make_writer(config.file_path.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        // Production: one object per line, peer_id/room_id as fields
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer),
            )
            .try_init()?,
        // Development: human-readable, colors only on a terminal
        _ => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.file_path.is_none())
                    .with_line_number(true)
                    .with_file(false)
                    .with_writer(writer),
            )
            .try_init()?,
    }

    Ok(())
}

fn default_directives(level: Level) -> String {
    let mut directives = vec![level.as_str().to_lowercase()];
    if level < Level::DEBUG {
        // Keep the media stack quiet unless debugging
        directives.extend(MEDIA_STACK_DIRECTIVES.iter().map(ToString::to_string));
    }
    directives.join(",")
}

fn make_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    match file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            Ok(BoxMakeWriter::new(Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
    }
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
