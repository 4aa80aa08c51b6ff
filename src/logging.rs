//! # Structured Logging
//!
//! Environment-aware structured logging for the nightly operations loop and
//! the per-exposure pipeline. Console output is human-readable; the optional
//! file layer is JSON for after-the-fact digging through a night's run.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with console output and, when `log_dir` is given, a
/// JSON file layer named after the process id. Safe to call more than once.
pub fn init_logging(log_dir: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_env("SPECPIPE_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info"))
        };

        let console = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter());

        if let Some(dir) = log_dir {
            let dir = PathBuf::from(dir);
            if !dir.exists() {
                if let Err(e) = fs::create_dir_all(&dir) {
                    eprintln!("Failed to create log directory {}: {e}", dir.display());
                }
            }
            let filename = format!("specpipe.{}.log", process::id());
            let appender = tracing_appender::rolling::never(&dir, filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .with_filter(filter());

            if tracing_subscriber::registry()
                .with(console)
                .with(file)
                .try_init()
                .is_ok()
            {
                // Keep the appender thread alive for the process lifetime.
                std::mem::forget(guard);
            }
        } else {
            let _ = tracing_subscriber::registry().with(console).try_init();
        }
    });
}

/// Printable banner separating per-exposure log sections.
pub fn exposure_banner(expid: i64) -> String {
    format!("##################### {expid:08} #########################")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_pads_expid() {
        let banner = exposure_banner(1234);
        assert!(banner.contains("00001234"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging(None);
        init_logging(None);
    }
}
