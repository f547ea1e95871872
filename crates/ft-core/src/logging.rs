//! Logging setup
//!
//! Two sinks: human-oriented stderr output whose level follows `-v`/`-q`, and
//! an append-only log file with one `[<timestamp>] [<LEVEL>] <message>` line
//! per event. Failures to open or write the log file are ignored.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// How the process wants to be logged
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Number of `-v` flags
    pub verbose: u8,
    /// Only errors on stderr
    pub quiet: bool,
    /// Append-only log file; `None` disables file logging
    pub log_file: Option<PathBuf>,
}

/// Stderr level for the given verbosity flags
pub fn stderr_level(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(options: &LogOptions) {
    let stderr_filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| stderr_level(options.verbose, options.quiet).into()),
    );
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let file_layer = options.log_file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        let level = if options.verbose >= 2 {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .log_internal_errors(false)
                .with_writer(Mutex::new(file))
                .event_format(LogLineFormat)
                .with_filter(level),
        )
    });

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

/// Render one log line without the trailing newline
pub fn format_log_line(timestamp: DateTime<Utc>, level: &Level, message: &str) -> String {
    format!(
        "[{}] [{}] {}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        level,
        message
    )
}

/// Event formatter for the log file
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLineFormat;

impl<S, N> FormatEvent<S, N> for LogLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut message = String::new();
        ctx.field_format()
            .format_fields(Writer::new(&mut message), event)?;
        writeln!(
            writer,
            "{}",
            format_log_line(Utc::now(), event.metadata().level(), &message)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_format_log_line() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            format_log_line(ts, &Level::WARN, "Registry is malformed"),
            "[2024-03-01T12:30:05.000Z] [WARN] Registry is malformed"
        );
    }

    #[test]
    fn test_stderr_level() {
        assert_eq!(stderr_level(0, false), "warn");
        assert_eq!(stderr_level(1, false), "info");
        assert_eq!(stderr_level(5, false), "trace");
        assert_eq!(stderr_level(3, true), "error");
    }

    #[test]
    fn test_events_use_log_line_format() {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .event_format(LogLineFormat)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Created tunnel {}", "dev");
            tracing::error!("Failed");
        });

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] [INFO] Created tunnel dev"));
        assert!(lines[1].ends_with("] [ERROR] Failed"));

        let ts = &lines[0][1..lines[0].find(']').unwrap()];
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
