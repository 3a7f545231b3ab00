/// Log sink setup.
///
/// Lines look like
///
/// ```text
/// 2026-03-01 12:00:00 [ingest] WARN stallguard::supervisor [supervisor.rs:220]: Thread ingest did not join within 5s timeout attempt=1
/// ```
///
/// The bracketed tag is the event's `job` field. A multi-line message is
/// written as several lines that all carry the same prefix, so stack traces
/// stay attributable when several supervisors log at once.
use crate::diagnostics::SpanStacks;
use std::fmt::{self, Write as _};
use std::path::Path;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive that overrides the
/// configured level.
pub const LOG_ENV: &str = "STALLGUARD_LOG";

/// Event formatter that repeats the prefix on every physical line.
#[derive(Debug, Clone, Copy)]
pub struct MultilineFormat {
    timestamps: bool,
}

impl Default for MultilineFormat {
    fn default() -> Self {
        Self { timestamps: true }
    }
}

impl MultilineFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_time(mut self) -> Self {
        self.timestamps = false;
        self
    }
}

/// Short level names: `ERROR` is written as `ERR`.
fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

#[derive(Default)]
struct LineVisitor {
    job: Option<String>,
    message: String,
    extra: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "job" => self.job = Some(value.to_string()),
            "message" => self.message.push_str(value),
            name if name.starts_with("log.") => {}
            name => {
                let _ = write!(self.extra, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "job" => self.job = Some(format!("{value:?}")),
            "message" => {
                let _ = write!(self.message, "{value:?}");
            }
            name if name.starts_with("log.") => {}
            name => {
                let _ = write!(self.extra, " {name}={value:?}");
            }
        }
    }
}

/// Render `message` as prefixed lines, each ending in a newline.
fn render_lines(prefix: &str, message: &str, extra: &str) -> String {
    let mut out = String::new();
    for (i, line) in message.split('\n').enumerate() {
        out.push_str(prefix);
        out.push_str(line);
        if i == 0 {
            out.push_str(extra);
        }
        out.push('\n');
    }
    out
}

impl<S, N> FormatEvent<S, N> for MultilineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Events bridged from the `log` crate carry their real origin in
        // `log.*` fields.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut prefix = String::new();
        if self.timestamps {
            let _ = write!(prefix, "{} ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        }
        let file = meta
            .file()
            .and_then(|f| Path::new(f).file_name())
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "?".to_string());
        let _ = write!(
            prefix,
            "[{:<5}] {:<4} {} [{}:{}]: ",
            visitor.job.as_deref().unwrap_or(""),
            level_name(meta.level()),
            meta.target(),
            file,
            meta.line().unwrap_or(0)
        );

        // One write per event keeps lines of concurrent events apart.
        writer.write_str(&render_lines(&prefix, &visitor.message, &visitor.extra))
    }
}

/// Install the global subscriber: env filter, optional span-stack tracking,
/// and multi-line formatting to stdout.
///
/// `default_level` applies unless [`LOG_ENV`] is set.
pub fn init(default_level: &str, span_stacks: Option<SpanStacks>) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(span_stacks)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(MultilineFormat::new())
                .with_writer(std::io::stdout),
        )
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(MultilineFormat::new().without_time())
            .with_writer(move || writer.clone())
            .with_max_level(Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        buffer.contents()
    }

    #[test]
    fn test_render_lines_repeats_prefix() {
        let out = render_lines("P: ", "a\nb\nc", " k=v");
        assert_eq!(out, "P: a k=v\nP: b\nP: c\n");
    }

    #[test]
    fn test_single_line_event_format() {
        let out = capture(|| tracing::warn!(job = "ingest", "stalled"));
        let line = out.lines().next().unwrap();
        assert!(line.starts_with("[ingest] WARN stallguard::logging::tests [logging.rs:"));
        assert!(line.ends_with("]: stalled"));
    }

    #[test]
    fn test_error_level_is_shortened() {
        let out = capture(|| tracing::error!(job = "x", "bad"));
        assert!(out.contains(" ERR "));
        assert!(!out.contains("ERROR"));
    }

    #[test]
    fn test_short_job_is_padded() {
        let out = capture(|| tracing::info!(job = "ab", "hi"));
        assert!(out.starts_with("[ab   ] INFO "));
    }

    #[test]
    fn test_missing_job_renders_empty_tag() {
        let out = capture(|| tracing::info!("untagged"));
        assert!(out.starts_with("[     ] INFO "));
    }

    #[test]
    fn test_multiline_message_prefixes_every_line() {
        let out = capture(|| {
            tracing::warn!(job = "w1", attempt = 2, "trace:\n  #0 inner\n  #1 outer")
        });
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            assert!(line.starts_with("[w1   ] WARN stallguard::logging::tests [logging.rs:"));
        }
        assert!(lines[0].ends_with("]: trace: attempt=2"));
        assert!(lines[1].ends_with("]:   #0 inner"));
        assert!(lines[2].ends_with("]:   #1 outer"));
    }

    #[test]
    fn test_log_fields_are_not_rendered_as_extras() {
        let out = capture(|| {
            tracing::info!(job = "j", log.target = "app", log.line = 3u64, retries = 2, "hi")
        });
        assert!(out.ends_with("]: hi retries=2\n"));
        assert!(!out.contains("log."));
    }

    #[test]
    fn test_log_crate_records_use_their_own_origin() {
        // The bridge is process-global; another test may have installed it.
        let _ = tracing_log::LogTracer::init();
        let out = capture(|| log::warn!(target: "app::db", "slow\nquery"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.starts_with("[     ] WARN app::db [logging.rs:"));
        }
        assert!(lines[0].ends_with("]: slow"));
        assert!(lines[1].ends_with("]: query"));
        assert!(!out.contains("log."));
    }

    #[test]
    fn test_concurrent_events_do_not_interleave() {
        let out = capture(|| {
            let dispatch = tracing::dispatcher::get_default(|d| d.clone());
            let handles: Vec<_> = (0..4)
                .map(|n| {
                    let dispatch = dispatch.clone();
                    std::thread::spawn(move || {
                        tracing::dispatcher::with_default(&dispatch, || {
                            for _ in 0..20 {
                                tracing::warn!(job = %format!("w{n}"), "line one\nline two");
                            }
                        })
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 160);
        for pair in lines.chunks(2) {
            let tag = &pair[0][..7];
            assert!(pair[0].ends_with("line one"));
            assert!(pair[1].ends_with("line two"));
            assert_eq!(&pair[1][..7], tag);
        }
    }
}
