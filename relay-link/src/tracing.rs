//! Logging setup shared by the library and its front ends.
//!
//! A binary calls one of the `init_*` functions once at startup to install a
//! subscriber. Library modules pull the event macros in with
//! `use crate::tracing::prelude::*`.

use std::env;
use time::{macros::format_description, OffsetDateTime};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

// Our own crates; their targets are shortened in stdout output.
const LOCAL_PREFIXES: &[&str] = &["relay_link::", "relayctl::"];

/// Log to journald when started by systemd, else to stdout at INFO.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(e) => {
                init_stdout(LevelFilter::INFO);
                error!(error = %e, "Journald unavailable, logging to stdout");
            }
        }
    } else {
        init_stdout(LevelFilter::INFO);
    }
}

/// Log to stdout. `RUST_LOG` overrides `default_level`.
pub fn init_stdout(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().event_format(CompactFormatter))
        .init();
}

/// One line per event: time, coloured level, short target, message, then
/// structured fields dimmed on the same line.
struct CompactFormatter;

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            // Some("x") -> x
            let cleaned = formatted
                .strip_prefix("Some(")
                .and_then(|inner| inner.strip_suffix(')'))
                .map(str::to_string)
                .unwrap_or(formatted);
            self.fields.push((field.name(), cleaned));
        }
    }
}

fn short_target(target: &str) -> &str {
    LOCAL_PREFIXES
        .iter()
        .find_map(|prefix| target.strip_prefix(prefix))
        .unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for CompactFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (colour, label) = match *event.metadata().level() {
            tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
            tracing::Level::WARN => ("\x1b[33m", "WARN "),
            tracing::Level::INFO => ("\x1b[32m", "INFO "),
            tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
            tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(
            writer,
            " {}{}\x1b[0m {}: ",
            colour,
            label,
            short_target(event.metadata().target())
        )?;

        if let Some(message) = &visitor.message {
            write!(writer, "{}", message)?;
        }

        let fields: Vec<_> = visitor
            .fields
            .iter()
            .filter(|(name, _)| !name.starts_with("log."))
            .collect();
        if !fields.is_empty() {
            write!(writer, " \x1b[90m")?;
            for (i, (name, value)) in fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, " ")?;
                }
                write!(writer, "{}={}", name, value.trim_matches('"'))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

// Local wall clock to the second; the default timer prints long UTC stamps.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
