// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format for run telemetry.
//!
//! The sender usually runs from cron or at the end of a training job, where
//! its output lands in a shared log next to the producer's own. Each line
//! therefore starts with a fixed prefix, a UTC timestamp and the level,
//! followed by the component that emitted it.
//!
//! # Format
//!
//! ```text
//! RUN_TELEMETRY | TIMESTAMP | LEVEL | COMPONENT | [span{fields}: ]message fields
//! ```
//!
//! # Examples
//!
//! ```text
//! RUN_TELEMETRY | 2024-05-02T09:14:03.120Z | INFO | SENDER | drain{cache_dir=/var/cache}: Draining 3 cached runs
//! RUN_TELEMETRY | 2024-05-02T09:14:03.388Z | WARN | LOCK | drain{cache_dir=/var/cache}: Reclaimed dead lock /var/cache/sender.lock
//! RUN_TELEMETRY | 2024-05-02T09:14:04.002Z | DEBUG | TRANSPORT | Delivered 120 metric records (1..=120) for run 6f1c...
//! ```
//!
//! # Components
//!
//! The component column comes from the module the event was logged in, so
//! call sites never repeat it in their messages:
//!
//! | Module | Component |
//! |---|---|
//! | `dispatcher` | `DISPATCH` |
//! | `sender`, the sender binary | `SENDER` |
//! | `cache` | `CACHE` |
//! | `lock` | `LOCK` |
//! | `transport`, `http` | `TRANSPORT` |
//! | `config` | `CONFIG` |
//!
//! Events from other crates (only reachable when the filter lets them
//! through) carry no component column.
//!
//! # Usage
//!
//! ```rust,ignore
//! use run_telemetry::logger::Formatter;
//!
//! let subscriber = tracing_subscriber::fmt::Subscriber::builder()
//!     .event_format(Formatter::new())
//!     .finish();
//! tracing::subscriber::set_global_default(subscriber)?;
//! ```

use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const LOG_PREFIX: &str = "RUN_TELEMETRY";

/// Event formatter for the `RUN_TELEMETRY | ...` line layout.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    timestamps: bool,
}

impl Formatter {
    #[must_use]
    pub const fn new() -> Self {
        Formatter { timestamps: true }
    }

    /// Drops the timestamp column, for output compared verbatim.
    #[must_use]
    pub const fn without_timestamps() -> Self {
        Formatter { timestamps: false }
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Component column for an event target such as `run_telemetry::sender`.
fn component(target: &str) -> Option<&'static str> {
    let module = match target.split_once("::") {
        Some(("run_telemetry", rest)) => rest.split("::").next()?,
        None if target == "run_telemetry_sender" => return Some("SENDER"),
        _ => return None,
    };
    match module {
        "dispatcher" => Some("DISPATCH"),
        "sender" => Some("SENDER"),
        "cache" => Some("CACHE"),
        "lock" => Some("LOCK"),
        "transport" | "http" => Some("TRANSPORT"),
        "config" => Some("CONFIG"),
        _ => None,
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(writer, "{LOG_PREFIX} | ")?;
        if self.timestamps {
            match OffsetDateTime::now_utc().format(&Rfc3339) {
                Ok(now) => write!(writer, "{now} | ")?,
                Err(_) => write!(writer, "- | ")?,
            }
        }
        write!(writer, "{} | ", metadata.level())?;
        if let Some(component) = component(metadata.target()) {
            write!(writer, "{component} | ")?;
        }

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                match ext.get::<FormattedFields<N>>() {
                    Some(fields) if !fields.is_empty() => write!(writer, "{{{fields}}}: ")?,
                    _ => write!(writer, ": ")?,
                }
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(formatter: Formatter, f: impl FnOnce()) -> String {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .event_format(formatter)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_component_from_target() {
        let output = capture(Formatter::without_timestamps(), || {
            tracing::info!(target: "run_telemetry::sender", "Draining 3 cached runs");
        });
        assert_eq!(output, "RUN_TELEMETRY | INFO | SENDER | Draining 3 cached runs\n");
    }

    #[test]
    fn test_span_context_and_fields() {
        let output = capture(Formatter::without_timestamps(), || {
            let span = tracing::info_span!("drain", workers = 2);
            let _guard = span.enter();
            tracing::warn!(target: "run_telemetry::lock", run = "abc", "Lock taken over");
        });
        assert_eq!(
            output,
            "RUN_TELEMETRY | WARN | LOCK | drain{workers=2}: Lock taken over run=\"abc\"\n"
        );
    }

    #[test]
    fn test_foreign_target_has_no_component() {
        let output = capture(Formatter::without_timestamps(), || {
            tracing::debug!(target: "hyper::client", "connecting");
        });
        assert_eq!(output, "RUN_TELEMETRY | DEBUG | connecting\n");
    }

    #[test]
    fn test_timestamp_column() {
        let output = capture(Formatter::new(), || {
            tracing::error!(target: "run_telemetry::dispatcher", "cache write failed");
        });
        let columns: Vec<&str> = output.trim_end().split(" | ").collect();
        assert_eq!(columns[0], LOG_PREFIX);
        assert!(OffsetDateTime::parse(columns[1], &Rfc3339).is_ok());
        assert_eq!(&columns[2..], ["ERROR", "DISPATCH", "cache write failed"]);
    }

    #[test]
    fn test_component_mapping() {
        assert_eq!(component("run_telemetry::transport"), Some("TRANSPORT"));
        assert_eq!(component("run_telemetry::http"), Some("TRANSPORT"));
        assert_eq!(component("run_telemetry::cache::tests"), Some("CACHE"));
        assert_eq!(component("run_telemetry_sender"), Some("SENDER"));
        assert_eq!(component("run_telemetry"), None);
        assert_eq!(component("reqwest::connect"), None);
    }
}
