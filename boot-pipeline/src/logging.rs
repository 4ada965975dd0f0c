//! Session logger: every event goes to the console (colored when stderr is
//! a terminal) and to the plain-text session log.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Mutex;

use colored::Colorize;
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::IoContext;
use crate::{Error, Result};

/// Target that marks an INFO event as a SUCCESS line.
pub const SUCCESS_TARGET: &str = "success";

/// Log a SUCCESS line.
#[macro_export]
macro_rules! success {
    ($($arg:tt)+) => {
        ::tracing::info!(target: "success", $($arg)+)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Info,
    Success,
    Warning,
    Error,
}

impl Label {
    pub fn of(meta: &Metadata<'_>) -> Self {
        match *meta.level() {
            Level::ERROR => Label::Error,
            Level::WARN => Label::Warning,
            _ if meta.target() == SUCCESS_TARGET => Label::Success,
            _ => Label::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Label::Info => "INFO",
            Label::Success => "SUCCESS",
            Label::Warning => "WARNING",
            Label::Error => "ERROR",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[2024-01-01 12:00:00] [LEVEL] message key=value`
pub struct SessionFormat;

impl<S, N> FormatEvent<S, N> for SessionFormat
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
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let label = Label::of(event.metadata());
        let tag = format!("[{label}]");
        if writer.has_ansi_escapes() {
            let tag = match label {
                Label::Info => tag.blue(),
                Label::Success => tag.green().bold(),
                Label::Warning => tag.yellow().bold(),
                Label::Error => tag.red().bold(),
            };
            write!(writer, "{} {} ", format!("[{stamp}]").dimmed(), tag)?;
        } else {
            write!(writer, "[{stamp}] {tag} ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(session_log: &Path, verbose: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(session_log)
        .at(session_log)?;

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let console = tracing_subscriber::fmt::layer()
        .event_format(SessionFormat)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());
    let session = tracing_subscriber::fmt::layer()
        .event_format(SessionFormat)
        .with_writer(Mutex::new(file))
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(level)
        .with(console)
        .with(session)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}
