use std::io::{self, Write};
use std::time::{Duration, Instant};

use chrono::Local;

#[derive(Debug, Clone, Copy)]
enum Clock {
    Date,
    Elapsed(Instant),
}

/// Writes job log lines prefixed with either the wall-clock date or the time
/// elapsed since the writer was created.
///
/// ```text
/// [2015-08-26 14:02:11] downloading DATA for T1 into /tmp/job/inputs/T1
/// [00d 00h 01m 00s] this is a test
/// ```
#[derive(Debug, Clone)]
pub struct TimedWriter {
    name: Option<String>,
    clock: Clock,
}

impl TimedWriter {
    pub fn with_date() -> Self {
        Self {
            name: None,
            clock: Clock::Date,
        }
    }

    pub fn elapsed() -> Self {
        Self {
            name: None,
            clock: Clock::Elapsed(Instant::now()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn format_line(&self, text: &str) -> String {
        let mut line = String::new();
        if let Some(name) = &self.name {
            line.push_str(&format!("[{name}]"));
        }
        match self.clock {
            Clock::Date => {
                let now = Local::now();
                line.push_str(&format!("[{}] {text}", now.format("%Y-%m-%d %H:%M:%S")));
            }
            Clock::Elapsed(start) => {
                line.push_str(&format!("[{}] {text}", format_elapsed(start.elapsed())));
            }
        }
        line
    }

    pub fn write_to<W: Write>(&self, out: &mut W, text: &str) -> io::Result<()> {
        writeln!(out, "{}", self.format_line(text))
    }

    pub fn print(&self, text: &str) {
        let stdout = io::stdout();
        let _ = self.write_to(&mut stdout.lock(), text);
    }

    pub fn eprint(&self, text: &str) {
        let stderr = io::stderr();
        let _ = self.write_to(&mut stderr.lock(), text);
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{days:02}d {hours:02}h {minutes:02}m {seconds:02}s")
}

/// Routes a report message through the writer when one is given, otherwise
/// through `tracing`.
pub(crate) fn announce(writer: Option<&TimedWriter>, message: &str) {
    match writer {
        Some(writer) => writer.print(message),
        None => tracing::info!("{message}"),
    }
}
