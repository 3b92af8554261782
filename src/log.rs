use std::fmt;

/// Severity of an [`EventLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub origin: String,
    pub body: String,
}

/// Append-only event stream owned by each major component.
///
/// Entries carry a level and the owning component's origin tag so callers
/// can inspect diagnostics of the last operation without a tracing
/// subscriber. Every append also emits a `tracing` event.
#[derive(Debug, Clone)]
pub struct EventLog {
    origin: String,
    entries: Vec<LogEntry>,
}

impl EventLog {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            entries: Vec::new(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn log(&mut self, level: LogLevel, body: impl Into<String>) {
        let body = body.into();
        match level {
            LogLevel::Info => tracing::info!(origin = %self.origin, "{body}"),
            LogLevel::Warning => tracing::warn!(origin = %self.origin, "{body}"),
            LogLevel::Error => tracing::error!(origin = %self.origin, "{body}"),
        }
        self.entries.push(LogEntry {
            level,
            origin: self.origin.clone(),
            body,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn with_level(&self, level: LogLevel) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |entry| entry.level == level)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Single-line rendition used when quoting a component log inside a
    /// message of another log.
    pub fn to_flat_string(&self) -> String {
        self.to_string().replace('\n', " ")
    }
}

impl fmt::Display for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {}", entry.level, entry.body)?;
        }
        Ok(())
    }
}
