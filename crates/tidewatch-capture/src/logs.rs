use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::store::BoundedOrderedStore;

pub const DEFAULT_LOG_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub category: Option<String>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        match (&self.category, &entry.category) {
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Bounded, append-only store of operator-visible diagnostics.
///
/// Every entry is mirrored to `tracing` so it also reaches the console or
/// log file.
pub struct LogStore {
    entries: Mutex<BoundedOrderedStore<LogEntry>>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BoundedOrderedStore::new(capacity)),
        }
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        context: Option<Value>,
        category: Option<&str>,
    ) {
        let message = message.into();
        let category_label = category.unwrap_or("-");
        match level {
            LogLevel::Info => info!(target: "tidewatch::capture", category = category_label, "{message}"),
            LogLevel::Warn => warn!(target: "tidewatch::capture", category = category_label, "{message}"),
            LogLevel::Error => error!(target: "tidewatch::capture", category = category_label, "{message}"),
        }
        self.entries.lock().push(LogEntry {
            level,
            message,
            context,
            category: category.map(str::to_owned),
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None, Some(category));
    }

    pub fn warn(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None, Some(category));
    }

    pub fn error(&self, category: &str, message: impl Into<String>, context: Option<Value>) {
        self.log(LogLevel::Error, message, context, Some(category));
    }

    /// Entries matching `filter`, oldest first.
    pub fn entries(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
