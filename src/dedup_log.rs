//! Two-tier diagnostics: a `tracing` line for every event, plus a durable
//! entry in a [`LogStore`] unless an identical event was stored within the
//! dedup window.
//!
//! Identity of an event is its dedup key: the SHA-256 of level, call-site,
//! message and trace text. Timestamps and payloads do not take part, so a
//! retry loop that keeps failing the same way produces one durable row per
//! window instead of one per attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::contract::LogStore;

/// Call-site label for a [`LogEvent`]: `module::path:line`.
#[macro_export]
macro_rules! callsite {
    () => {
        concat!(module_path!(), ":", line!())
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    NotSet,
}

impl LogLevel {
    /// Unrecognized names fall back to `Info`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => LogLevel::Critical,
            "ERROR" => LogLevel::Error,
            "WARNING" | "WARN" => LogLevel::Warning,
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            "NOTSET" => LogLevel::NotSet,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::NotSet => "notset",
        }
    }

    /// Critical and unset events are always persisted.
    fn is_deduplicated(&self) -> bool {
        matches!(
            self,
            LogLevel::Error | LogLevel::Warning | LogLevel::Info | LogLevel::Debug
        )
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One diagnostic call.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub callsite: String,
    pub message: String,
    pub error: Option<String>,
    pub trace: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl LogEvent {
    pub fn new(level: LogLevel, callsite: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            callsite: callsite.into(),
            message: message.into(),
            error: None,
            trace: None,
            payload: None,
        }
    }

    /// Attach the causing error; its text becomes part of the message.
    pub fn with_error(mut self, error: &(dyn std::error::Error + 'static)) -> Self {
        self.error = Some(error.to_string());
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        if !chain.is_empty() && self.trace.is_none() {
            self.trace = Some(chain.join("\ncaused by: "));
        }
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Message with the error text appended, as it is hashed and stored.
    pub fn full_message(&self) -> String {
        match &self.error {
            Some(err) => format!("{} {}", self.message, err),
            None => self.message.clone(),
        }
    }

    /// Trace text on a single line.
    fn flat_trace(&self) -> Option<String> {
        self.trace.as_ref().map(|t| t.replace('\n', " "))
    }

    pub fn dedup_key(&self) -> String {
        let canonical = serde_json::json!({
            "level": self.level.as_str(),
            "stack": self.callsite,
            "message": self.full_message(),
            "exception": self.flat_trace(),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Persisted form of a [`LogEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub trace: Option<String>,
    pub payload: Option<String>,
    pub dedup_key: String,
    pub callsite: String,
    pub service: String,
}

/// What happened to an event on the durable side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDisposition {
    /// Written to the store.
    Recorded,
    /// An identical event is already stored within the window.
    Suppressed,
    /// Only the local line was emitted (no store, or the insert failed).
    LocalOnly,
}

impl LogDisposition {
    pub fn is_recorded(&self) -> bool {
        matches!(self, LogDisposition::Recorded)
    }
}

/// Source of "now" for window arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct DedupLogger {
    service: String,
    store: Option<Arc<dyn LogStore>>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupLogger {
    pub fn new(service: impl Into<String>, store: Option<Arc<dyn LogStore>>, window: Duration) -> Self {
        Self {
            service: service.into(),
            store,
            window,
            clock: Arc::new(SystemClock),
        }
    }

    /// Logger with no durable store: every event is local only.
    pub fn local(service: impl Into<String>) -> Self {
        Self::new(service, None, Duration::ZERO)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn log(&self, event: LogEvent) -> LogDisposition {
        emit_local(&event);

        let Some(store) = &self.store else {
            return LogDisposition::LocalOnly;
        };

        let now = self.clock.now();
        let key = event.dedup_key();

        if event.level.is_deduplicated() {
            let since = chrono::Duration::from_std(self.window)
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            match store.count_since(&key, since).await {
                Ok(0) => {}
                Ok(existing) => {
                    tracing::trace!(dedup_key = %key, existing, "Suppressed duplicate log entry");
                    return LogDisposition::Suppressed;
                }
                Err(e) => {
                    // Fail open: a broken lookup must not drop diagnostics.
                    tracing::error!(error = %e, dedup_key = %key, "Log store lookup failed");
                }
            }
        }

        let payload = event.payload.as_ref().and_then(|p| match serde_json::to_string(p) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize log payload");
                None
            }
        });

        let entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: now,
            level: event.level,
            message: event.full_message(),
            trace: event.trace.clone(),
            payload,
            dedup_key: key,
            callsite: event.callsite.clone(),
            service: self.service.clone(),
        };

        match store.insert(&entry).await {
            Ok(()) => LogDisposition::Recorded,
            Err(e) => {
                tracing::error!(error = %e, dedup_key = %entry.dedup_key, "Log store insert failed");
                LogDisposition::LocalOnly
            }
        }
    }
}

fn emit_local(event: &LogEvent) {
    let message = event.full_message();
    let trace = event.flat_trace();
    match event.level {
        LogLevel::Critical | LogLevel::Error => {
            tracing::error!(callsite = %event.callsite, trace = ?trace, "{message}")
        }
        LogLevel::Warning => tracing::warn!(callsite = %event.callsite, trace = ?trace, "{message}"),
        LogLevel::Info | LogLevel::NotSet => {
            tracing::info!(callsite = %event.callsite, trace = ?trace, "{message}")
        }
        LogLevel::Debug => tracing::debug!(callsite = %event.callsite, trace = ?trace, "{message}"),
    }
}
