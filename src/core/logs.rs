//! Operator-facing connection logs.
//!
//! These are not tracing output: they are small bounded buffers that operators enable for a
//! limited period and retrieve through the management API.

use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_LOG_TEXT_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Source,
    Target,
    Response,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Consumed,
    Dispatched,
    Filtered,
    Mapped,
    Dropped,
    Published,
    Acknowledged,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub log_type: LogType,
    pub level: LogLevel,
    pub address: Option<String>,
    pub message: String,
    pub correlation_id: Option<String>,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_LOG_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_LOG_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Bounded {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Bounded {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// Logger for one (category, type, address) that only records while unmuted.
#[derive(Debug)]
pub struct MuteableConnectionLogger {
    category: LogCategory,
    log_type: LogType,
    address: Option<String>,
    active: AtomicBool,
    successes: Mutex<Bounded>,
    failures: Mutex<Bounded>,
}

impl MuteableConnectionLogger {
    pub fn new(
        category: LogCategory,
        log_type: LogType,
        address: Option<String>,
        success_capacity: usize,
        failure_capacity: usize,
    ) -> Self {
        Self {
            category,
            log_type,
            address,
            active: AtomicBool::new(false),
            successes: Mutex::new(Bounded::new(success_capacity)),
            failures: Mutex::new(Bounded::new(failure_capacity)),
        }
    }

    pub fn mute(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn unmute(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }

    pub fn success(&self, message: &str) {
        self.record(LogLevel::Success, message, None);
    }

    pub fn success_with(&self, message: &str, correlation_id: Option<&str>) {
        self.record(LogLevel::Success, message, correlation_id);
    }

    pub fn failure(&self, message: &str) {
        self.record(LogLevel::Failure, message, None);
    }

    pub fn failure_with(&self, message: &str, correlation_id: Option<&str>) {
        self.record(LogLevel::Failure, message, correlation_id);
    }

    pub fn exception(&self, error: &dyn std::error::Error) {
        self.record(
            LogLevel::Failure,
            &format!("Unexpected failure: {error}"),
            None,
        );
    }

    fn record(&self, level: LogLevel, message: &str, correlation_id: Option<&str>) {
        if self.is_muted() {
            return;
        }
        let entry = LogEntry {
            timestamp: Utc::now(),
            category: self.category,
            log_type: self.log_type,
            level,
            address: self.address.clone(),
            message: truncate_string(message),
            correlation_id: correlation_id.map(str::to_string),
        };
        match level {
            LogLevel::Success => lock(&self.successes).push(entry),
            LogLevel::Failure => lock(&self.failures).push(entry),
        }
    }

    /// Recorded entries, oldest first; empty while muted.
    pub fn logs(&self) -> Vec<LogEntry> {
        if self.is_muted() {
            return Vec::new();
        }
        let mut logs: Vec<LogEntry> = lock(&self.successes)
            .entries
            .iter()
            .chain(lock(&self.failures).entries.iter())
            .cloned()
            .collect();
        logs.sort_by_key(|e| e.timestamp);
        logs
    }

    pub fn clear(&self) {
        lock(&self.successes).entries.clear();
        lock(&self.failures).entries.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoggerKey {
    category: LogCategory,
    log_type: LogType,
    address: Option<String>,
}

/// Logs of one connection as returned by the retrieve-logs operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLogs {
    pub enabled_since: Option<DateTime<Utc>>,
    pub enabled_until: Option<DateTime<Utc>>,
    pub entries: Vec<LogEntry>,
}

impl ConnectionLogs {
    pub fn merge(mut self, other: ConnectionLogs) -> Self {
        self.enabled_since = match (self.enabled_since, other.enabled_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.enabled_until = match (self.enabled_until, other.enabled_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.entries.extend(other.entries);
        self.entries.sort_by_key(|e| e.timestamp);
        self
    }
}

#[derive(Debug, Default)]
struct Window {
    enabled_since: Option<DateTime<Utc>>,
    enabled_until: Option<DateTime<Utc>>,
}

/// Loggers of one client instance, muted until explicitly enabled.
#[derive(Debug)]
pub struct ConnectionLoggerRegistry {
    loggers: Mutex<HashMap<LoggerKey, Arc<MuteableConnectionLogger>>>,
    window: Mutex<Window>,
    success_capacity: usize,
    failure_capacity: usize,
}

impl ConnectionLoggerRegistry {
    pub fn new(success_capacity: usize, failure_capacity: usize) -> Self {
        Self {
            loggers: Mutex::new(HashMap::new()),
            window: Mutex::new(Window::default()),
            success_capacity,
            failure_capacity,
        }
    }

    fn logger(
        &self,
        category: LogCategory,
        log_type: LogType,
        address: Option<String>,
    ) -> Arc<MuteableConnectionLogger> {
        let key = LoggerKey {
            category,
            log_type,
            address: address.clone(),
        };
        let active = self.is_active(Utc::now());
        lock(&self.loggers)
            .entry(key)
            .or_insert_with(|| {
                let logger = MuteableConnectionLogger::new(
                    category,
                    log_type,
                    address,
                    self.success_capacity,
                    self.failure_capacity,
                );
                if active {
                    logger.unmute();
                }
                Arc::new(logger)
            })
            .clone()
    }

    pub fn for_connection(&self) -> Arc<MuteableConnectionLogger> {
        self.logger(LogCategory::Connection, LogType::Other, None)
    }

    pub fn for_source(&self, log_type: LogType, address: &str) -> Arc<MuteableConnectionLogger> {
        self.logger(LogCategory::Source, log_type, Some(address.to_string()))
    }

    pub fn for_target(&self, log_type: LogType, address: &str) -> Arc<MuteableConnectionLogger> {
        self.logger(LogCategory::Target, log_type, Some(address.to_string()))
    }

    /// Unmute every logger until `now + duration`.
    pub fn enable(&self, now: DateTime<Utc>, duration: Duration) {
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        {
            let mut window = lock(&self.window);
            if window.enabled_since.is_none() {
                window.enabled_since = Some(now);
            }
            window.enabled_until = Some(until);
        }
        for logger in lock(&self.loggers).values() {
            logger.unmute();
        }
        self.for_connection().unmute();
    }

    pub fn mute(&self) {
        {
            let mut window = lock(&self.window);
            window.enabled_since = None;
            window.enabled_until = None;
        }
        for logger in lock(&self.loggers).values() {
            logger.mute();
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        lock(&self.window)
            .enabled_until
            .is_some_and(|until| now < until)
    }

    /// Mute when the enabled window passed; returns true when this call muted the loggers.
    pub fn mute_if_expired(&self, now: DateTime<Utc>) -> bool {
        let expired = lock(&self.window)
            .enabled_until
            .is_some_and(|until| now >= until);
        if expired {
            self.mute();
        }
        expired
    }

    pub fn aggregate(&self) -> ConnectionLogs {
        let window = lock(&self.window);
        let mut entries: Vec<LogEntry> = lock(&self.loggers)
            .values()
            .flat_map(|logger| logger.logs())
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        ConnectionLogs {
            enabled_since: window.enabled_since,
            enabled_until: window.enabled_until,
            entries,
        }
    }

    pub fn reset(&self) {
        for logger in lock(&self.loggers).values() {
            logger.clear();
        }
    }
}

impl Default for ConnectionLoggerRegistry {
    fn default() -> Self {
        Self::new(10, 10)
    }
}
