//! Self-diagnostics for the channel
//!
//! Failures inside the channel are never surfaced to the instrumented
//! application. They are recorded here as internal messages instead, and
//! mirrored to `tracing`. The number of recorded messages is capped per
//! session so that a misbehaving endpoint cannot flood the host.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::stats::Statistics;

/// Default cap on internal messages per session
pub const DEFAULT_MAX_INTERNAL_MESSAGES: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Critical,
    Warning,
}

/// Identifier of an internal message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageId {
    SampleRateOutOfRange = 1,
    StorageFailure = 2,
    StorageBufferFull = 3,
    InMemoryBufferFull = 4,
    TransmissionFailed = 5,
    ItemsDropped = 6,
    PartialSuccess = 7,
    DataLoss = 8,
    SerializationFailed = 9,
    SenderShutdown = 10,
    ConnectivityUnavailable = 11,
    StatsBeatFailed = 12,
    MessageLimitReached = 13,
    PreInitQueueFull = 14,
}

/// A recorded internal message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage {
    pub severity: Severity,
    pub id: MessageId,
    pub message: String,
}

#[derive(Debug, Default)]
struct LoggerState {
    messages: Vec<InternalMessage>,
    logged_once: HashSet<MessageId>,
    limit_reached: bool,
}

/// Capped, deduplicating recorder of internal messages
#[derive(Debug)]
pub struct DiagnosticLogger {
    max_messages: usize,
    state: Mutex<LoggerState>,
}

impl Default for DiagnosticLogger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTERNAL_MESSAGES)
    }
}

impl DiagnosticLogger {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            state: Mutex::new(LoggerState::default()),
        }
    }

    /// Record a message
    pub fn throw_internal(&self, severity: Severity, id: MessageId, message: impl Into<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        self.record(&mut state, severity, id, message.into());
    }

    pub fn warn(&self, id: MessageId, message: impl Into<String>) {
        self.throw_internal(Severity::Warning, id, message);
    }

    pub fn critical(&self, id: MessageId, message: impl Into<String>) {
        self.throw_internal(Severity::Critical, id, message);
    }

    /// Record a warning only the first time `id` is seen this session
    pub fn warn_once(&self, id: MessageId, message: impl Into<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.logged_once.insert(id) {
            self.record(&mut state, Severity::Warning, id, message.into());
        }
    }

    fn record(&self, state: &mut LoggerState, severity: Severity, id: MessageId, message: String) {
        if state.limit_reached {
            return;
        }

        match severity {
            Severity::Critical => tracing::error!(message_id = (id as u16), "{message}"),
            Severity::Warning => tracing::warn!(message_id = (id as u16), "{message}"),
        }

        if state.messages.len() + 1 >= self.max_messages {
            state.limit_reached = true;
            state.messages.push(InternalMessage {
                severity: Severity::Critical,
                id: MessageId::MessageLimitReached,
                message: "Internal events throttle limit per session reached; further internal events will be suppressed".to_string(),
            });
            return;
        }

        state.messages.push(InternalMessage {
            severity,
            id,
            message,
        });
    }

    /// Messages recorded so far
    pub fn messages(&self) -> Vec<InternalMessage> {
        self.state
            .lock()
            .map(|state| state.messages.clone())
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn has_message(&self, id: MessageId) -> bool {
        self.state
            .lock()
            .map(|s| s.messages.iter().any(|m| m.id == id))
            .unwrap_or(false)
    }

    /// Start a new session: clear the cap and the dedup set
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = LoggerState::default();
        }
    }
}

/// State shared by every component of one channel instance.
///
/// Each channel owns its own context so that several independently
/// configured channels can live in one process.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub logger: Arc<DiagnosticLogger>,
    pub stats: Arc<Statistics>,
}

impl PipelineContext {
    pub fn new(max_internal_messages: usize) -> Self {
        Self {
            logger: Arc::new(DiagnosticLogger::new(max_internal_messages)),
            stats: Arc::new(Statistics::new()),
        }
    }
}
