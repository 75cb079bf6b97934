//! Tracking of items queued but never acknowledged
//!
//! Every enqueued item increments a stored counter and every acknowledged
//! item decrements it. When the host goes away, whatever is left (minus the
//! items still safe in a persisted buffer) is reported as lost, at most
//! [`MAX_LOSS_REPORTS`] times per session.

use std::sync::{Arc, Mutex};

use crate::diagnostics::{DiagnosticLogger, MessageId};
use crate::envelope::{SeverityLevel, TelemetryItem};
use crate::storage::Storage;

pub const ITEMS_QUEUED_KEY: &str = "AI_itemsQueued";
pub const ISSUES_REPORTED_KEY: &str = "AI_lossIssuesReported";

/// Reports allowed per session
pub const MAX_LOSS_REPORTS: u64 = 10;

pub struct DataLossAnalyzer {
    storage: Arc<dyn Storage>,
    items_key: String,
    issues_key: String,
    logger: Arc<DiagnosticLogger>,
    // Serializes read-modify-write cycles on the stored counters
    lock: Mutex<()>,
}

impl DataLossAnalyzer {
    pub fn new(storage: Arc<dyn Storage>, key_prefix: &str, logger: Arc<DiagnosticLogger>) -> Self {
        Self {
            storage,
            items_key: format!("{key_prefix}{ITEMS_QUEUED_KEY}"),
            issues_key: format!("{key_prefix}{ISSUES_REPORTED_KEY}"),
            logger,
            lock: Mutex::new(()),
        }
    }

    fn read(&self, key: &str) -> u64 {
        match self.storage.get_item(key) {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                tracing::debug!(key, error = %e, "could not read data loss counter");
                0
            }
        }
    }

    fn write(&self, key: &str, value: u64) {
        if let Err(e) = self.storage.set_item(key, &value.to_string()) {
            tracing::debug!(key, error = %e, "could not write data loss counter");
        }
    }

    fn update(&self, key: &str, f: impl FnOnce(u64) -> u64) {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = f(self.read(key));
        self.write(key, value);
    }

    pub fn increment_items_queued(&self, count: usize) {
        self.update(&self.items_key, |queued| queued.saturating_add(count as u64));
    }

    pub fn decrement_items_queued(&self, count: usize) {
        self.update(&self.items_key, |queued| queued.saturating_sub(count as u64));
    }

    pub fn items_queued(&self) -> u64 {
        self.read(&self.items_key)
    }

    pub fn issues_reported(&self) -> u64 {
        self.read(&self.issues_key)
    }

    /// Report items that were queued but neither acknowledged nor retained.
    ///
    /// `retained` is the number of items still held by a persisted buffer;
    /// they are not lost. The queued counter is reset afterwards. Returns the
    /// diagnostic trace to send when a report was made.
    pub fn report_lost_items(&self, retained: usize) -> Option<TelemetryItem> {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queued = self.read(&self.items_key);
        let issues = self.read(&self.issues_key);
        let lost = queued.saturating_sub(retained as u64);

        let report = if lost > 0 && issues < MAX_LOSS_REPORTS {
            let message = format!("Internal report DATALOSS: {lost} items were queued but not acknowledged");
            self.logger.warn(MessageId::DataLoss, message.clone());
            self.write(&self.issues_key, issues + 1);
            Some(
                TelemetryItem::trace(format!("AI (Internal): {message}"), SeverityLevel::Warning)
                    .with_property("lostItems", lost.to_string()),
            )
        } else {
            None
        };

        self.write(&self.items_key, 0);
        report
    }
}
