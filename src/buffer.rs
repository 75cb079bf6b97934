//! Send buffers
//!
//! A buffer holds serialized envelopes in two sets:
//!
//! - **pending**: enqueued, not part of any outbound batch yet
//! - **sent**: part of a batch whose response has not been observed
//!
//! Every item lives in exactly one of pending, sent, or neither (removed).
//! Items move pending → sent when a batch is issued, sent → removed on a
//! confirmed success or a permanent failure, and sent → pending when the send
//! may be retried.
//!
//! [`ArraySendBuffer`] keeps both sets in memory. [`PersistedSendBuffer`]
//! mirrors both sets into a [`Storage`] after every mutation and, when
//! created, folds whatever was left in either set back into pending: the fate
//! of items that were in flight when the previous instance went away is
//! unknown, so they are sent again.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::diagnostics::{DiagnosticLogger, MessageId};
use crate::storage::Storage;

/// Storage key of the pending set (after the configured prefix)
pub const BUFFER_KEY: &str = "AI_buffer";
/// Storage key of the sent-but-unacknowledged set
pub const SENT_BUFFER_KEY: &str = "AI_sentBuffer";

/// Default cap of the persisted buffer
pub const DEFAULT_MAX_STORED_ITEMS: usize = 2000;
/// Default cap of the in-memory buffer
pub const DEFAULT_EVENTS_LIMIT_IN_MEM: usize = 10_000;

/// One serialized envelope. The payload is shared and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferItem {
    id: u64,
    payload: Arc<str>,
}

impl BufferItem {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// How a batch is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchFormat {
    /// `[env1,env2,...]`
    #[default]
    JsonArray,
    /// `env1\nenv2\n...` without a trailing newline
    LineDelimited,
}

impl BatchFormat {
    pub fn from_line_delimited(emit_line_delimited_json: bool) -> Self {
        if emit_line_delimited_json {
            BatchFormat::LineDelimited
        } else {
            BatchFormat::JsonArray
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BatchFormat::JsonArray => "application/json",
            BatchFormat::LineDelimited => "application/x-json-stream",
        }
    }
}

/// Join payloads into one wire body; `None` when there is nothing to join
pub fn format_batch<'a, I>(payloads: I, format: BatchFormat) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let payloads: Vec<&str> = payloads.into_iter().collect();
    if payloads.is_empty() {
        return None;
    }
    Some(match format {
        BatchFormat::JsonArray => format!("[{}]", payloads.join(",")),
        BatchFormat::LineDelimited => payloads.join("\n"),
    })
}

/// Snapshot of pending items and their wire body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<BufferItem>,
    pub payload: String,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Size of the wire body in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Storage for payloads awaiting or in transmission.
///
/// Buffers never perform network I/O. Storage failures are absorbed.
pub trait SendBuffer: Send {
    /// Append a payload to pending. Returns `None` when the buffer is full
    /// and the payload was dropped.
    fn enqueue(&mut self, payload: String) -> Option<BufferItem>;

    /// Number of pending items
    fn count(&self) -> usize;

    /// Bytes held in pending
    fn size(&self) -> usize;

    /// Number of sent-but-unacknowledged items
    fn sent_count(&self) -> usize;

    /// Pending items in enqueue order
    fn items(&self) -> Vec<BufferItem>;

    /// Sent-but-unacknowledged items
    fn sent_items(&self) -> Vec<BufferItem>;

    fn format(&self) -> BatchFormat;

    /// Assemble a batch from the head of pending without mutating anything.
    /// At least one item is included even if it alone exceeds `max_bytes`.
    fn batch_payloads(&self, max_items: Option<usize>, max_bytes: Option<usize>) -> Option<Batch> {
        let max_items = max_items.unwrap_or(usize::MAX).max(1);
        let max_bytes = max_bytes.unwrap_or(usize::MAX);

        let mut items = Vec::new();
        let mut bytes = 0usize;
        for item in self.items() {
            if items.len() >= max_items
                || (!items.is_empty() && bytes.saturating_add(item.size()) > max_bytes)
            {
                break;
            }
            bytes += item.size();
            items.push(item);
        }

        let payload = format_batch(items.iter().map(BufferItem::payload), self.format())?;
        Some(Batch { items, payload })
    }

    /// Move items from pending to sent
    fn mark_as_sent(&mut self, items: &[BufferItem]);

    /// Drop items from sent for good
    fn clear_sent(&mut self, items: &[BufferItem]);

    /// Move items from sent back to pending, ahead of newer items
    fn requeue(&mut self, items: &[BufferItem]);

    /// Empty pending
    fn clear(&mut self);
}

/// Shared bookkeeping of both buffer flavours
#[derive(Debug, Default)]
struct BufferState {
    pending: VecDeque<BufferItem>,
    sent: Vec<BufferItem>,
    pending_bytes: usize,
    next_id: u64,
}

fn id_set(items: &[BufferItem]) -> HashSet<u64> {
    items.iter().map(BufferItem::id).collect()
}

impl BufferState {
    fn push(&mut self, payload: Arc<str>) -> BufferItem {
        let item = BufferItem {
            id: self.next_id,
            payload,
        };
        self.next_id += 1;
        self.pending_bytes += item.size();
        self.pending.push_back(item.clone());
        item
    }

    fn mark_as_sent(&mut self, items: &[BufferItem]) -> bool {
        let ids = id_set(items);
        let mut moved = Vec::new();
        self.pending.retain(|item| {
            if ids.contains(&item.id) {
                moved.push(item.clone());
                false
            } else {
                true
            }
        });
        self.pending_bytes -= moved.iter().map(BufferItem::size).sum::<usize>();
        let changed = !moved.is_empty();
        self.sent.extend(moved);
        changed
    }

    fn clear_sent(&mut self, items: &[BufferItem]) -> bool {
        let ids = id_set(items);
        let before = self.sent.len();
        self.sent.retain(|item| !ids.contains(&item.id));
        before != self.sent.len()
    }

    fn requeue(&mut self, items: &[BufferItem]) -> bool {
        let ids = id_set(items);
        let mut back = Vec::new();
        self.sent.retain(|item| {
            if ids.contains(&item.id) {
                back.push(item.clone());
                false
            } else {
                true
            }
        });
        for item in back.iter().rev() {
            self.pending_bytes += item.size();
            self.pending.push_front(item.clone());
        }
        !back.is_empty()
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }
}

/// Volatile buffer, lost with the process
#[derive(Debug)]
pub struct ArraySendBuffer {
    state: BufferState,
    format: BatchFormat,
    limit: usize,
    logger: Arc<DiagnosticLogger>,
}

impl ArraySendBuffer {
    pub fn new(format: BatchFormat, limit: usize, logger: Arc<DiagnosticLogger>) -> Self {
        Self {
            state: BufferState::default(),
            format,
            limit,
            logger,
        }
    }
}

impl SendBuffer for ArraySendBuffer {
    fn enqueue(&mut self, payload: String) -> Option<BufferItem> {
        if self.state.pending.len() >= self.limit {
            self.logger.warn_once(
                MessageId::InMemoryBufferFull,
                format!("Maximum in-memory buffer size reached: {}", self.state.pending.len()),
            );
            return None;
        }
        Some(self.state.push(payload.into()))
    }

    fn count(&self) -> usize {
        self.state.pending.len()
    }

    fn size(&self) -> usize {
        self.state.pending_bytes
    }

    fn sent_count(&self) -> usize {
        self.state.sent.len()
    }

    fn items(&self) -> Vec<BufferItem> {
        self.state.pending.iter().cloned().collect()
    }

    fn sent_items(&self) -> Vec<BufferItem> {
        self.state.sent.clone()
    }

    fn format(&self) -> BatchFormat {
        self.format
    }

    fn mark_as_sent(&mut self, items: &[BufferItem]) {
        self.state.mark_as_sent(items);
    }

    fn clear_sent(&mut self, items: &[BufferItem]) {
        self.state.clear_sent(items);
    }

    fn requeue(&mut self, items: &[BufferItem]) {
        self.state.requeue(items);
    }

    fn clear(&mut self) {
        self.state.clear();
    }
}

/// Buffer mirrored into storage after every mutation
pub struct PersistedSendBuffer<S: Storage> {
    state: BufferState,
    storage: S,
    buffer_key: String,
    sent_key: String,
    format: BatchFormat,
    limit: usize,
    restored: usize,
    logger: Arc<DiagnosticLogger>,
}

impl<S: Storage> PersistedSendBuffer<S> {
    /// Open the buffer, recovering pending and unacknowledged items left by
    /// a previous instance sharing the same storage and key prefix.
    pub fn new(
        storage: S,
        key_prefix: &str,
        format: BatchFormat,
        limit: usize,
        logger: Arc<DiagnosticLogger>,
    ) -> Self {
        let mut buffer = Self {
            state: BufferState::default(),
            storage,
            buffer_key: format!("{key_prefix}{BUFFER_KEY}"),
            sent_key: format!("{key_prefix}{SENT_BUFFER_KEY}"),
            format,
            limit,
            restored: 0,
            logger,
        };

        let mut recovered = buffer.load(&buffer.buffer_key);
        recovered.extend(buffer.load(&buffer.sent_key));
        if recovered.len() > limit {
            buffer.logger.warn(
                MessageId::StorageBufferFull,
                format!(
                    "Recovered {} stored items, keeping the first {limit}",
                    recovered.len()
                ),
            );
            recovered.truncate(limit);
        }

        buffer.restored = recovered.len();
        for payload in recovered {
            buffer.state.push(payload.into());
        }
        if buffer.restored > 0 {
            tracing::debug!(restored = buffer.restored, "recovered items from persisted buffer");
        }

        if buffer.persist_pending() {
            buffer.persist_sent();
        }
        buffer
    }

    /// Number of items recovered from storage when the buffer was opened
    pub fn restored_count(&self) -> usize {
        self.restored
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn load(&self, key: &str) -> Vec<String> {
        let raw = match self.storage.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                self.logger.warn(
                    MessageId::StorageFailure,
                    format!("Failed to read persisted buffer {key}: {e}"),
                );
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(items) => items,
            Err(e) => {
                self.logger.critical(
                    MessageId::StorageFailure,
                    format!("Failed to restore persisted buffer {key}: {e}"),
                );
                Vec::new()
            }
        }
    }

    /// Write `items` under `key`, returning whether the write succeeded
    fn store<'a>(&self, key: &str, items: impl Iterator<Item = &'a BufferItem>) -> bool {
        let payloads: Vec<&str> = items.map(BufferItem::payload).collect();
        let result = serde_json::to_string(&payloads)
            .map_err(crate::error::Error::from)
            .and_then(|raw| self.storage.set_item(key, &raw));
        match result {
            Ok(()) => true,
            Err(e) => {
                self.logger.warn_once(
                    MessageId::StorageFailure,
                    format!("Failed to persist buffer {key}: {e}"),
                );
                false
            }
        }
    }

    fn persist_pending(&self) -> bool {
        self.store(&self.buffer_key, self.state.pending.iter())
    }

    fn persist_sent(&self) -> bool {
        self.store(&self.sent_key, self.state.sent.iter())
    }
}

impl<S: Storage> SendBuffer for PersistedSendBuffer<S> {
    fn enqueue(&mut self, payload: String) -> Option<BufferItem> {
        if self.state.pending.len() >= self.limit {
            self.logger.warn_once(
                MessageId::StorageBufferFull,
                format!("Maximum buffer size reached: {}", self.state.pending.len()),
            );
            return None;
        }
        let item = self.state.push(payload.into());
        self.persist_pending();
        Some(item)
    }

    fn count(&self) -> usize {
        self.state.pending.len()
    }

    fn size(&self) -> usize {
        self.state.pending_bytes
    }

    fn sent_count(&self) -> usize {
        self.state.sent.len()
    }

    fn items(&self) -> Vec<BufferItem> {
        self.state.pending.iter().cloned().collect()
    }

    fn sent_items(&self) -> Vec<BufferItem> {
        self.state.sent.clone()
    }

    fn format(&self) -> BatchFormat {
        self.format
    }

    fn mark_as_sent(&mut self, items: &[BufferItem]) {
        // The key gaining items is written first, and the key losing them
        // only once that succeeded: a failure leaves a duplicate, never a gap
        if self.state.mark_as_sent(items) && self.persist_sent() {
            self.persist_pending();
        }
    }

    fn clear_sent(&mut self, items: &[BufferItem]) {
        if self.state.clear_sent(items) {
            self.persist_sent();
        }
    }

    fn requeue(&mut self, items: &[BufferItem]) {
        if self.state.requeue(items) && self.persist_pending() {
            self.persist_sent();
        }
    }

    fn clear(&mut self) {
        self.state.clear();
        self.persist_pending();
    }
}
