//! Batch scheduling and transmission
//!
//! A [`Sender`] owns the send buffer and a background task that flushes it:
//!
//! | Trigger | When | Honours backoff and pause |
//! |---------|------|---------------------------|
//! | timer | every `max_batch_interval` | yes |
//! | size | an enqueue pushes pending bytes past `max_batch_size_in_bytes` | yes |
//! | forced | [`Sender::flush`], [`Sender::flush_on_unload`], shutdown | no |
//!
//! Timer and size flushes share one in-flight slot; a trigger arriving while
//! a flush is in flight is coalesced into a single follow-up flush. Forced
//! flushes only take pending items, which are disjoint from in-flight ones,
//! so they never wait for the slot.
//!
//! Responses are classified as follows:
//!
//! | Outcome | Disposition |
//! |---------|-------------|
//! | 2xx | acknowledged, backoff reset |
//! | 206, or 2xx whose body reports rejected items | accepted items acknowledged, retryable rejections requeued, rest dropped |
//! | 408, 429, 500, 502, 503, 504 | requeued, backoff grows |
//! | any other status | dropped with a diagnostic per item |
//! | no response | requeued, backoff grows unless the host is offline |

use bon::bon;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};

use crate::buffer::{format_batch, Batch, BatchFormat, BufferItem, SendBuffer};
use crate::config::{ChannelConfig, StatsBeatConfig};
use crate::connectivity::OfflineListener;
use crate::data_loss::DataLossAnalyzer;
use crate::diagnostics::{MessageId, PipelineContext};
use crate::error::{Error, ItemError};
use crate::retry::{is_retryable_status, BackoffState, RetryPolicy};
use crate::stats::stats_beat_envelopes;
use crate::transport::{Transport, TransportKind, TransportPolicy, TransportRequest, TransportResponse};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Body returned by the collection endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponse {
    #[serde(default)]
    pub items_received: usize,
    #[serde(default)]
    pub items_accepted: usize,
    #[serde(default)]
    pub errors: Vec<TrackResponseError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponseError {
    pub index: usize,
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl From<TrackResponseError> for ItemError {
    fn from(e: TrackResponseError) -> Self {
        ItemError {
            index: e.index,
            status_code: e.status_code,
            message: e.message,
        }
    }
}

impl TrackResponse {
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    /// Whether the endpoint rejected part of the batch
    pub fn is_partial(&self) -> bool {
        self.items_accepted < self.items_received && !self.errors.is_empty()
    }
}

/// What started a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Timer,
    Size,
    Forced,
    Unload,
}

impl FlushTrigger {
    fn is_forced(self) -> bool {
        matches!(self, FlushTrigger::Forced | FlushTrigger::Unload)
    }
}

/// Result of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Requests handed to a transport
    pub attempts: usize,
    /// Items acknowledged by the endpoint (or queued by a beacon)
    pub sent: usize,
    /// Items put back into pending
    pub requeued: usize,
    /// Items dropped for good
    pub dropped: usize,
    /// The flush stopped before the buffer was empty because of backoff,
    /// pause or connectivity
    pub skipped: bool,
}

/// Whether to keep draining after a batch
enum Disposition {
    Continue,
    Stop,
}

/// Sender settings taken from [`ChannelConfig`]
#[derive(Debug, Clone)]
struct SenderSettings {
    endpoint_url: String,
    max_batch_items: Option<usize>,
    max_batch_size_in_bytes: usize,
    max_batch_interval: Duration,
    custom_headers: Vec<(String, String)>,
    is_retry_disabled: bool,
    transport_policy: TransportPolicy,
    retry_policy: RetryPolicy,
    stats_beat: Option<StatsBeatConfig>,
    instrumentation_key: Option<String>,
}

impl From<&ChannelConfig> for SenderSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            endpoint_url: config.endpoint_url.clone(),
            max_batch_items: config.max_batch_items,
            max_batch_size_in_bytes: config.max_batch_size_in_bytes,
            max_batch_interval: config.max_batch_interval,
            custom_headers: config.custom_headers.clone(),
            is_retry_disabled: config.is_retry_disabled,
            transport_policy: config.transport_policy(),
            retry_policy: RetryPolicy::new(config.retry_slot_delay, config.max_retry_delay),
            stats_beat: config.stats_beat.clone(),
            instrumentation_key: config.instrumentation_key.clone(),
        }
    }
}

struct SenderInner {
    settings: SenderSettings,
    buffer: Mutex<Box<dyn SendBuffer>>,
    format: BatchFormat,
    transports: Vec<Arc<dyn Transport>>,
    connectivity: Option<Arc<OfflineListener>>,
    backoff: Mutex<BackoffState>,
    in_flight: AtomicBool,
    flush_requested: AtomicBool,
    paused: AtomicBool,
    size_trigger: Notify,
    pipeline: PipelineContext,
    data_loss: Option<Arc<DataLossAnalyzer>>,
}

/// Schedules and transmits batches from a send buffer
pub struct Sender {
    inner: Arc<SenderInner>,
    shutdown_tx: mpsc::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_flag: AtomicBool,
}

#[bon]
impl Sender {
    /// Create a sender and start its background task.
    ///
    /// Must be called within a tokio runtime.
    #[builder]
    pub fn new(
        config: ChannelConfig,
        buffer: Box<dyn SendBuffer>,
        transports: Vec<Arc<dyn Transport>>,
        connectivity: Option<Arc<OfflineListener>>,
        #[builder(default)] pipeline: PipelineContext,
        data_loss: Option<Arc<DataLossAnalyzer>>,
    ) -> Self {
        let settings = SenderSettings::from(&config);
        let format = buffer.format();

        let inner = Arc::new(SenderInner {
            settings,
            buffer: Mutex::new(buffer),
            format,
            transports,
            connectivity,
            backoff: Mutex::new(BackoffState::new()),
            in_flight: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            size_trigger: Notify::new(),
            pipeline,
            data_loss,
        });

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        // Start background flush task
        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut flush_interval = interval(task_inner.settings.max_batch_interval);
            flush_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // Consume the first immediate tick
            flush_interval.tick().await;

            let mut beat_interval = task_inner.settings.stats_beat.as_ref().map(|beat| {
                let mut beat_interval = tokio::time::interval_at(Instant::now() + beat.interval, beat.interval);
                beat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                beat_interval
            });

            loop {
                tokio::select! {
                    _ = flush_interval.tick() => {
                        task_inner.gated_flush(FlushTrigger::Timer).await;
                    }
                    _ = task_inner.size_trigger.notified() => {
                        task_inner.gated_flush(FlushTrigger::Size).await;
                    }
                    _ = async {
                        match beat_interval.as_mut() {
                            Some(beat) => beat.tick().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        task_inner.send_stats_beat().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            tracing::debug!("sender task stopped");
        });

        Self {
            inner,
            shutdown_tx,
            task: Mutex::new(Some(task)),
            shutdown_flag: AtomicBool::new(false),
        }
    }
}

impl Sender {
    /// Add a serialized envelope to the buffer. Returns `false` when the
    /// payload was not accepted.
    pub fn enqueue(&self, payload: String) -> bool {
        if self.shutdown_flag.load(Ordering::Relaxed) {
            self.inner
                .pipeline
                .logger
                .warn_once(MessageId::SenderShutdown, "Telemetry sent after shutdown is dropped");
            return false;
        }

        let settings = &self.inner.settings;
        let (accepted, should_flush) = {
            let mut buffer = lock(&self.inner.buffer);
            // Flush what is pending before this item would push the batch past its limit
            let would_exceed =
                buffer.count() > 0 && buffer.size() + payload.len() > settings.max_batch_size_in_bytes;
            let accepted = buffer.enqueue(payload).is_some();
            let full_by_count = settings
                .max_batch_items
                .is_some_and(|max| buffer.count() >= max);
            (accepted, would_exceed || full_by_count)
        };

        if accepted {
            if let Some(data_loss) = &self.inner.data_loss {
                data_loss.increment_items_queued(1);
            }
        }
        if should_flush {
            self.inner.size_trigger.notify_one();
        }
        accepted
    }

    /// Send everything pending now, ignoring backoff and pause
    pub async fn flush(&self) -> FlushReport {
        self.inner.drain(FlushTrigger::Forced).await
    }

    /// Send everything pending with the most unload-safe transport
    pub async fn flush_on_unload(&self) -> FlushReport {
        self.inner.drain(FlushTrigger::Unload).await
    }

    /// Stop timer and size flushes; items keep buffering
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Relaxed);
        if lock(&self.inner.buffer).count() > 0 {
            self.inner.size_trigger.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }

    /// Number of pending items
    pub fn buffer_len(&self) -> usize {
        lock(&self.inner.buffer).count()
    }

    /// Number of items sent but not yet acknowledged
    pub fn in_flight_len(&self) -> usize {
        lock(&self.inner.buffer).sent_count()
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.inner.backoff).consecutive_failures()
    }

    /// Instant before which timer-driven flushes are suppressed
    pub fn retry_at(&self) -> Option<Instant> {
        lock(&self.inner.backoff).retry_at()
    }

    pub fn pipeline(&self) -> &PipelineContext {
        &self.inner.pipeline
    }

    /// Stop the background task and flush what is left.
    ///
    /// Safe to call multiple times; only the first call flushes.
    pub async fn shutdown(&self) -> FlushReport {
        if self.shutdown_flag.swap(true, Ordering::Relaxed) {
            return FlushReport::default();
        }

        // Signal shutdown to background task
        let _ = self.shutdown_tx.send(()).await;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sender task ended abnormally");
            }
        }

        let report = self.inner.drain(FlushTrigger::Forced).await;
        if report.dropped > 0 || self.buffer_len() > 0 {
            tracing::warn!(
                sent = report.sent,
                dropped = report.dropped,
                remaining = self.buffer_len(),
                "sender shut down with undelivered telemetry"
            );
        }
        report
    }
}

impl SenderInner {
    fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .is_none_or(|listener| listener.is_online())
    }

    /// Timer/size flush guarded by the in-flight slot
    async fn gated_flush(&self, trigger: FlushTrigger) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.flush_requested.store(true, Ordering::Release);
            return;
        }

        loop {
            self.drain(trigger).await;
            self.in_flight.store(false, Ordering::Release);

            if !self.flush_requested.swap(false, Ordering::AcqRel) {
                break;
            }
            if self.in_flight.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }

    /// Send batches until pending is empty or a batch asks to stop
    async fn drain(&self, trigger: FlushTrigger) -> FlushReport {
        let mut report = FlushReport::default();

        loop {
            if !trigger.is_forced() {
                if self.paused.load(Ordering::Relaxed) {
                    report.skipped = true;
                    break;
                }
                let backoff = lock(&self.backoff);
                if backoff.is_suppressed(Instant::now()) {
                    tracing::trace!(
                        remaining = ?backoff.remaining(Instant::now()),
                        "flush suppressed by backoff"
                    );
                    report.skipped = true;
                    break;
                }
            }

            if !self.is_online() {
                tracing::debug!(?trigger, "offline, leaving items pending");
                report.skipped = true;
                break;
            }

            // Take the batch and move it to sent in one step so that
            // concurrent flushes never pick the same items
            let batch = {
                let mut buffer = lock(&self.buffer);
                let batch = buffer.batch_payloads(
                    self.settings.max_batch_items,
                    Some(self.settings.max_batch_size_in_bytes),
                );
                if let Some(batch) = &batch {
                    buffer.mark_as_sent(&batch.items);
                }
                batch
            };
            let Some(batch) = batch else {
                break;
            };

            match self.send_batch(batch, trigger, &mut report).await {
                Disposition::Stop => break,
                Disposition::Continue if trigger == FlushTrigger::Size => {
                    // A size flush only has to bring pending back under the limit
                    if lock(&self.buffer).size() <= self.settings.max_batch_size_in_bytes {
                        break;
                    }
                }
                Disposition::Continue => {}
            }
        }

        report
    }

    async fn send_batch(&self, batch: Batch, trigger: FlushTrigger, report: &mut FlushReport) -> Disposition {
        let unload = trigger == FlushTrigger::Unload;
        let endpoint = self.settings.endpoint_url.as_str();
        let candidates = self
            .settings
            .transport_policy
            .select(&self.transports, unload, batch.size());

        if candidates.is_empty() {
            self.pipeline.logger.warn_once(
                MessageId::TransmissionFailed,
                format!("No transport available for a {} byte batch", batch.size()),
            );
            self.requeue(&batch.items, report);
            return Disposition::Stop;
        }

        let request = TransportRequest {
            url: self.settings.endpoint_url.clone(),
            payload: batch.payload.clone(),
            content_type: self.format.content_type(),
            headers: self.settings.custom_headers.clone(),
            keep_alive: unload,
        };

        for transport in &candidates {
            report.attempts += 1;
            let started = Instant::now();
            tracing::debug!(
                transport = ?transport.kind(),
                items = batch.len(),
                bytes = batch.size(),
                ?trigger,
                "sending batch"
            );

            match transport.send(request.clone()).await {
                Ok(TransportResponse::Queued) => {
                    self.pipeline.stats.count(200, endpoint);
                    self.acknowledge(&batch.items, report);
                    lock(&self.backoff).record_success();
                    return Disposition::Continue;
                }
                Ok(TransportResponse::Completed {
                    status,
                    body,
                    retry_after,
                }) => {
                    self.pipeline
                        .stats
                        .count_with_duration(status, endpoint, started.elapsed());
                    return self.classify(&batch, status, body.as_deref(), retry_after, report);
                }
                Err(Error::PayloadTooLarge { size, max_size }) => {
                    // Refused before anything went out; try the next transport
                    tracing::debug!(
                        transport = ?transport.kind(),
                        size,
                        max_size,
                        "transport refused payload"
                    );
                    continue;
                }
                Err(e) => {
                    self.pipeline.stats.count_exception(endpoint);
                    return self.on_send_error(&batch.items, e, report);
                }
            }
        }

        self.pipeline.logger.warn(
            MessageId::TransmissionFailed,
            format!("Every transport refused a {} byte batch", batch.size()),
        );
        self.requeue(&batch.items, report);
        Disposition::Stop
    }

    fn classify(
        &self,
        batch: &Batch,
        status: u16,
        body: Option<&str>,
        retry_after: Option<Duration>,
        report: &mut FlushReport,
    ) -> Disposition {
        let items = &batch.items;

        if (200..300).contains(&status) {
            let parsed = body.and_then(TrackResponse::parse);
            let partial = match &parsed {
                Some(response) => status == 206 || response.is_partial(),
                None => false,
            };
            if partial {
                if let Some(response) = parsed {
                    return self.partial_success(items, response, retry_after, report);
                }
            }
            if status == 206 {
                tracing::warn!("partial success without a readable body, treating batch as accepted");
            }
            self.acknowledge(items, report);
            lock(&self.backoff).record_success();
            return Disposition::Continue;
        }

        if is_retryable_status(status) {
            if self.settings.is_retry_disabled {
                self.drop_items(items, status, "retries are disabled", report);
                return Disposition::Continue;
            }
            self.requeue(items, report);
            let delay = lock(&self.backoff).record_failure(&self.settings.retry_policy, retry_after);
            tracing::debug!(status, ?delay, items = items.len(), "retryable response, backing off");
            return Disposition::Stop;
        }

        self.drop_items(items, status, "non-retryable response", report);
        Disposition::Continue
    }

    fn partial_success(
        &self,
        items: &[BufferItem],
        response: TrackResponse,
        retry_after: Option<Duration>,
        report: &mut FlushReport,
    ) -> Disposition {
        let mut retry = Vec::new();
        let mut fatal = Vec::new();
        let mut rejected = HashSet::new();

        for error in response.errors.into_iter().map(ItemError::from) {
            let Some(item) = items.get(error.index) else {
                continue;
            };
            if !rejected.insert(error.index) {
                continue;
            }
            if error.is_retryable() && !self.settings.is_retry_disabled {
                retry.push(item.clone());
            } else {
                fatal.push((item.clone(), error));
            }
        }

        let accepted: Vec<BufferItem> = items
            .iter()
            .enumerate()
            .filter(|(index, _)| !rejected.contains(index))
            .map(|(_, item)| item.clone())
            .collect();

        self.pipeline.logger.warn(
            MessageId::PartialSuccess,
            format!(
                "Partial success: {} accepted, {} to retry, {} rejected",
                accepted.len(),
                retry.len(),
                fatal.len()
            ),
        );

        self.acknowledge(&accepted, report);
        for (item, error) in &fatal {
            self.pipeline
                .logger
                .critical(MessageId::ItemsDropped, format!("Telemetry item dropped: {error}"));
            self.drop_item_silently(item, report);
        }

        if retry.is_empty() {
            lock(&self.backoff).record_success();
            Disposition::Continue
        } else {
            self.requeue(&retry, report);
            lock(&self.backoff).record_failure(&self.settings.retry_policy, retry_after);
            Disposition::Stop
        }
    }

    fn on_send_error(&self, items: &[BufferItem], error: Error, report: &mut FlushReport) -> Disposition {
        if !self.is_online() {
            tracing::debug!(error = %error, "send failed while offline, requeueing without backoff");
            self.requeue(items, report);
            return Disposition::Stop;
        }

        if self.settings.is_retry_disabled || !error.is_retryable() {
            self.pipeline.logger.warn(
                MessageId::TransmissionFailed,
                format!("Failed to send telemetry: {error}"),
            );
            self.drop_items(items, 0, "send failed", report);
            return Disposition::Continue;
        }

        self.pipeline.stats.count_retry(&self.settings.endpoint_url);
        self.requeue(items, report);
        let delay = lock(&self.backoff).record_failure(&self.settings.retry_policy, None);
        tracing::debug!(error = %error, ?delay, "send failed, backing off");
        Disposition::Stop
    }

    fn acknowledge(&self, items: &[BufferItem], report: &mut FlushReport) {
        if items.is_empty() {
            return;
        }
        lock(&self.buffer).clear_sent(items);
        report.sent += items.len();
        if let Some(data_loss) = &self.data_loss {
            data_loss.decrement_items_queued(items.len());
        }
    }

    fn requeue(&self, items: &[BufferItem], report: &mut FlushReport) {
        lock(&self.buffer).requeue(items);
        report.requeued += items.len();
    }

    fn drop_items(&self, items: &[BufferItem], status: u16, reason: &str, report: &mut FlushReport) {
        for item in items {
            self.pipeline.logger.critical(
                MessageId::ItemsDropped,
                format!("Telemetry item dropped ({reason}, status {status})"),
            );
            self.drop_item_silently(item, report);
        }
    }

    fn drop_item_silently(&self, item: &BufferItem, report: &mut FlushReport) {
        lock(&self.buffer).clear_sent(std::slice::from_ref(item));
        report.dropped += 1;
        if let Some(data_loss) = &self.data_loss {
            data_loss.decrement_items_queued(1);
        }
    }

    /// Post the statistics counters to the diagnostic endpoint. Never
    /// counted in the statistics themselves.
    async fn send_stats_beat(&self) {
        let Some(beat) = &self.settings.stats_beat else {
            return;
        };

        let ikey = beat
            .instrumentation_key
            .as_deref()
            .or(self.settings.instrumentation_key.as_deref());
        let envelopes = match stats_beat_envelopes(&self.pipeline.stats.snapshot(), ikey) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                tracing::debug!(error = %e, "could not build stats beat");
                return;
            }
        };
        let payloads: Vec<String> = envelopes.iter().filter_map(|e| e.serialize().ok()).collect();
        let Some(payload) = format_batch(payloads.iter().map(String::as_str), BatchFormat::JsonArray) else {
            return;
        };

        let transport = self
            .settings
            .transport_policy
            .select(&self.transports, false, payload.len())
            .into_iter()
            .find(|t| t.kind() != TransportKind::Beacon);
        let Some(transport) = transport else {
            return;
        };

        let request = TransportRequest {
            url: beat.endpoint_url.clone(),
            payload,
            content_type: BatchFormat::JsonArray.content_type(),
            headers: Vec::new(),
            keep_alive: false,
        };
        match transport.send(request).await {
            Ok(TransportResponse::Completed { status, .. }) if (200..300).contains(&status) => {
                tracing::debug!(metrics = payloads.len(), "stats beat sent");
            }
            Ok(other) => {
                tracing::debug!(response = ?other, "stats beat not accepted");
            }
            Err(e) => {
                self.pipeline
                    .logger
                    .warn_once(MessageId::StatsBeatFailed, format!("Stats beat failed: {e}"));
            }
        }
    }
}
