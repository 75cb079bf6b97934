//! Main entry point for recording telemetry

use bon::bon;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{ArraySendBuffer, BatchFormat, PersistedSendBuffer, SendBuffer};
use crate::config::ChannelConfig;
use crate::connectivity::{ConnectivityHost, ManualConnectivity, OfflineListener};
use crate::context::{ContextProvider, NoContext};
use crate::data_loss::DataLossAnalyzer;
use crate::diagnostics::{InternalMessage, MessageId, PipelineContext};
use crate::enrichment::Enricher;
use crate::envelope::{RemoteDependencyData, SeverityLevel, TelemetryItem, TelemetryKind};
use crate::error::Result;
use crate::sampling::Sampler;
use crate::sender::{FlushReport, Sender};
use crate::stats::EndpointSnapshot;
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{http_client, HttpTransport, Transport};

/// Records telemetry and hands it to the delivery pipeline.
///
/// `track_*` calls never fail and never block on the network; problems are
/// recorded as internal diagnostics instead.
pub struct TelemetryClient {
    enricher: Enricher,
    sender: Sender,
    connectivity: Arc<OfflineListener>,
    data_loss: Arc<DataLossAnalyzer>,
    pipeline: PipelineContext,
    persistent: bool,
    restored: usize,
    unloaded: AtomicBool,
}

#[bon]
impl TelemetryClient {
    /// Create a client and start its sender.
    ///
    /// Must be called within a tokio runtime. Unset collaborators default
    /// to: no context ids, in-memory storage, an always-online host and
    /// reqwest-backed transports.
    #[builder]
    pub fn new(
        #[builder(default)] config: ChannelConfig,
        context: Option<Arc<dyn ContextProvider>>,
        storage: Option<Arc<dyn Storage>>,
        connectivity: Option<Arc<dyn ConnectivityHost>>,
        transports: Option<Vec<Arc<dyn Transport>>>,
    ) -> Result<Self> {
        let mut config = config;
        let pipeline = PipelineContext::new(config.max_internal_messages);
        config.validate(&pipeline.logger)?;

        let context = context.unwrap_or_else(|| Arc::new(NoContext));
        let storage: Arc<dyn Storage> = storage.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let host = connectivity.unwrap_or_else(|| Arc::new(ManualConnectivity::default()));
        let transports = transports.unwrap_or_else(|| HttpTransport::all(http_client(None, None, None)));

        let format = BatchFormat::from_line_delimited(config.emit_line_delimited_json);
        let (buffer, restored): (Box<dyn SendBuffer>, usize) = if config.store_send_buffer {
            let buffer = PersistedSendBuffer::new(
                storage.clone(),
                &config.name_prefix,
                format,
                config.max_stored_items,
                pipeline.logger.clone(),
            );
            let restored = buffer.restored_count();
            (Box::new(buffer), restored)
        } else {
            let buffer = ArraySendBuffer::new(format, config.events_limit_in_mem, pipeline.logger.clone());
            (Box::new(buffer), 0)
        };

        let sampler = Sampler::new(config.sampling_percentage, &pipeline.logger);
        let enricher = Enricher::new(
            context,
            sampler,
            config.instrumentation_key.clone(),
            config.name_prefix.clone(),
            config.disable_telemetry,
            pipeline.logger.clone(),
        );

        let connectivity = Arc::new(OfflineListener::new(host));
        if !connectivity.is_listening() {
            pipeline.logger.warn_once(
                MessageId::ConnectivityUnavailable,
                "Connectivity events unavailable, polling the host on every send",
            );
        }

        let data_loss = Arc::new(DataLossAnalyzer::new(
            storage,
            &config.name_prefix,
            pipeline.logger.clone(),
        ));

        let persistent = config.store_send_buffer;
        let sender = Sender::builder()
            .config(config)
            .buffer(buffer)
            .transports(transports)
            .connectivity(connectivity.clone())
            .pipeline(pipeline.clone())
            .data_loss(data_loss.clone())
            .build();

        tracing::debug!(persistent, restored, "telemetry client started");

        Ok(Self {
            enricher,
            sender,
            connectivity,
            data_loss,
            pipeline,
            persistent,
            restored,
            unloaded: AtomicBool::new(false),
        })
    }

    /// Create a client from environment variables
    ///
    /// See [`ChannelConfig::from_env`] for the variables read.
    pub fn from_env() -> Result<Self> {
        Self::builder().config(ChannelConfig::from_env()?).build()
    }
}

impl TelemetryClient {
    /// Record one telemetry item
    pub fn track(&self, item: TelemetryItem) {
        let Some(envelope) = self.enricher.process(item) else {
            return;
        };
        match envelope.serialize() {
            Ok(payload) => {
                self.sender.enqueue(payload);
            }
            Err(e) => self.pipeline.logger.warn(
                MessageId::SerializationFailed,
                format!("Failed to serialize telemetry: {e}"),
            ),
        }
    }

    pub fn track_event(&self, name: impl Into<String>) {
        self.track(TelemetryItem::event(name));
    }

    pub fn track_trace(&self, message: impl Into<String>, severity_level: SeverityLevel) {
        self.track(TelemetryItem::trace(message, severity_level));
    }

    pub fn track_exception(&self, type_name: impl Into<String>, message: impl Into<String>) {
        self.track(TelemetryItem::exception(type_name, message));
    }

    pub fn track_metric(&self, name: impl Into<String>, value: f64) {
        self.track(TelemetryItem::metric(name, value));
    }

    pub fn track_page_view(&self, name: impl Into<String>, uri: Option<String>) {
        self.track(TelemetryItem::page_view(name, uri));
    }

    pub fn track_dependency(&self, dependency: RemoteDependencyData) {
        self.track(TelemetryItem::new(TelemetryKind::RemoteDependency(dependency)));
    }

    /// Send everything buffered now
    pub async fn flush(&self) -> FlushReport {
        self.sender.flush().await
    }

    /// The host is about to become invisible: flush with the most
    /// unload-safe transport and report unacknowledged items.
    pub async fn on_visibility_hidden(&self) -> FlushReport {
        let mut report = self.sender.flush_on_unload().await;

        let retained = if self.persistent {
            self.sender.buffer_len() + self.sender.in_flight_len()
        } else {
            0
        };
        if let Some(loss_report) = self.data_loss.report_lost_items(retained) {
            self.track(loss_report);
            let follow_up = self.sender.flush_on_unload().await;
            report.attempts += follow_up.attempts;
            report.sent += follow_up.sent;
            report.requeued += follow_up.requeued;
            report.dropped += follow_up.dropped;
            report.skipped |= follow_up.skipped;
        }

        report
    }

    /// The host is going away. Flushes once and detaches from the
    /// connectivity host; later calls do nothing.
    pub async fn unload(&self) -> FlushReport {
        if self.unloaded.swap(true, Ordering::Relaxed) {
            return FlushReport::default();
        }
        let report = self.on_visibility_hidden().await;
        self.connectivity.unload();
        report
    }

    /// Stop sending on timer and size triggers; items keep buffering
    pub fn pause(&self) {
        self.sender.pause();
    }

    pub fn resume(&self) {
        self.sender.resume();
    }

    /// Stop the sender after a final flush. Idempotent.
    pub async fn shutdown(&self) -> FlushReport {
        let report = self.sender.shutdown().await;
        self.connectivity.unload();
        report
    }

    /// Request counters per endpoint
    pub fn statistics(&self) -> BTreeMap<String, EndpointSnapshot> {
        self.pipeline.stats.snapshot()
    }

    /// Number of items waiting to be sent
    pub fn buffer_len(&self) -> usize {
        self.sender.buffer_len()
    }

    /// Items recovered from a persisted buffer at startup
    pub fn restored_count(&self) -> usize {
        self.restored
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Internal messages recorded this session
    pub fn diagnostics(&self) -> Vec<InternalMessage> {
        self.pipeline.logger.messages()
    }

    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }
}
