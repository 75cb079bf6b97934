//! Turning raw telemetry into enriched, sampled envelopes

use std::sync::Arc;

use crate::context::ContextProvider;
use crate::diagnostics::{DiagnosticLogger, MessageId};
use crate::envelope::{tag_keys, TelemetryEnvelope, TelemetryItem};
use crate::sampling::Sampler;

/// First stage of the pipeline.
///
/// Copies context ids into the item's tags (caller-set tags win), wraps the
/// item into an envelope and applies sampling. Nothing here touches shared
/// state besides reading the context provider.
pub struct Enricher {
    context: Arc<dyn ContextProvider>,
    sampler: Sampler,
    instrumentation_key: Option<String>,
    name_prefix: String,
    disabled: bool,
    logger: Arc<DiagnosticLogger>,
}

impl Enricher {
    pub fn new(
        context: Arc<dyn ContextProvider>,
        sampler: Sampler,
        instrumentation_key: Option<String>,
        name_prefix: String,
        disabled: bool,
        logger: Arc<DiagnosticLogger>,
    ) -> Self {
        Self {
            context,
            sampler,
            instrumentation_key,
            name_prefix,
            disabled,
            logger,
        }
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Enrich and sample one item. `None` when telemetry is disabled, the
    /// item was sampled out or it could not be converted.
    pub fn process(&self, mut item: TelemetryItem) -> Option<TelemetryEnvelope> {
        if self.disabled {
            return None;
        }

        let ids = [
            (tag_keys::USER_ID, self.context.user_id()),
            (tag_keys::SESSION_ID, self.context.session_id()),
            (tag_keys::OPERATION_ID, self.context.correlation_id()),
        ];
        for (key, value) in ids {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                item.tags.entry(key.to_string()).or_insert(value);
            }
        }

        let mut envelope = match item.into_envelope(self.instrumentation_key.as_deref(), &self.name_prefix) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.logger.warn(
                    MessageId::SerializationFailed,
                    format!("Failed to build telemetry envelope: {e}"),
                );
                return None;
            }
        };
        envelope.sanitize();

        if self.sampler.is_active() {
            envelope.sample_rate = Some(self.sampler.sample_rate());
        }

        if !self.sampler.is_sampled_in(&envelope) {
            tracing::trace!(name = %envelope.name, "telemetry item sampled out");
            return None;
        }

        Some(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NoContext, StaticContext};

    fn enricher(context: Arc<dyn ContextProvider>, rate: f64, disabled: bool) -> Enricher {
        let logger = Arc::new(DiagnosticLogger::default());
        let sampler = Sampler::new(rate, &logger);
        Enricher::new(
            context,
            sampler,
            Some("1a2b-3c".to_string()),
            String::new(),
            disabled,
            logger,
        )
    }

    #[test]
    fn context_ids_fill_missing_tags() {
        let context = StaticContext::new();
        context.set_user_id(Some("user".to_string()));
        context.set_session_id(Some("session".to_string()));
        context.set_correlation_id(Some("op".to_string()));
        let enricher = enricher(Arc::new(context), 100.0, false);

        let envelope = enricher
            .process(TelemetryItem::event("click").with_tag(tag_keys::USER_ID, "caller"))
            .unwrap();

        assert_eq!(envelope.tag(tag_keys::USER_ID), Some("caller"));
        assert_eq!(envelope.tag(tag_keys::SESSION_ID), Some("session"));
        assert_eq!(envelope.tag(tag_keys::OPERATION_ID), Some("op"));
        assert_eq!(envelope.name, "1a2b3c.Event");
        assert_eq!(envelope.sample_rate, None);
    }

    #[test]
    fn disabled_channel_drops_everything() {
        let enricher = enricher(Arc::new(NoContext), 100.0, true);
        assert!(enricher.process(TelemetryItem::event("e")).is_none());
        assert!(enricher.process(TelemetryItem::metric("m", 1.0)).is_none());
    }

    #[test]
    fn zero_rate_keeps_only_metrics() {
        let enricher = enricher(Arc::new(NoContext), 0.0, false);
        assert!(enricher.process(TelemetryItem::event("e")).is_none());

        let metric = enricher.process(TelemetryItem::metric("m", 1.0)).unwrap();
        assert_eq!(metric.sample_rate, Some(0.0));
    }
}
