//! Channel configuration

use bon::Builder;
use std::time::Duration;

use crate::buffer::{DEFAULT_EVENTS_LIMIT_IN_MEM, DEFAULT_MAX_STORED_ITEMS};
use crate::diagnostics::{DiagnosticLogger, MessageId, DEFAULT_MAX_INTERNAL_MESSAGES};
use crate::error::{Error, Result};
use crate::retry::{DEFAULT_MAX_RETRY_DELAY, DEFAULT_SLOT_DELAY};
use crate::sampling::SAMPLE_ALL;
use crate::stats::DEFAULT_STATS_BEAT_INTERVAL;
use crate::transport::TransportPolicy;

/// Default ingestion endpoint
pub const DEFAULT_ENDPOINT_URL: &str = "https://dc.services.visualstudio.com/v2/track";

/// Default batch size trigger in bytes
pub const DEFAULT_MAX_BATCH_SIZE_IN_BYTES: usize = 1_000_000;

/// Default timer flush interval
pub const DEFAULT_MAX_BATCH_INTERVAL: Duration = Duration::from_secs(15);

/// Where and how often the stats beat is posted
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct StatsBeatConfig {
    #[builder(into, default = DEFAULT_ENDPOINT_URL.to_string())]
    pub endpoint_url: String,
    #[builder(into)]
    pub instrumentation_key: Option<String>,
    #[builder(default = DEFAULT_STATS_BEAT_INTERVAL)]
    pub interval: Duration,
}

impl Default for StatsBeatConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration of one telemetry channel
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct ChannelConfig {
    /// Collection endpoint receiving the batches
    #[builder(into, default = DEFAULT_ENDPOINT_URL.to_string())]
    pub endpoint_url: String,
    /// Key identifying the target resource, copied into every envelope
    #[builder(into)]
    pub instrumentation_key: Option<String>,
    /// Pending bytes that trigger a flush
    #[builder(default = DEFAULT_MAX_BATCH_SIZE_IN_BYTES)]
    pub max_batch_size_in_bytes: usize,
    /// Upper bound on items per request
    pub max_batch_items: Option<usize>,
    /// How often the timer flushes
    #[builder(default = DEFAULT_MAX_BATCH_INTERVAL)]
    pub max_batch_interval: Duration,
    /// Send newline-delimited JSON instead of a JSON array
    #[builder(default)]
    pub emit_line_delimited_json: bool,
    /// Drop everything at the enrichment stage
    #[builder(default)]
    pub disable_telemetry: bool,
    /// Percentage of items kept, in `[0, 100]`
    #[builder(default = SAMPLE_ALL)]
    pub sampling_percentage: f64,
    /// Mirror the send buffer into storage
    #[builder(default)]
    pub store_send_buffer: bool,
    #[builder(default = DEFAULT_MAX_STORED_ITEMS)]
    pub max_stored_items: usize,
    #[builder(default = DEFAULT_EVENTS_LIMIT_IN_MEM)]
    pub events_limit_in_mem: usize,
    #[builder(default)]
    pub is_beacon_api_disabled: bool,
    #[builder(default)]
    pub onunload_disable_beacon: bool,
    #[builder(default)]
    pub onunload_disable_fetch: bool,
    #[builder(default)]
    pub disable_xhr: bool,
    /// Treat retryable failures as permanent
    #[builder(default)]
    pub is_retry_disabled: bool,
    #[builder(default = DEFAULT_SLOT_DELAY)]
    pub retry_slot_delay: Duration,
    #[builder(default = DEFAULT_MAX_RETRY_DELAY)]
    pub max_retry_delay: Duration,
    /// Extra headers sent with every request
    #[builder(default)]
    pub custom_headers: Vec<(String, String)>,
    /// Prepended to envelope names and storage keys
    #[builder(into, default)]
    pub name_prefix: String,
    pub stats_beat: Option<StatsBeatConfig>,
    #[builder(default = DEFAULT_MAX_INTERNAL_MESSAGES)]
    pub max_internal_messages: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ChannelConfig {
    /// Configuration from environment variables, defaults elsewhere.
    ///
    /// Reads:
    /// - `TELEMETRY_ENDPOINT_URL`
    /// - `TELEMETRY_INSTRUMENTATION_KEY`
    /// - `TELEMETRY_SAMPLING_PERCENTAGE`
    /// - `TELEMETRY_DISABLED` (`true`/`1`)
    pub fn from_env() -> Result<Self> {
        use std::env;

        let mut config = Self::default();

        if let Ok(url) = env::var("TELEMETRY_ENDPOINT_URL") {
            config.endpoint_url = url;
        }
        if let Ok(key) = env::var("TELEMETRY_INSTRUMENTATION_KEY") {
            config.instrumentation_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(rate) = env::var("TELEMETRY_SAMPLING_PERCENTAGE") {
            config.sampling_percentage = rate.trim().parse().map_err(|_| {
                Error::Configuration(format!(
                    "TELEMETRY_SAMPLING_PERCENTAGE is not a number: {rate:?}"
                ))
            })?;
        }
        if let Ok(disabled) = env::var("TELEMETRY_DISABLED") {
            config.disable_telemetry = matches!(disabled.trim(), "1" | "true" | "TRUE" | "True");
        }

        Ok(config)
    }

    /// Check the configuration, correcting out-of-range values with a
    /// warning. Only an unusable endpoint URL is an error.
    pub fn validate(&mut self, logger: &DiagnosticLogger) -> Result<()> {
        let url = reqwest::Url::parse(&self.endpoint_url).map_err(|e| {
            Error::Configuration(format!("Invalid endpoint URL {:?}: {e}", self.endpoint_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "Endpoint URL must be http(s): {}",
                self.endpoint_url
            )));
        }

        if self.max_batch_size_in_bytes == 0 {
            tracing::warn!("max_batch_size_in_bytes is 0, using default");
            self.max_batch_size_in_bytes = DEFAULT_MAX_BATCH_SIZE_IN_BYTES;
        }
        if self.max_batch_items == Some(0) {
            tracing::warn!("max_batch_items is 0, ignoring");
            self.max_batch_items = None;
        }
        if self.max_batch_interval.is_zero() {
            tracing::warn!("max_batch_interval is 0, using default");
            self.max_batch_interval = DEFAULT_MAX_BATCH_INTERVAL;
        }
        if self.retry_slot_delay.is_zero() {
            tracing::warn!("retry_slot_delay is 0, using default");
            self.retry_slot_delay = DEFAULT_SLOT_DELAY;
        }
        if self.max_retry_delay < self.retry_slot_delay {
            tracing::warn!(
                max_retry_delay = ?self.max_retry_delay,
                retry_slot_delay = ?self.retry_slot_delay,
                "max_retry_delay below retry_slot_delay, raising it"
            );
            self.max_retry_delay = self.retry_slot_delay;
        }
        if self.sampling_percentage.is_nan() || !(0.0..=SAMPLE_ALL).contains(&self.sampling_percentage) {
            logger.warn_once(
                MessageId::SampleRateOutOfRange,
                format!(
                    "Sampling rate is out of range (0..100): {}. Sampling will be disabled.",
                    self.sampling_percentage
                ),
            );
            self.sampling_percentage = SAMPLE_ALL;
        }
        if let Some(stats_beat) = &mut self.stats_beat {
            if stats_beat.interval.is_zero() {
                stats_beat.interval = DEFAULT_STATS_BEAT_INTERVAL;
            }
        }

        Ok(())
    }

    pub fn transport_policy(&self) -> TransportPolicy {
        TransportPolicy {
            is_beacon_api_disabled: self.is_beacon_api_disabled,
            onunload_disable_beacon: self.onunload_disable_beacon,
            onunload_disable_fetch: self.onunload_disable_fetch,
            disable_xhr: self.disable_xhr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.endpoint_url, DEFAULT_ENDPOINT_URL);
        assert_eq!(config.max_batch_size_in_bytes, 1_000_000);
        assert_eq!(config.max_batch_interval, Duration::from_secs(15));
        assert_eq!(config.sampling_percentage, 100.0);
        assert_eq!(config.max_stored_items, 2000);
        assert!(!config.store_send_buffer);
        assert!(config.stats_beat.is_none());
    }

    #[test]
    fn builder_overrides() {
        let config = ChannelConfig::builder()
            .endpoint_url("http://localhost:1234/track")
            .instrumentation_key("ikey")
            .emit_line_delimited_json(true)
            .max_batch_items(10)
            .build();
        assert_eq!(config.endpoint_url, "http://localhost:1234/track");
        assert_eq!(config.instrumentation_key.as_deref(), Some("ikey"));
        assert!(config.emit_line_delimited_json);
        assert_eq!(config.max_batch_items, Some(10));
    }

    #[test]
    fn validate_corrects_values() {
        let logger = DiagnosticLogger::default();
        let mut config = ChannelConfig::builder()
            .sampling_percentage(150.0)
            .max_batch_size_in_bytes(0)
            .max_retry_delay(Duration::from_secs(1))
            .build();
        config.validate(&logger).unwrap();

        assert_eq!(config.sampling_percentage, 100.0);
        assert_eq!(config.max_batch_size_in_bytes, DEFAULT_MAX_BATCH_SIZE_IN_BYTES);
        assert_eq!(config.max_retry_delay, config.retry_slot_delay);
        assert!(logger.has_message(MessageId::SampleRateOutOfRange));
    }

    #[test]
    fn validate_rejects_bad_endpoint() {
        let logger = DiagnosticLogger::default();
        let mut config = ChannelConfig::builder().endpoint_url("not a url").build();
        assert!(matches!(
            config.validate(&logger),
            Err(Error::Configuration(_))
        ));

        let mut config = ChannelConfig::builder().endpoint_url("ftp://host/track").build();
        assert!(config.validate(&logger).is_err());
    }
}
