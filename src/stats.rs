//! Per-endpoint request statistics
//!
//! Counters are purely additive and live for the lifetime of the process.
//! They feed the stats beat and are never consulted for flow decisions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::envelope::{MetricData, TelemetryEnvelope, TelemetryItem, TelemetryKind};
use crate::error::Result;
use crate::retry::{is_retryable_status, is_throttle_status};

/// Default interval between two stats beats
pub const DEFAULT_STATS_BEAT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Lock-free counters for one endpoint
#[derive(Debug, Default)]
pub struct EndpointCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    throttles: AtomicU64,
    exceptions: AtomicU64,
    duration_ms: AtomicU64,
}

impl EndpointCounters {
    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            duration_ms: self.duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one endpoint's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub throttles: u64,
    pub exceptions: u64,
    /// Accumulated duration of successful requests
    pub duration_ms: u64,
}

/// Counters keyed by endpoint URL
#[derive(Debug, Default)]
pub struct Statistics {
    endpoints: Mutex<BTreeMap<String, Arc<EndpointCounters>>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, endpoint: &str) -> Arc<EndpointCounters> {
        let mut endpoints = match self.endpoints.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counters = endpoints.entry(endpoint.to_string()).or_default().clone();
        counters
    }

    /// Count a completed request by its response status
    pub fn count(&self, status: u16, endpoint: &str) {
        self.count_with_duration(status, endpoint, Duration::ZERO);
    }

    pub fn count_with_duration(&self, status: u16, endpoint: &str, duration: Duration) {
        let counters = self.counters(endpoint);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if (200..300).contains(&status) {
            counters.successes.fetch_add(1, Ordering::Relaxed);
            counters
                .duration_ms
                .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            if is_throttle_status(status) {
                counters.throttles.fetch_add(1, Ordering::Relaxed);
            }
            if is_retryable_status(status) {
                counters.retries.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Count a request that produced no response
    pub fn count_exception(&self, endpoint: &str) {
        let counters = self.counters(endpoint);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        counters.exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_retry(&self, endpoint: &str) {
        self.counters(endpoint)
            .retries
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_throttle(&self, endpoint: &str) {
        self.counters(endpoint)
            .throttles
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint(&self, endpoint: &str) -> EndpointSnapshot {
        let Ok(endpoints) = self.endpoints.lock() else {
            return EndpointSnapshot::default();
        };
        let snapshot = endpoints.get(endpoint).map(|c| c.snapshot());
        snapshot.unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, EndpointSnapshot> {
        let Ok(endpoints) = self.endpoints.lock() else {
            return BTreeMap::new();
        };
        let snapshot = endpoints
            .iter()
            .map(|(endpoint, counters)| (endpoint.clone(), counters.snapshot()))
            .collect();
        snapshot
    }
}

/// Convert the current counters into metric envelopes for the stats beat.
/// Zero-valued counters are skipped.
pub fn stats_beat_envelopes(
    snapshot: &BTreeMap<String, EndpointSnapshot>,
    instrumentation_key: Option<&str>,
) -> Result<Vec<TelemetryEnvelope>> {
    let mut envelopes = Vec::new();

    for (endpoint, counters) in snapshot {
        let metrics = [
            ("Request_Success_Count", counters.successes),
            ("Requests_Failure_Count", counters.failures),
            ("Retry_Count", counters.retries),
            ("Throttle_Count", counters.throttles),
            ("Exception_Count", counters.exceptions),
        ];

        for (name, value) in metrics {
            if value == 0 {
                continue;
            }
            let item = TelemetryItem::new(TelemetryKind::Metric(MetricData {
                name: name.to_string(),
                value: value as f64,
                count: None,
                min: None,
                max: None,
            }))
            .with_property("endpoint", endpoint.clone());
            envelopes.push(item.into_envelope(instrumentation_key, "")?);
        }

        if counters.successes > 0 && counters.duration_ms > 0 {
            let average = counters.duration_ms as f64 / counters.successes as f64;
            let item = TelemetryItem::metric("Request_Duration", average)
                .with_property("endpoint", endpoint.clone());
            envelopes.push(item.into_envelope(instrumentation_key, "")?);
        }
    }

    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str = "https://example.test/v2/track";

    #[test]
    fn counts_by_status() {
        let stats = Statistics::new();
        stats.count(200, ENDPOINT);
        stats.count(206, ENDPOINT);
        stats.count(429, ENDPOINT);
        stats.count(500, ENDPOINT);
        stats.count(404, ENDPOINT);
        stats.count_exception(ENDPOINT);

        let snapshot = stats.endpoint(ENDPOINT);
        assert_eq!(snapshot.requests, 6);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 3);
        assert_eq!(snapshot.throttles, 1);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.exceptions, 1);
    }

    #[test]
    fn endpoints_are_independent() {
        let stats = Statistics::new();
        stats.count_retry("a");
        stats.count_throttle("b");

        assert_eq!(stats.endpoint("a").retries, 1);
        assert_eq!(stats.endpoint("a").throttles, 0);
        assert_eq!(stats.endpoint("b").throttles, 1);
        assert_eq!(stats.endpoint("missing"), EndpointSnapshot::default());
        assert_eq!(stats.snapshot().len(), 2);
    }

    #[test]
    fn beat_skips_zero_counters() {
        let stats = Statistics::new();
        stats.count_with_duration(200, ENDPOINT, Duration::from_millis(40));
        stats.count_with_duration(200, ENDPOINT, Duration::from_millis(60));
        stats.count_exception(ENDPOINT);

        let envelopes = stats_beat_envelopes(&stats.snapshot(), Some("ikey")).unwrap();
        let names: Vec<_> = envelopes
            .iter()
            .map(|e| e.data.base_data["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["Request_Success_Count", "Exception_Count", "Request_Duration"]
        );
        assert_eq!(envelopes[2].data.base_data["value"], 50.0);
        assert!(envelopes.iter().all(|e| e.is_metric()));
    }
}
