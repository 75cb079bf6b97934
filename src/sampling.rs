//! Deterministic sampling
//!
//! An item's sampling score is derived from its user id, falling back to its
//! operation id, falling back to a random score. The hash is a DJB2 variant
//! over UTF-16 code units and must stay stable: the same id has to land on the
//! same side of the rate in every SDK version so that all telemetry of a user
//! or operation is kept or dropped together.

use rand::Rng;

use crate::diagnostics::{DiagnosticLogger, MessageId};
use crate::envelope::{tag_keys, TelemetryEnvelope};

const HASH_SEED: i32 = 5381;

/// Rate meaning "keep everything"
pub const SAMPLE_ALL: f64 = 100.0;

/// DJB2-style hash: `hash = ((hash << 5) + hash) + code_unit`, wrapped to
/// 32 bits on every step, absolute value of the result.
pub fn hash_code(input: &str) -> u32 {
    let hash = input.encode_utf16().fold(HASH_SEED, |hash, unit| {
        (hash << 5).wrapping_add(hash).wrapping_add(i32::from(unit))
    });
    hash.unsigned_abs()
}

/// Hash normalized into a score in `[0, 100]`
pub fn hash_code_score(key: &str) -> f64 {
    f64::from(hash_code(key)) / f64::from(i32::MAX) * 100.0
}

/// Score used for the include/exclude decision
pub fn sampling_score(envelope: &TelemetryEnvelope) -> f64 {
    if let Some(user_id) = envelope.tag(tag_keys::USER_ID) {
        hash_code_score(user_id)
    } else if let Some(operation_id) = envelope.tag(tag_keys::OPERATION_ID) {
        hash_code_score(operation_id)
    } else {
        rand::rng().random_range(0.0..SAMPLE_ALL)
    }
}

/// Include/exclude decision at a fixed rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    sample_rate: f64,
}

impl Sampler {
    /// Create a sampler; a rate outside `[0, 100]` disables sampling and
    /// raises a diagnostic warning.
    pub fn new(sample_rate: f64, logger: &DiagnosticLogger) -> Self {
        let sample_rate = if (0.0..=SAMPLE_ALL).contains(&sample_rate) {
            sample_rate
        } else {
            logger.warn_once(
                MessageId::SampleRateOutOfRange,
                format!("Sampling rate is out of range (0..100): {sample_rate}. Sampling will be disabled, you may be sending too much data which may affect your cost."),
            );
            SAMPLE_ALL
        };
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Whether sampling can drop anything at all
    pub fn is_active(&self) -> bool {
        self.sample_rate < SAMPLE_ALL
    }

    pub fn is_sampled_in(&self, envelope: &TelemetryEnvelope) -> bool {
        if !self.is_active() || envelope.is_metric() {
            return true;
        }
        sampling_score(envelope) < self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TelemetryItem;

    fn envelope_for_user(user: &str) -> TelemetryEnvelope {
        TelemetryItem::event("e")
            .with_tag(tag_keys::USER_ID, user)
            .into_envelope(None, "")
            .unwrap()
    }

    #[test]
    fn hash_matches_known_vectors() {
        assert_eq!(hash_code("ss"), 5_863_819);
        assert_eq!(hash_code("kxi"), 193_497_585);
        assert_eq!(hash_code(""), 5381);
    }

    #[test]
    fn score_is_normalized() {
        let score = hash_code_score("user-1");
        assert!((score - 25.893_849_239_635_212).abs() < 1e-9);
    }

    #[test]
    fn same_id_same_decision() {
        let logger = DiagnosticLogger::default();
        let sampler = Sampler::new(33.0, &logger);
        let envelope = envelope_for_user("some-user");
        let first = sampler.is_sampled_in(&envelope);
        for _ in 0..50 {
            assert_eq!(sampler.is_sampled_in(&envelope), first);
        }
    }

    #[test]
    fn boundary_rates() {
        let logger = DiagnosticLogger::default();
        let all = Sampler::new(100.0, &logger);
        let none = Sampler::new(0.0, &logger);

        for i in 0..20 {
            let envelope = envelope_for_user(&format!("user-{i}"));
            assert!(all.is_sampled_in(&envelope));
            assert!(!none.is_sampled_in(&envelope));
        }

        let metric = TelemetryItem::metric("m", 1.0)
            .with_tag(tag_keys::USER_ID, "user-1")
            .into_envelope(None, "")
            .unwrap();
        assert!(none.is_sampled_in(&metric));
    }

    #[test]
    fn operation_id_used_without_user() {
        let logger = DiagnosticLogger::default();
        // "user-1" scores ~25.9
        let sampler = Sampler::new(26.0, &logger);
        let envelope = TelemetryItem::event("e")
            .with_tag(tag_keys::OPERATION_ID, "user-1")
            .into_envelope(None, "")
            .unwrap();
        assert!(sampler.is_sampled_in(&envelope));

        let sampler = Sampler::new(25.0, &logger);
        assert!(!sampler.is_sampled_in(&envelope));
    }

    #[test]
    fn out_of_range_rate_disables_sampling() {
        let logger = DiagnosticLogger::default();
        let sampler = Sampler::new(150.0, &logger);
        assert_eq!(sampler.sample_rate(), 100.0);
        assert!(!sampler.is_active());

        let sampler = Sampler::new(-1.0, &logger);
        assert_eq!(sampler.sample_rate(), 100.0);

        let messages = logger.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::SampleRateOutOfRange);
    }
}
