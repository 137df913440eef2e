// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;

use fnv::FnvHasher;

use crate::record::{LogRecord, Severity};

/// Rate-based sampling settings. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    /// Keep roughly one in `rate` eligible records. 1 keeps everything.
    pub rate: u32,
    /// Restrict dropping to DEBUG-or-lower records.
    pub debug_only: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate: 1,
            debug_only: true,
        }
    }
}

/// Returns true when the record should be kept.
///
/// Precedence:
/// 1. no config or `rate <= 1` keeps
/// 2. ERROR and above keeps
/// 3. in debug-only mode, INFO and above keeps
/// 4. otherwise keep iff `content_hash(record) % rate == 0`
pub fn should_sample(record: &LogRecord, config: Option<&SamplingConfig>) -> bool {
    let Some(config) = config else {
        return true;
    };
    if config.rate <= 1 {
        return true;
    }
    if record.severity >= Severity::ERROR {
        return true;
    }
    if config.debug_only && record.severity >= Severity::INFO {
        return true;
    }
    content_hash(record) % u64::from(config.rate) == 0
}

/// Stable hash over body text and severity number.
///
/// FNV-1a 64 with a zero delimiter between the fields, followed by the MurmurHash3 64-bit
/// finalizer so the low bits used by the modulo are well mixed. No seed, so the result is
/// identical across processes and platforms.
pub fn content_hash(record: &LogRecord) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(record.body_text().as_bytes());
    hasher.write_u8(0);
    hasher.write(&record.severity.number().to_le_bytes());
    fmix64(hasher.finish())
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AttributeValue;
    use proptest::prelude::*;

    fn record(severity: Severity, body: &str) -> LogRecord {
        LogRecord {
            severity,
            body: Some(AttributeValue::from(body)),
            ..Default::default()
        }
    }

    fn config(rate: u32, debug_only: bool) -> SamplingConfig {
        SamplingConfig { rate, debug_only }
    }

    #[test]
    fn test_no_config_keeps_everything() {
        assert!(should_sample(&record(Severity::DEBUG, "x"), None));
    }

    #[test]
    fn test_rate_one_keeps_every_severity() {
        let cfg = config(1, false);
        for number in 0..=24 {
            let r = record(Severity::from_number(number), "some body");
            assert!(should_sample(&r, Some(&cfg)));
        }
    }

    #[test]
    fn test_errors_always_kept_at_extreme_rate() {
        let cfg = config(1000, false);
        for i in 0..200 {
            let r = record(Severity::ERROR, &format!("error number {i}"));
            assert!(should_sample(&r, Some(&cfg)));
            let r = record(Severity::FATAL, &format!("fatal number {i}"));
            assert!(should_sample(&r, Some(&cfg)));
        }
    }

    #[test]
    fn test_debug_only_keeps_info_and_above() {
        let cfg = config(1000, true);
        for i in 0..200 {
            for severity in [Severity::INFO, Severity::WARN, Severity::ERROR] {
                let r = record(severity, &format!("message {i}"));
                assert!(should_sample(&r, Some(&cfg)));
            }
        }
    }

    #[test]
    fn test_debug_only_drops_some_debug() {
        let cfg = config(1000, true);
        let kept = (0..1000)
            .filter(|i| should_sample(&record(Severity::DEBUG, &format!("debug {i}")), Some(&cfg)))
            .count();
        assert!(kept < 1000);
    }

    #[test]
    fn test_distribution_rate_ten() {
        let cfg = config(10, false);
        let kept = (0..1000)
            .filter(|i| {
                should_sample(
                    &record(Severity::INFO, &format!("distinct info message {i}")),
                    Some(&cfg),
                )
            })
            .count();
        assert!((50..=200).contains(&kept), "kept {kept} of 1000");
    }

    #[test]
    fn test_severity_participates_in_hash() {
        let a = record(Severity::from_number(5), "same body");
        let b = record(Severity::from_number(6), "same body");
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    proptest! {
        #[test]
        fn prop_decision_is_deterministic(body in ".*", number in 0i32..=24, rate in 1u32..5000) {
            let cfg = config(rate, false);
            let a = record(Severity::from_number(number), &body);
            let b = a.clone();
            prop_assert_eq!(should_sample(&a, Some(&cfg)), should_sample(&b, Some(&cfg)));
            prop_assert_eq!(content_hash(&a), content_hash(&b));
        }
    }
}
