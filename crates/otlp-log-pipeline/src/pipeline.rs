// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-record coordination: sampling, allowlist check, transform, routing, stats and
//! output, in that order.
//!
//! A [`Pipeline`] is built once at startup and shared by every front-end worker. Only
//! the allowlist contents, the counters and the output buffer change after
//! construction, each behind its own synchronization.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, trace};

use crate::allowlist::{self, Allowlist};
use crate::output::{JsonWriter, OutputEntry};
use crate::record::{LogRecord, Resource, Scope, Severity};
use crate::routing::{Route, Router};
use crate::sampling::{self, SamplingConfig};
use crate::transform::{self, TransformConfig, REDACTION_ACTION_PREFIX, TRUNCATION_ACTION};

pub const INDEX_ATTRIBUTE: &str = "index";

/// Pipeline counters.
///
/// Outcome counters are bumped with `Release` after `received`, and [`Stats::snapshot`]
/// reads them with `Acquire` before `received`. Every snapshot therefore satisfies
/// `received >= transformed + dropped_sampled + dropped_filtered`.
#[derive(Debug, Default)]
pub struct Stats {
    received: AtomicU64,
    transformed: AtomicU64,
    dropped_sampled: AtomicU64,
    dropped_filtered: AtomicU64,
    pci_redactions: AtomicU64,
    body_truncations: AtomicU64,
    by_severity: [AtomicU64; Severity::TIER_NAMES.len()],
    by_index: RwLock<HashMap<String, AtomicU64>>,
    transform_nanos: AtomicU64,
    transform_max_nanos: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub transformed: u64,
    pub dropped_sampled: u64,
    pub dropped_filtered: u64,
    pub pci_redactions: u64,
    pub body_truncations: u64,
    /// Records entering the pipeline per severity tier. Tiers never seen are omitted.
    pub logs_by_severity: BTreeMap<&'static str, u64>,
    /// Transformed records per routing index.
    pub logs_by_index: BTreeMap<String, u64>,
    /// Time spent in transform and routing, summed over all transformed records.
    pub transform_duration_micros: u64,
    pub max_transform_duration_micros: u64,
}

impl StatsSnapshot {
    pub fn mean_transform_duration(&self) -> Duration {
        match self.transformed {
            0 => Duration::ZERO,
            n => Duration::from_micros(self.transform_duration_micros / n),
        }
    }
}

impl Stats {
    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // outcomes first, `received` last
        let transformed = self.transformed.load(Ordering::Acquire);
        let dropped_sampled = self.dropped_sampled.load(Ordering::Acquire);
        let dropped_filtered = self.dropped_filtered.load(Ordering::Acquire);
        let received = self.received.load(Ordering::Acquire);

        let logs_by_severity = Severity::TIER_NAMES
            .iter()
            .zip(&self.by_severity)
            .map(|(name, count)| (*name, count.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        let logs_by_index = self
            .by_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(index, count)| (index.clone(), count.load(Ordering::Relaxed)))
            .collect();

        StatsSnapshot {
            received,
            transformed,
            dropped_sampled,
            dropped_filtered,
            pci_redactions: self.pci_redactions.load(Ordering::Relaxed),
            body_truncations: self.body_truncations.load(Ordering::Relaxed),
            logs_by_severity,
            logs_by_index,
            transform_duration_micros: self.transform_nanos.load(Ordering::Relaxed) / 1_000,
            max_transform_duration_micros: self.transform_max_nanos.load(Ordering::Relaxed)
                / 1_000,
        }
    }

    fn record_severity(&self, severity: Severity) {
        if let Some(count) = self.by_severity.get(severity.tier()) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_actions(&self, actions: &[String]) {
        for action in actions {
            if action.starts_with(REDACTION_ACTION_PREFIX) {
                self.pci_redactions.fetch_add(1, Ordering::Relaxed);
            } else if action == TRUNCATION_ACTION {
                self.body_truncations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_index(&self, index: &str) {
        let counts = self.by_index.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get(index) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        drop(counts);

        self.by_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(index.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_transform_duration(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.transform_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.transform_max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sampled,
    Filtered,
    Processed { index: String, rule: String },
}

#[derive(Debug)]
pub struct Pipeline {
    sampling: Option<SamplingConfig>,
    allowlist: Arc<Allowlist>,
    transform: TransformConfig,
    router: Router,
    writer: Option<Arc<JsonWriter>>,
    stats: Stats,
}

impl Pipeline {
    /// A pipeline that keeps everything, allows every application and writes nothing.
    pub fn new(transform: TransformConfig, router: Router) -> Self {
        Self {
            sampling: None,
            allowlist: Arc::new(Allowlist::default()),
            transform,
            router,
            writer: None,
            stats: Stats::default(),
        }
    }

    /// Sampling is disabled when `rate <= 1`.
    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = (sampling.rate > 1).then_some(sampling);
        self
    }

    pub fn with_allowlist(mut self, allowlist: Arc<Allowlist>) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn with_writer(mut self, writer: Arc<JsonWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn allowlist(&self) -> &Arc<Allowlist> {
        &self.allowlist
    }

    pub fn writer(&self) -> Option<&Arc<JsonWriter>> {
        self.writer.as_ref()
    }

    /// Runs one record through every stage. The caller has already counted it as
    /// received.
    pub fn process(&self, resource: &Resource, scope: &Scope, mut record: LogRecord) -> Outcome {
        self.stats.record_severity(record.severity);

        if !sampling::should_sample(&record, self.sampling.as_ref()) {
            self.stats.dropped_sampled.fetch_add(1, Ordering::Release);
            debug!(
                "Sampled out record (severity: {})",
                record.severity_display()
            );
            return Outcome::Sampled;
        }

        if !self.allowlist.is_allowed(&record) {
            self.stats.dropped_filtered.fetch_add(1, Ordering::Release);
            debug!(
                "Filtered record from {} (not in allowlist)",
                allowlist::app_name(&record).unwrap_or("<unknown>")
            );
            return Outcome::Filtered;
        }

        let started = Instant::now();
        let actions = transform::apply(&mut record, &self.transform);
        self.stats.record_actions(&actions);
        trace!(
            scope = %scope.name,
            "Applied transforms: {}",
            actions.join(", ")
        );

        let route = self.router.route(&record);
        let (index, rule) = (route.index.to_string(), route.rule.to_string());
        record.set_attribute(INDEX_ATTRIBUTE, index.as_str());
        self.stats.record_transform_duration(started.elapsed());
        debug!("Routed record to {index} (rule: {rule})");

        self.stats.record_index(&index);
        self.stats.transformed.fetch_add(1, Ordering::Release);

        if let Some(writer) = &self.writer {
            let route = Route {
                index: &index,
                rule: &rule,
            };
            let entry = OutputEntry::new(resource, &record, route, actions);
            if let Err(e) = writer.write(entry) {
                error!("Failed to write record to output: {e}");
            }
        }

        Outcome::Processed { index, rule }
    }
}
