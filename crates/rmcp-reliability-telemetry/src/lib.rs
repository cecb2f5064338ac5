// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-telemetry
#![deny(unsafe_code)]
//!
//! Call-level metrics collection. Independent of `tracing`: a
//! [`MetricsCollector`] records one [`CallMetrics`] per completed
//! `call_tool` regardless of whether a tracing subscriber is installed.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// How a single `call_tool` invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    TerminalError,
    Cancelled,
}

/// One completed `call_tool` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallMetrics {
    pub tool_name: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub dedup_hit: bool,
    pub outcome: CallOutcome,
}

/// Linear-interpolated percentile over a sorted slice, matching the
/// convention used elsewhere in this codebase's ambient metrics stack.
#[must_use]
pub fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let weight = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
}

/// Aggregate view over every [`CallMetrics`] recorded so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    pub count: usize,
    pub mean_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub dedup_hit_rate: f64,
    pub success_count: usize,
    pub terminal_error_count: usize,
    pub cancelled_count: usize,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            dedup_hit_rate: 0.0,
            success_count: 0,
            terminal_error_count: 0,
            cancelled_count: 0,
        }
    }
}

/// Thread-safe sink for [`CallMetrics`].
#[derive(Default)]
pub struct MetricsCollector {
    calls: Mutex<Vec<CallMetrics>>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metrics: CallMetrics) {
        self.calls.lock().expect("metrics collector lock poisoned").push(metrics);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CallMetrics> {
        self.calls.lock().expect("metrics collector lock poisoned").clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.lock().expect("metrics collector lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.calls.lock().expect("metrics collector lock poisoned").clear();
    }

    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let calls = self.calls();
        if calls.is_empty() {
            return MetricsSummary::default();
        }

        let mut durations: Vec<u64> = calls.iter().map(|c| c.duration_ms).collect();
        durations.sort_unstable();

        let mean = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
        let dedup_hits = calls.iter().filter(|c| c.dedup_hit).count();
        let success_count = calls
            .iter()
            .filter(|c| c.outcome == CallOutcome::Success)
            .count();
        let terminal_error_count = calls
            .iter()
            .filter(|c| c.outcome == CallOutcome::TerminalError)
            .count();
        let cancelled_count = calls
            .iter()
            .filter(|c| c.outcome == CallOutcome::Cancelled)
            .count();

        MetricsSummary {
            count: calls.len(),
            mean_duration_ms: mean,
            p50_duration_ms: percentile(&durations, 50.0),
            p99_duration_ms: percentile(&durations, 99.0),
            dedup_hit_rate: dedup_hits as f64 / calls.len() as f64,
            success_count,
            terminal_error_count,
            cancelled_count,
        }
    }
}
