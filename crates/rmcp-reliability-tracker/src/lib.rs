// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-tracker
#![deny(unsafe_code)]
//!
//! The Request Tracker Registry: a process-wide, purely observational map
//! from request id to a mutable lifecycle record. It never drives retry
//! decisions: the Retry Engine and Session Orchestrator call into it to
//! record what already happened.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rmcp_reliability_error::ReliabilityErrorDto;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an in-flight request.
///
/// Valid transitions: `pending -> sent -> (acked -> completed | retrying
/// -> sent | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Pending,
    Sent,
    Acked,
    Retrying,
    Completed,
    Failed,
}

/// Mutable per-request lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracker {
    pub request_id: Uuid,
    pub status: TrackerStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub last_error: Option<ReliabilityErrorDto>,
}

impl Tracker {
    fn new(request_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            status: TrackerStatus::Pending,
            attempt_count: 1,
            created_at: now,
            last_transition_at: now,
            last_error: None,
        }
    }
}

/// Process-wide registry of in-flight [`Tracker`]s.
///
/// Safe to read concurrently via [`TrackerRegistry::snapshot`]; mutators
/// serialize on a single mutex. Entries are removed on terminal
/// transitions (`completed` or `failed`) via [`TrackerRegistry::unregister`].
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: Mutex<BTreeMap<Uuid, Tracker>>,
}

impl TrackerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new `Tracker` for `request_id` in `pending`
    /// status with `attempt_count = 1`.
    pub fn register(&self, request_id: Uuid) {
        let tracker = Tracker::new(request_id);
        self.trackers
            .lock()
            .expect("tracker registry lock poisoned")
            .insert(request_id, tracker);
    }

    /// Remove the tracker for `request_id`, if present. Called on
    /// terminal transitions (success or terminal failure).
    pub fn unregister(&self, request_id: Uuid) -> Option<Tracker> {
        self.trackers
            .lock()
            .expect("tracker registry lock poisoned")
            .remove(&request_id)
    }

    /// Transition the tracker for `request_id` to `status`, optionally
    /// updating `attempt_count` and recording `error`. No-op if the
    /// tracker is not registered (e.g. it was already unregistered).
    pub fn update_status(
        &self,
        request_id: Uuid,
        status: TrackerStatus,
        attempt_count: Option<u32>,
        error: Option<ReliabilityErrorDto>,
    ) {
        let mut trackers = self.trackers.lock().expect("tracker registry lock poisoned");
        if let Some(tracker) = trackers.get_mut(&request_id) {
            tracker.status = status;
            tracker.last_transition_at = Utc::now();
            if let Some(count) = attempt_count {
                tracker.attempt_count = count;
            }
            if error.is_some() {
                tracker.last_error = error;
            }
        }
    }

    /// A read-only snapshot of every currently registered tracker.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Tracker> {
        self.trackers
            .lock()
            .expect("tracker registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Number of currently in-flight (registered) requests.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.trackers.lock().expect("tracker registry lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp_reliability_error::ErrorCode;

    #[test]
    fn register_creates_pending_tracker_with_one_attempt() {
        let registry = TrackerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, TrackerStatus::Pending);
        assert_eq!(snapshot[0].attempt_count, 1);
    }

    #[test]
    fn update_status_transitions_and_bumps_attempt_count() {
        let registry = TrackerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id);

        registry.update_status(id, TrackerStatus::Sent, None, None);
        registry.update_status(id, TrackerStatus::Retrying, Some(2), None);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].status, TrackerStatus::Retrying);
        assert_eq!(snapshot[0].attempt_count, 2);
    }

    #[test]
    fn update_status_records_last_error() {
        let registry = TrackerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id);

        let err = rmcp_reliability_error::ReliabilityError::new(
            ErrorCode::NetworkSendFailed,
            "boom",
        );
        let dto = ReliabilityErrorDto::from(&err);
        registry.update_status(id, TrackerStatus::Retrying, Some(2), Some(dto));

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot[0].last_error.as_ref().unwrap().code,
            ErrorCode::NetworkSendFailed
        );
    }

    #[test]
    fn unregister_removes_tracker() {
        let registry = TrackerRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id);
        assert_eq!(registry.active_count(), 1);

        let removed = registry.unregister(id);
        assert!(removed.is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn update_status_on_unregistered_id_is_a_no_op() {
        let registry = TrackerRegistry::new();
        let id = Uuid::new_v4();
        // Not registered; should not panic.
        registry.update_status(id, TrackerStatus::Sent, None, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn every_in_flight_call_has_exactly_one_tracker() {
        let registry = TrackerRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.active_count(), 2);
        registry.unregister(a);
        assert_eq!(registry.active_count(), 1);
    }
}
