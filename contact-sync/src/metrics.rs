//! Metrics and statistics for sync operations

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reconcile::{PlanSummary, Side};

/// Metrics collected over one sync cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetrics {
    /// Unique session identifier
    pub session_id: Uuid,
    /// Start time of the sync operation
    pub start_time: SystemTime,
    /// End time of the sync operation
    pub end_time: Option<SystemTime>,
    /// Total duration of the sync operation
    pub duration: Duration,
    /// Contact statistics
    pub contacts: ContactStats,
    /// Time spent per phase
    pub phases: PhaseStats,
    /// Error statistics
    pub errors: ErrorStats,
}

/// Contact-related statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactStats {
    /// Contacts fetched from the local source
    pub fetched_local: usize,
    /// Contacts fetched from the remote source
    pub fetched_remote: usize,
    /// Contacts queued as additions to local
    pub added_to_local: usize,
    /// Contacts queued as additions to remote
    pub added_to_remote: usize,
    /// Contacts pushed unmodified to local
    pub updated_local: usize,
    /// Contacts pushed unmodified to remote
    pub updated_remote: usize,
    /// Contacts merged and written to both sides
    pub merged: usize,
    /// Contacts left alone
    pub unchanged: usize,
    /// Snapshots written
    pub persisted: usize,
    /// Stale snapshots pruned
    pub pruned: usize,
}

/// Wall-clock time per pipeline phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseStats {
    pub fetch: Duration,
    pub reconcile: Duration,
    pub update: Duration,
    pub persist: Duration,
}

/// Error and warning statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Total number of errors
    pub total_errors: usize,
    /// Total number of warnings
    pub total_warnings: usize,
    /// Errors by type
    pub errors_by_type: HashMap<String, usize>,
    /// Errors that stopped the sync
    pub critical_errors: Vec<String>,
    /// Errors that were logged and skipped
    pub recoverable_errors: Vec<String>,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    /// Create new sync metrics
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            start_time: SystemTime::now(),
            end_time: None,
            duration: Duration::default(),
            contacts: ContactStats::default(),
            phases: PhaseStats::default(),
            errors: ErrorStats::default(),
        }
    }

    pub fn with_session(session_id: Uuid) -> Self {
        Self {
            session_id,
            ..Self::new()
        }
    }

    /// Mark the sync operation as started
    pub fn start(&mut self) {
        self.start_time = SystemTime::now();
    }

    /// Mark the sync operation as completed
    pub fn complete(&mut self) {
        let end_time = SystemTime::now();
        self.end_time = Some(end_time);
        self.duration = end_time
            .duration_since(self.start_time)
            .unwrap_or_default();

        if !self.is_successful() {
            error!(
                session_id = %self.session_id,
                duration_secs = self.duration.as_secs_f64(),
                critical_errors = ?self.errors.critical_errors,
                total_warnings = self.errors.total_warnings,
                "Sync operation failed"
            );
            return;
        }

        info!(
            session_id = %self.session_id,
            duration_secs = self.duration.as_secs_f64(),
            fetched_local = self.contacts.fetched_local,
            fetched_remote = self.contacts.fetched_remote,
            added_to_local = self.contacts.added_to_local,
            added_to_remote = self.contacts.added_to_remote,
            updated_local = self.contacts.updated_local,
            updated_remote = self.contacts.updated_remote,
            merged = self.contacts.merged,
            unchanged = self.contacts.unchanged,
            persisted = self.contacts.persisted,
            total_errors = self.errors.total_errors,
            total_warnings = self.errors.total_warnings,
            "Sync operation completed"
        );
    }

    /// Record how many contacts a fetch produced
    pub fn record_fetch(&mut self, side: Side, count: usize, duration: Duration) {
        match side {
            Side::Local => self.contacts.fetched_local = count,
            Side::Remote => self.contacts.fetched_remote = count,
        }
        self.phases.fetch = self.phases.fetch.max(duration);
    }

    /// Record the outcome counts of a reconciliation pass
    pub fn record_plan(&mut self, summary: &PlanSummary, duration: Duration) {
        self.contacts.added_to_local += summary.adds_to_local;
        self.contacts.added_to_remote += summary.adds_to_remote;
        self.contacts.updated_local += summary.updates_to_local;
        self.contacts.updated_remote += summary.updates_to_remote;
        self.contacts.merged += summary.merges;
        self.contacts.unchanged += summary.unchanged;
        self.phases.reconcile += duration;
    }

    pub fn record_update(&mut self, duration: Duration) {
        self.phases.update += duration;
    }

    pub fn record_persist(&mut self, persisted: usize, pruned: usize, duration: Duration) {
        self.contacts.persisted += persisted;
        self.contacts.pruned += pruned;
        self.phases.persist += duration;
    }

    /// Record an error
    pub fn record_error(
        &mut self,
        error_type: impl Into<String>,
        message: impl Into<String>,
        is_critical: bool,
    ) {
        let error_type = error_type.into();
        let message = message.into();

        if is_critical {
            error!(
                error_type = %error_type,
                message = %message,
                "Critical sync error occurred"
            );
        } else {
            warn!(
                error_type = %error_type,
                message = %message,
                "Recoverable sync error occurred"
            );
        }

        self.errors.total_errors += 1;
        *self.errors.errors_by_type.entry(error_type).or_insert(0) += 1;

        if is_critical {
            self.errors.critical_errors.push(message);
        } else {
            self.errors.recoverable_errors.push(message);
        }
    }

    /// Record warnings raised while the sync ran
    pub fn record_warnings(&mut self, count: usize) {
        self.errors.total_warnings += count;
    }

    /// Number of contacts that changed on either side
    pub fn changed(&self) -> usize {
        let c = &self.contacts;
        c.added_to_local + c.added_to_remote + c.updated_local + c.updated_remote + c.merged
    }

    /// Check if the sync operation was successful
    pub fn is_successful(&self) -> bool {
        self.errors.critical_errors.is_empty()
    }

    /// Get a summary string
    pub fn summary(&self) -> String {
        format!(
            "Sync completed in {:.2}s: {} local / {} remote contacts, {} added ({} local, {} remote), {} updated, {} merged, {} unchanged, {} snapshots saved",
            self.duration.as_secs_f64(),
            self.contacts.fetched_local,
            self.contacts.fetched_remote,
            self.contacts.added_to_local + self.contacts.added_to_remote,
            self.contacts.added_to_local,
            self.contacts.added_to_remote,
            self.contacts.updated_local + self.contacts.updated_remote,
            self.contacts.merged,
            self.contacts.unchanged,
            self.contacts.persisted,
        )
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.contacts.persisted, 0);
        assert_eq!(metrics.errors.total_errors, 0);
        assert!(metrics.is_successful());
    }

    #[test]
    fn test_record_plan() {
        let mut metrics = SyncMetrics::new();
        let summary = PlanSummary {
            total_names: 6,
            adds_to_local: 1,
            adds_to_remote: 2,
            updates_to_local: 0,
            updates_to_remote: 1,
            merges: 1,
            unchanged: 1,
        };

        metrics.record_plan(&summary, Duration::from_millis(5));

        assert_eq!(metrics.contacts.added_to_remote, 2);
        assert_eq!(metrics.contacts.unchanged, 1);
        assert_eq!(metrics.changed(), 5);
        assert!(metrics.summary().contains("3 added"));
    }

    #[test]
    fn test_record_error() {
        let mut metrics = SyncMetrics::new();

        metrics.record_error("Snapshot", "corrupt file", false);
        metrics.record_error("Source", "fetch failed", true);

        assert_eq!(metrics.errors.total_errors, 2);
        assert_eq!(metrics.errors.errors_by_type.get("Source"), Some(&1));
        assert_eq!(metrics.errors.critical_errors.len(), 1);
        assert!(!metrics.is_successful());

        metrics.record_warnings(2);
        metrics.complete();
        assert_eq!(metrics.errors.total_warnings, 2);
        assert!(metrics.end_time.is_some());
    }

    #[test]
    fn test_json_serialization() {
        let mut metrics = SyncMetrics::new();
        metrics.record_fetch(Side::Local, 3, Duration::from_millis(1));
        metrics.complete();

        let json = metrics.to_json().unwrap();
        let deserialized = SyncMetrics::from_json(&json).unwrap();

        assert_eq!(metrics.session_id, deserialized.session_id);
        assert_eq!(deserialized.contacts.fetched_local, 3);
    }
}
