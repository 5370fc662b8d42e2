//! Contact Sync Engine Library
//!
//! Reconciles the contacts of two sources (address books, phones, on-line
//! accounts) against their last-synced snapshots:
//! - Three-way dirty detection per full name
//! - Update, merge or no-op decisions driven by replication labels
//! - Pluggable merge strategies
//! - Snapshot persistence with a shared sync time
//! - Cooperative cancellation, progress notifications and metrics

pub mod auth;
pub mod contact;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod progress;
pub mod providers;
pub mod reconcile;
pub mod snapshot;
pub mod source;
pub mod sync_engine;

// Re-export main types and functions
pub use auth::{check_credentials, CredentialPrompt, LogonResult, StaticPrompt};
pub use contact::{Contact, ContactMap, ContactSummary, NameNotation};
pub use error::{Result, SyncError};
pub use merge::{ContactMerger, MergeStrategy};
pub use metrics::SyncMetrics;
pub use progress::{ProgressChannel, ProgressReporter, SyncEvent};
pub use providers::{FolderSource, MemorySource};
pub use reconcile::{classify, Classification, PlanSummary, ReconcileAction, ReconcilePlan, Reconciler, Side};
pub use snapshot::{FsSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use source::{ContactSource, Credentials, SourceContext, SourceHandle, SourceState};
pub use sync_engine::{SyncEngine, SyncOptions, SyncOutcome, SyncReport};

use std::sync::Arc;

/// Run one sync between two sources with a fresh engine
pub async fn sync_sources(
    local: &Arc<SourceHandle>,
    remote: &Arc<SourceHandle>,
    options: SyncOptions,
    store: Arc<dyn SnapshotStore>,
) -> Result<SyncReport> {
    let engine = SyncEngine::new(options, store);
    engine.sync(local, remote).await
}

#[cfg(test)]
mod law_property_tests;
