//! Main sync engine that orchestrates the synchronization process
//!
//! A sync runs as one spawned task: both sources are fetched concurrently,
//! reconciled against their snapshots, pushed back through the providers and
//! finally applied and persisted with a single shared sync time. The source
//! gates are held for the whole pipeline and released by their guards on every
//! exit path, including cancellation and abort.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::MutexGuard;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{check_credentials, CredentialPrompt};
use crate::contact::ContactSummary;
use crate::error::{Result, SyncError};
use crate::merge::{ContactMerger, MergeStrategy};
use crate::metrics::SyncMetrics;
use crate::progress::ProgressReporter;
use crate::reconcile::{PlanSummary, ReconcilePlan, Reconciler, Side};
use crate::snapshot::{last_sync_contact, SnapshotStore};
use crate::source::{SourceHandle, SourceState};

/// Options for sync operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Strategy used when both sides have to be combined
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// Write snapshots after the apply phase; off means a dry run
    #[serde(default = "default_true")]
    pub persist_snapshots: bool,
    /// Hand the pending maps to the providers before persisting
    #[serde(default = "default_true")]
    pub run_update_phase: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::default(),
            persist_snapshots: true,
            run_update_phase: true,
        }
    }
}

/// How a sync call ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Both sources were reconciled and persisted
    Completed,
    /// A single source was re-fetched
    Refreshed,
    /// Credentials were missing or the sync was cancelled
    Canceled,
}

/// Result of one sync call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub session_id: Uuid,
    pub outcome: SyncOutcome,
    /// Time stamped as `last_sync` on every persisted contact
    pub synced_at: Option<DateTime<Utc>>,
    /// Contacts of the destination source after the sync
    pub contacts: Vec<ContactSummary>,
    pub plan: ReconcilePlan,
    pub metrics: SyncMetrics,
}

impl SyncReport {
    fn canceled(session_id: Uuid) -> Self {
        Self {
            session_id,
            outcome: SyncOutcome::Canceled,
            synced_at: None,
            contacts: Vec::new(),
            plan: ReconcilePlan::default(),
            metrics: SyncMetrics::with_session(session_id),
        }
    }

    pub fn summary(&self) -> &PlanSummary {
        &self.plan.summary
    }

    pub fn is_canceled(&self) -> bool {
        self.outcome == SyncOutcome::Canceled
    }
}

/// The sync currently holding the engine
struct ActiveSync {
    session_id: Uuid,
    local: Arc<SourceHandle>,
    remote: Arc<SourceHandle>,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

/// Frees the active slot when the sync that claimed it goes away
struct ActiveGuard {
    slot: Arc<Mutex<Option<ActiveSync>>>,
    session_id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|a| a.session_id == self.session_id) {
            *slot = None;
        }
    }
}

/// Main sync engine
pub struct SyncEngine {
    options: SyncOptions,
    store: Arc<dyn SnapshotStore>,
    merger: Arc<dyn ContactMerger>,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    reporter: ProgressReporter,
    active: Arc<Mutex<Option<ActiveSync>>>,
    canceled: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Create a new sync engine with options
    pub fn new(options: SyncOptions, store: Arc<dyn SnapshotStore>) -> Self {
        let merger: Arc<dyn ContactMerger> = Arc::new(options.merge_strategy);
        Self {
            options,
            store,
            merger,
            prompt: None,
            reporter: ProgressReporter::detached(),
            active: Arc::new(Mutex::new(None)),
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the merge strategy with a custom merger
    pub fn with_merger(mut self, merger: Arc<dyn ContactMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_credential_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Synchronize `local` with `remote`.
    ///
    /// Passing the same source twice re-fetches that source only.
    pub async fn sync(
        &self,
        local: &Arc<SourceHandle>,
        remote: &Arc<SourceHandle>,
    ) -> Result<SyncReport> {
        self.sync_with_cancel(local, remote, CancellationToken::new())
            .await
    }

    /// Synchronize with a caller-owned cancellation token.
    ///
    /// A cancelled sync is not an error: it returns a report with
    /// [`SyncOutcome::Canceled`]. Contacts persisted before the cancellation
    /// was noticed stay persisted.
    pub async fn sync_with_cancel(
        &self,
        local: &Arc<SourceHandle>,
        remote: &Arc<SourceHandle>,
        cancel: CancellationToken,
    ) -> Result<SyncReport> {
        let session_id = Uuid::new_v4();
        let refresh = local.same_as(remote);
        let guard = self.claim(session_id, local, remote, &cancel)?;
        self.canceled.store(false, Ordering::SeqCst);

        let prompt = self.prompt.as_deref();
        let credentials = check_credentials(local, prompt).and_then(|()| {
            if refresh {
                Ok(())
            } else {
                check_credentials(remote, prompt)
            }
        });
        if let Err(e) = credentials {
            info!(
                local = local.name(),
                remote = remote.name(),
                error = %e,
                "Sync canceled"
            );
            self.canceled.store(true, Ordering::SeqCst);
            return Ok(SyncReport::canceled(session_id));
        }

        let pipeline = Pipeline {
            session_id,
            options: self.options.clone(),
            store: self.store.clone(),
            merger: self.merger.clone(),
            reporter: self.reporter.clone(),
            cancel: cancel.clone(),
            local: local.clone(),
            remote: remote.clone(),
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            pipeline.run(refresh).await
        });

        if let Some(active) = self.active.lock().as_mut() {
            if active.session_id == session_id {
                active.abort = Some(handle.abort_handle());
            }
        }

        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SyncError::Cancelled),
            Err(e) => Err(SyncError::Generic(anyhow::anyhow!("Sync task failed: {}", e))),
        };

        local.forget_credentials_if_requested();
        if !refresh {
            remote.forget_credentials_if_requested();
        }

        match result {
            Ok(report) => Ok(report),
            Err(e) if e.is_cancelled() => {
                warn!(session_id = %session_id, local = local.name(), remote = remote.name(), "Sync canceled");
                self.canceled.store(true, Ordering::SeqCst);
                self.reporter.cancel_sync(
                    local.display_name(),
                    "Synchronization was canceled",
                    None,
                );
                Ok(SyncReport::canceled(session_id))
            }
            Err(e) => Err(e),
        }
    }

    fn claim(
        &self,
        session_id: Uuid,
        local: &Arc<SourceHandle>,
        remote: &Arc<SourceHandle>,
        cancel: &CancellationToken,
    ) -> Result<ActiveGuard> {
        let mut slot = self.active.lock();
        if let Some(active) = slot.as_ref() {
            return Err(SyncError::SyncInProgress {
                local: active.local.name().to_string(),
                remote: active.remote.name().to_string(),
            });
        }

        *slot = Some(ActiveSync {
            session_id,
            local: local.clone(),
            remote: remote.clone(),
            cancel: cancel.clone(),
            abort: None,
        });

        Ok(ActiveGuard {
            slot: self.active.clone(),
            session_id,
        })
    }

    /// Ask the running sync to stop at its next checkpoint
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel.cancel();
        }
    }

    /// Whether the last sync was canceled
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Whether a sync is running or still draining
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Tear down whatever a previous sync left behind.
    ///
    /// Cancels and aborts the running pipeline, clears the pending maps of
    /// its sources where their gates are free, and frees the engine for a new
    /// sync. Never fails.
    pub fn cleanup_resources(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        self.canceled.store(true, Ordering::SeqCst);
        active.cancel.cancel();
        if let Some(abort) = &active.abort {
            abort.abort();
        }

        for source in [&active.local, &active.remote] {
            match source.try_state() {
                Some(mut state) => state.clear_pending(),
                None => debug!(source = source.name(), "Source gate still held, pending maps left to its owner"),
            }
        }

        info!(session_id = %active.session_id, "Released sync resources");
    }
}

/// Everything one spawned sync needs
struct Pipeline {
    session_id: Uuid,
    options: SyncOptions,
    store: Arc<dyn SnapshotStore>,
    merger: Arc<dyn ContactMerger>,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    local: Arc<SourceHandle>,
    remote: Arc<SourceHandle>,
}

/// What a finished pipeline hands back before metrics are attached
struct Finished {
    outcome: SyncOutcome,
    synced_at: Option<DateTime<Utc>>,
    contacts: Vec<ContactSummary>,
    plan: ReconcilePlan,
}

impl Pipeline {
    async fn run(self, refresh: bool) -> Result<SyncReport> {
        let mut metrics = SyncMetrics::with_session(self.session_id);
        metrics.start();
        let warnings_before = self.reporter.warnings();

        let result = if refresh {
            self.refresh(&mut metrics).await
        } else {
            self.reconcile_and_persist(&mut metrics).await
        };
        metrics.record_warnings(self.reporter.warnings().saturating_sub(warnings_before));

        match result {
            Ok(finished) => {
                metrics.complete();
                Ok(SyncReport {
                    session_id: self.session_id,
                    outcome: finished.outcome,
                    synced_at: finished.synced_at,
                    contacts: finished.contacts,
                    plan: finished.plan,
                    metrics,
                })
            }
            Err(e) => {
                if !e.is_cancelled() {
                    metrics.record_error(e.kind(), e.to_string(), true);
                    metrics.complete();
                }
                Err(e)
            }
        }
    }

    async fn reconcile_and_persist(&self, metrics: &mut SyncMetrics) -> Result<Finished> {
        info!(
            session_id = %self.session_id,
            local = self.local.name(),
            remote = self.remote.name(),
            "Starting sync"
        );

        let local = self.local.clone();
        let remote = self.remote.clone();
        let (mut local_state, mut remote_state) = lock_pair(&local, &remote).await;
        self.check_cancel()?;

        // Fetch
        let (local_fetch, remote_fetch) = tokio::try_join!(
            self.fetch_source(&local, &mut local_state),
            self.fetch_source(&remote, &mut remote_state),
        )?;
        metrics.record_fetch(Side::Local, local_fetch.0, local_fetch.1);
        metrics.record_fetch(Side::Remote, remote_fetch.0, remote_fetch.1);
        self.check_cancel()?;

        // Reconcile
        let started = Instant::now();
        let reconciler = Reconciler::new(
            self.store.as_ref(),
            self.merger.as_ref(),
            &self.reporter,
            &self.cancel,
        );
        let plan = reconciler
            .reconcile(local.name(), &mut local_state, remote.name(), &mut remote_state)
            .await?;
        metrics.record_plan(&plan.summary, started.elapsed());

        // Update
        if self.options.run_update_phase {
            self.check_cancel()?;
            let started = Instant::now();
            tokio::try_join!(
                self.update_source(&local, &local_state),
                self.update_source(&remote, &remote_state),
            )?;
            metrics.record_update(started.elapsed());
        }

        // Apply and persist
        let started = Instant::now();
        let now = Utc::now() + chrono::Duration::seconds(1);
        let (local_saved, local_pruned) = self.persist_source(&local, &mut local_state, now).await?;
        let (remote_saved, remote_pruned) = self.persist_source(&remote, &mut remote_state, now).await?;
        local_state.clear_pending();
        remote_state.clear_pending();
        metrics.record_persist(
            local_saved + remote_saved,
            local_pruned + remote_pruned,
            started.elapsed(),
        );

        self.reporter.end_sync(local.display_name(), remote.display_name());
        self.reporter.show_contacts();
        self.reporter.update_items();

        Ok(Finished {
            outcome: SyncOutcome::Completed,
            synced_at: Some(now),
            contacts: remote_state.contacts.values().map(|c| c.summary()).collect(),
            plan,
        })
    }

    /// Re-fetch one source without reconciling it
    async fn refresh(&self, metrics: &mut SyncMetrics) -> Result<Finished> {
        let source = self.local.clone();
        let mut state = source.state().await;
        self.check_cancel()?;

        info!(session_id = %self.session_id, source = source.name(), "Refreshing source");
        let (count, elapsed) = self.fetch_source(&source, &mut state).await?;
        metrics.record_fetch(Side::Local, count, elapsed);

        self.reporter.end_sync(source.display_name(), source.display_name());
        self.reporter.show_contacts();
        self.reporter.update_items();

        Ok(Finished {
            outcome: SyncOutcome::Refreshed,
            synced_at: None,
            contacts: state.contacts.values().map(|c| c.summary()).collect(),
            plan: ReconcilePlan::default(),
        })
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn fetch_source(
        &self,
        source: &SourceHandle,
        state: &mut SourceState,
    ) -> Result<(usize, Duration)> {
        let started = Instant::now();
        let ctx = source.context(&self.reporter, &self.cancel);

        let contacts = source
            .provider()
            .fetch(&ctx)
            .await
            .map_err(|e| self.source_failed(source, "fetch", e))?;

        state.load(source.name(), contacts);
        state.clear_pending();
        debug!(source = source.name(), count = state.contacts.len(), "Fetched contacts");
        Ok((state.contacts.len(), started.elapsed()))
    }

    async fn update_source(&self, source: &SourceHandle, state: &SourceState) -> Result<()> {
        if !state.has_pending() {
            return Ok(());
        }

        let ctx = source.context(&self.reporter, &self.cancel);
        source
            .provider()
            .update(&ctx, state)
            .await
            .map_err(|e| self.source_failed(source, "update", e))
    }

    /// Apply the pending maps, stamp `now` and write every live contact's snapshot.
    ///
    /// Returns the number of snapshots written and pruned.
    async fn persist_source(
        &self,
        source: &SourceHandle,
        state: &mut SourceState,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        self.check_cancel()?;
        let rewritten: HashSet<String> = state
            .added
            .keys()
            .chain(state.updated.keys())
            .cloned()
            .collect();
        state.apply_pending();

        let name = source.name();
        let mut phase = self.reporter.phase(name, "Saving", state.contacts.len());
        let mut saved = 0;

        for (full_name, contact) in state.contacts.iter_mut() {
            self.check_cancel()?;
            phase.advance();

            // Providers may drop replication labels, so a contact this sync
            // did not rewrite keeps the labels of its previous snapshot
            if !rewritten.contains(full_name) {
                let previous = last_sync_contact(self.store.as_ref(), name, full_name).await?;
                contact.copy_labels_from(previous.as_ref());
            }
            contact.last_sync = Some(now);
            if self.options.persist_snapshots {
                self.store.save(name, contact).await?;
                saved += 1;
            }
        }

        let mut pruned = 0;
        if self.options.persist_snapshots {
            for key in self.store.keys(name).await? {
                if !state.contacts.contains_key(&key) {
                    self.store.remove(name, &key).await?;
                    pruned += 1;
                }
            }
        }

        debug!(source = name, saved, pruned, "Persisted snapshots");
        Ok((saved, pruned))
    }

    fn source_failed(&self, source: &SourceHandle, phase: &str, e: SyncError) -> SyncError {
        if e.is_cancelled() {
            return e;
        }

        error!(source = source.name(), phase, error = %e, "Source failed");
        self.reporter
            .cancel_sync(source.display_name(), e.to_string(), None);

        match e {
            SyncError::Source { .. } => e,
            other => SyncError::source_error(source.name(), other.to_string()),
        }
    }
}

/// Take both source gates in a fixed order so two engines never deadlock
async fn lock_pair<'a>(
    local: &'a SourceHandle,
    remote: &'a SourceHandle,
) -> (MutexGuard<'a, SourceState>, MutexGuard<'a, SourceState>) {
    if local.name() <= remote.name() {
        let local_state = local.state().await;
        let remote_state = remote.state().await;
        (local_state, remote_state)
    } else {
        let remote_state = remote.state().await;
        let local_state = local.state().await;
        (local_state, remote_state)
    }
}
