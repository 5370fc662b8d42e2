//! Three-way reconciliation of two sources against their last-synced snapshots
//!
//! For every full name the live local contact, the live remote contact and the
//! snapshots of both sides are compared. A live contact newer than its
//! snapshot's `last_sync` is dirty. The outcome is written into the pending
//! maps (`added`, `updated`) of the two source states.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::contact::{Contact, ContactMap};
use crate::error::{Result, SyncError};
use crate::merge::ContactMerger;
use crate::progress::ProgressReporter;
use crate::snapshot::{last_sync_contact, SnapshotStore};
use crate::source::SourceState;

/// One of the two sources taking part in a sync
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

/// What happens to the replication labels of a merged contact
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LabelPolicy {
    /// Carry forward the union of both snapshots' labels
    Union,
    /// Start over with no labels
    Cleared,
}

/// Decision for a full name present on both sides
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Classification {
    /// Push the local contact to remote as-is
    UpdateRemote,
    /// Push the remote contact to local as-is
    UpdateLocal,
    /// Combine both and write the result to both sides
    Merge(LabelPolicy),
    /// Nothing to do
    Unchanged,
}

/// Facts about one full name that drive the decision table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairState {
    pub local_dirty: bool,
    pub remote_dirty: bool,
    /// Remote's snapshot already carries local's label
    pub remote_snapshot_has_local: bool,
    /// Local's snapshot already carries remote's label
    pub local_snapshot_has_remote: bool,
    /// Both snapshots carry identical label sets
    pub labels_match: bool,
}

/// Decide what to do with a contact present in both live collections
pub fn classify(state: PairState) -> Classification {
    match (state.local_dirty, state.remote_dirty) {
        (true, false) if state.remote_snapshot_has_local => Classification::UpdateRemote,
        (true, false) => Classification::Merge(LabelPolicy::Union),
        (false, true) if state.local_snapshot_has_remote => Classification::UpdateLocal,
        (false, true) => Classification::Merge(LabelPolicy::Union),
        (true, true) => Classification::Merge(LabelPolicy::Cleared),
        (false, false) if state.labels_match => Classification::Unchanged,
        (false, false) => Classification::Merge(LabelPolicy::Union),
    }
}

/// A single reconciliation outcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReconcileAction {
    /// Queued as an addition to the given side
    Add { full_name: String, to: Side },
    /// Pushed unmodified from the given side
    Update { full_name: String, from: Side },
    /// Merged and written to both sides
    Merge { full_name: String, labels: LabelPolicy },
    /// Left alone
    Unchanged { full_name: String },
}

impl ReconcileAction {
    pub fn full_name(&self) -> &str {
        match self {
            ReconcileAction::Add { full_name, .. }
            | ReconcileAction::Update { full_name, .. }
            | ReconcileAction::Merge { full_name, .. }
            | ReconcileAction::Unchanged { full_name } => full_name,
        }
    }
}

/// Everything reconciliation decided in one pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcilePlan {
    pub actions: Vec<ReconcileAction>,
    pub summary: PlanSummary,
}

/// Counts per outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    pub total_names: usize,
    pub adds_to_local: usize,
    pub adds_to_remote: usize,
    pub updates_to_local: usize,
    pub updates_to_remote: usize,
    pub merges: usize,
    pub unchanged: usize,
}

impl ReconcilePlan {
    fn push(&mut self, action: ReconcileAction) {
        let summary = &mut self.summary;
        summary.total_names += 1;
        match &action {
            ReconcileAction::Add { to: Side::Local, .. } => summary.adds_to_local += 1,
            ReconcileAction::Add { to: Side::Remote, .. } => summary.adds_to_remote += 1,
            ReconcileAction::Update { from: Side::Remote, .. } => summary.updates_to_local += 1,
            ReconcileAction::Update { from: Side::Local, .. } => summary.updates_to_remote += 1,
            ReconcileAction::Merge { .. } => summary.merges += 1,
            ReconcileAction::Unchanged { .. } => summary.unchanged += 1,
        }
        self.actions.push(action);
    }

    /// The action recorded for a full name, if any
    pub fn action_for(&self, full_name: &str) -> Option<&ReconcileAction> {
        self.actions.iter().find(|a| a.full_name() == full_name)
    }

    /// Whether the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.summary.unchanged == self.summary.total_names
    }
}

/// Runs the reconciliation pass over two locked source states
pub struct Reconciler<'a> {
    store: &'a dyn SnapshotStore,
    merger: &'a dyn ContactMerger,
    reporter: &'a ProgressReporter,
    cancel: &'a CancellationToken,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a dyn SnapshotStore,
        merger: &'a dyn ContactMerger,
        reporter: &'a ProgressReporter,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            merger,
            reporter,
            cancel,
        }
    }

    /// Classify every full name of both sources and fill their pending maps.
    ///
    /// Names only in local are queued as additions to remote and vice versa.
    pub async fn reconcile(
        &self,
        local_name: &str,
        local: &mut SourceState,
        remote_name: &str,
        remote: &mut SourceState,
    ) -> Result<ReconcilePlan> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let total = local.contacts.len() + remote.contacts.len();
        let mut phase = self.reporter.phase(local_name, "Syncing", total);
        let mut plan = ReconcilePlan::default();

        let local_names: Vec<String> = local.contacts.keys().cloned().collect();
        for name in local_names {
            phase.advance();

            if !remote.contacts.contains_key(&name) {
                let incoming = local.contacts[&name].clone();
                self.queue_add(&mut remote.added, incoming, Side::Remote);
                plan.push(ReconcileAction::Add {
                    full_name: name,
                    to: Side::Remote,
                });
                continue;
            }

            let action = self
                .reconcile_pair(&name, local_name, local, remote_name, remote)
                .await?;
            plan.push(action);
        }

        phase.set_source(remote_name);
        let remote_names: Vec<String> = remote.contacts.keys().cloned().collect();
        for name in remote_names {
            phase.advance();

            if local.contacts.contains_key(&name) {
                continue;
            }

            let incoming = remote.contacts[&name].clone();
            self.queue_add(&mut local.added, incoming, Side::Local);
            plan.push(ReconcileAction::Add {
                full_name: name,
                to: Side::Local,
            });
        }

        info!(
            local = local_name,
            remote = remote_name,
            adds_to_local = plan.summary.adds_to_local,
            adds_to_remote = plan.summary.adds_to_remote,
            updates_to_local = plan.summary.updates_to_local,
            updates_to_remote = plan.summary.updates_to_remote,
            merges = plan.summary.merges,
            unchanged = plan.summary.unchanged,
            "Reconciliation finished"
        );

        Ok(plan)
    }

    async fn reconcile_pair(
        &self,
        name: &str,
        local_name: &str,
        local: &mut SourceState,
        remote_name: &str,
        remote: &mut SourceState,
    ) -> Result<ReconcileAction> {
        let local_snapshot = last_sync_contact(self.store, local_name, name).await?;
        let remote_snapshot = last_sync_contact(self.store, remote_name, name).await?;

        let local_last_sync = local_snapshot.as_ref().and_then(|c| c.last_sync);
        let remote_last_sync = remote_snapshot.as_ref().and_then(|c| c.last_sync);

        let pair = PairState {
            local_dirty: local.contacts[name].is_dirty_since(local_last_sync),
            remote_dirty: remote.contacts[name].is_dirty_since(remote_last_sync),
            remote_snapshot_has_local: remote_snapshot
                .as_ref()
                .is_some_and(|c| c.is_replicated_to(local_name)),
            local_snapshot_has_remote: local_snapshot
                .as_ref()
                .is_some_and(|c| c.is_replicated_to(remote_name)),
            labels_match: labels_of(local_snapshot.as_ref()) == labels_of(remote_snapshot.as_ref()),
        };

        let classification = classify(pair);
        debug!(
            full_name = name,
            local_dirty = pair.local_dirty,
            remote_dirty = pair.remote_dirty,
            ?classification,
            "Classified contact"
        );

        let action = match classification {
            Classification::UpdateRemote => {
                let pushed = stamp_for_update(local, name, local_name, remote_name)?;
                remote.updated.insert(name.to_string(), pushed);
                ReconcileAction::Update {
                    full_name: name.to_string(),
                    from: Side::Local,
                }
            }
            Classification::UpdateLocal => {
                let pushed = stamp_for_update(remote, name, local_name, remote_name)?;
                local.updated.insert(name.to_string(), pushed);
                ReconcileAction::Update {
                    full_name: name.to_string(),
                    from: Side::Remote,
                }
            }
            Classification::Merge(labels) => {
                let mut merged = self
                    .merger
                    .merge(&local.contacts[name], &remote.contacts[name]);
                merged.full_name = name.to_string();
                merged.clear_labels();
                if labels == LabelPolicy::Union {
                    merged.copy_labels_from(local_snapshot.as_ref());
                    merged.copy_labels_from(remote_snapshot.as_ref());
                }

                remote.updated.insert(name.to_string(), merged.clone());
                local.updated.insert(name.to_string(), merged);
                ReconcileAction::Merge {
                    full_name: name.to_string(),
                    labels,
                }
            }
            Classification::Unchanged => ReconcileAction::Unchanged {
                full_name: name.to_string(),
            },
        };

        Ok(action)
    }

    /// Queue an addition, merging with an addition already queued under the same name
    fn queue_add(&self, added: &mut ContactMap, incoming: Contact, to: Side) {
        let name = incoming.full_name.clone();
        let contact = match added.remove(&name) {
            Some(queued) => {
                debug!(full_name = %name, ?to, "Merging duplicate addition");
                let mut merged = match to {
                    Side::Remote => self.merger.merge(&incoming, &queued),
                    Side::Local => self.merger.merge(&queued, &incoming),
                };
                merged.full_name = name.clone();
                merged
            }
            None => incoming,
        };
        added.insert(name, contact);
    }
}

/// Mark the origin's live contact as replicated to both sides and return the copy to push
fn stamp_for_update(
    origin: &mut SourceState,
    name: &str,
    local_name: &str,
    remote_name: &str,
) -> Result<Contact> {
    let live = origin.contacts.get_mut(name).ok_or_else(|| {
        SyncError::Generic(anyhow::anyhow!("Contact '{}' vanished during reconciliation", name))
    })?;
    live.set_replicated_to(local_name);
    live.set_replicated_to(remote_name);
    Ok(live.clone())
}

fn labels_of(snapshot: Option<&Contact>) -> BTreeSet<String> {
    snapshot
        .map(|c| c.replicated_to.clone())
        .unwrap_or_default()
}
