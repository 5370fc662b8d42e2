//! Property tests for merge totality and the reconciliation laws using proptest

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::contact::Contact;
use crate::merge::{ContactMerger, MergeStrategy};
use crate::progress::ProgressReporter;
use crate::reconcile::{classify, Classification, LabelPolicy, PairState, Reconciler};
use crate::snapshot::{MemorySnapshotStore, SnapshotStore};
use crate::source::SourceState;

/// Strategy for generating optional modification times
pub fn modification_time() -> impl Strategy<Value = Option<DateTime<Utc>>> {
    prop::option::of((0i64..1_000_000).prop_map(|secs| {
        Utc.timestamp_opt(1_500_000_000 + secs, 0).unwrap()
    }))
}

/// Strategy for generating contacts sharing one full name
pub fn contact_named(name: &'static str) -> impl Strategy<Value = Contact> {
    (
        modification_time(),
        prop::collection::vec("[a-z]{1,8}@example\\.com", 0..3),
        prop::collection::vec("\\+?[0-9 ]{3,12}", 0..3),
        prop::option::of("[A-Za-z ]{1,20}"),
        prop::collection::btree_set("[a-z]{1,6}", 0..3),
    )
        .prop_map(move |(modified, emails, phones, organization, labels)| {
            let mut contact = Contact::new(name);
            contact.last_modified = modified;
            for email in emails {
                contact = contact.with_email(email);
            }
            for phone in phones {
                contact = contact.with_phone(phone);
            }
            contact.organization = organization;
            contact.replicated_to = labels;
            contact
        })
}

pub fn merge_strategy() -> impl Strategy<Value = MergeStrategy> {
    prop_oneof![
        Just(MergeStrategy::PreferRemote),
        Just(MergeStrategy::PreferLocal),
        Just(MergeStrategy::PreferNewer),
        Just(MergeStrategy::UnionFields),
    ]
}

pub fn pair_state() -> impl Strategy<Value = PairState> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(local_dirty, remote_dirty, remote_snapshot_has_local, local_snapshot_has_remote, labels_match)| {
            PairState {
                local_dirty,
                remote_dirty,
                remote_snapshot_has_local,
                local_snapshot_has_remote,
                labels_match,
            }
        },
    )
}

proptest! {
    #[test]
    fn test_merge_is_total_and_deterministic(
        strategy in merge_strategy(),
        local in contact_named("Alice"),
        remote in contact_named("Alice"),
    ) {
        let first = strategy.merge(&local, &remote);
        let second = strategy.merge(&local, &remote);

        prop_assert_eq!(&first.full_name, "Alice");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_union_fields_keeps_every_email(
        local in contact_named("Alice"),
        remote in contact_named("Alice"),
    ) {
        let merged = MergeStrategy::UnionFields.merge(&local, &remote);

        for email in local.emails.iter().chain(remote.emails.iter()) {
            prop_assert!(merged
                .emails
                .iter()
                .any(|e| e.address.eq_ignore_ascii_case(&email.address)));
        }
        prop_assert_eq!(merged.last_modified, local.last_modified.max(remote.last_modified));
    }

    #[test]
    fn test_classify_laws(state in pair_state()) {
        let classification = classify(state);

        match (state.local_dirty, state.remote_dirty) {
            (true, true) => prop_assert_eq!(classification, Classification::Merge(LabelPolicy::Cleared)),
            (false, false) if state.labels_match => prop_assert_eq!(classification, Classification::Unchanged),
            _ => prop_assert!(classification != Classification::Unchanged),
        }

        if classification == Classification::UpdateRemote {
            prop_assert!(state.local_dirty && state.remote_snapshot_has_local);
        }
        if classification == Classification::UpdateLocal {
            prop_assert!(state.remote_dirty && state.local_snapshot_has_remote);
        }
    }

    #[test]
    fn test_one_sided_names_are_always_queued(
        local_names in prop::collection::btree_set("[A-Z][a-z]{1,6}", 0..6),
        remote_names in prop::collection::btree_set("[A-Z][a-z]{1,6}", 0..6),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let store = MemorySnapshotStore::new();

        let mut local = SourceState::default();
        local.load("local", local_names.iter().map(Contact::new).collect());
        let mut remote = SourceState::default();
        remote.load("remote", remote_names.iter().map(Contact::new).collect());

        let merger = MergeStrategy::PreferNewer;
        let reporter = ProgressReporter::detached();
        let cancel = CancellationToken::new();
        let plan = runtime
            .block_on(
                Reconciler::new(&store, &merger, &reporter, &cancel)
                    .reconcile("local", &mut local, "remote", &mut remote),
            )
            .unwrap();

        for name in local_names.difference(&remote_names) {
            prop_assert!(remote.added.contains_key(name));
        }
        for name in remote_names.difference(&local_names) {
            prop_assert!(local.added.contains_key(name));
        }
        prop_assert_eq!(plan.summary.total_names, local_names.union(&remote_names).count());
        prop_assert!(runtime.block_on(store.keys("local")).unwrap().is_empty());
    }
}
