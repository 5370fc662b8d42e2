//! Merge strategies for contacts that diverged between two sources
//!
//! A merge must always produce a contact that is acceptable as the new state
//! for both sides. Field-level quality is strategy specific; every strategy
//! here is total and deterministic.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::contact::Contact;

/// Produces one combined contact from the local and remote versions
pub trait ContactMerger: Send + Sync {
    fn merge(&self, local: &Contact, remote: &Contact) -> Contact;
}

/// Built-in merge strategies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Always keep the remote record
    PreferRemote,
    /// Always keep the local record
    PreferLocal,
    /// Keep the record with the later modification time; ties keep remote
    #[default]
    PreferNewer,
    /// Newer record wins single-valued fields, lists are unioned
    UnionFields,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::PreferRemote => write!(f, "prefer_remote"),
            MergeStrategy::PreferLocal => write!(f, "prefer_local"),
            MergeStrategy::PreferNewer => write!(f, "prefer_newer"),
            MergeStrategy::UnionFields => write!(f, "union_fields"),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "prefer_remote" | "remote" => Ok(Self::PreferRemote),
            "prefer_local" | "local" => Ok(Self::PreferLocal),
            "prefer_newer" | "newer" => Ok(Self::PreferNewer),
            "union_fields" | "union" => Ok(Self::UnionFields),
            other => Err(format!("Unknown merge strategy: {}", other)),
        }
    }
}

impl ContactMerger for MergeStrategy {
    fn merge(&self, local: &Contact, remote: &Contact) -> Contact {
        match self {
            MergeStrategy::PreferRemote => remote.clone(),
            MergeStrategy::PreferLocal => local.clone(),
            MergeStrategy::PreferNewer => newer(local, remote).clone(),
            MergeStrategy::UnionFields => union_fields(local, remote),
        }
    }
}

/// The later-modified contact; remote on ties or when neither has a time
fn newer<'a>(local: &'a Contact, remote: &'a Contact) -> &'a Contact {
    match local.last_modified.cmp(&remote.last_modified) {
        Ordering::Greater => local,
        _ => remote,
    }
}

fn union_fields(local: &Contact, remote: &Contact) -> Contact {
    let (primary, secondary) = if std::ptr::eq(newer(local, remote), local) {
        (local, remote)
    } else {
        (remote, local)
    };

    let mut merged = primary.clone();

    fill(&mut merged.given_name, &secondary.given_name);
    fill(&mut merged.middle_name, &secondary.middle_name);
    fill(&mut merged.family_name, &secondary.family_name);
    fill(&mut merged.nickname, &secondary.nickname);
    fill(&mut merged.organization, &secondary.organization);
    fill(&mut merged.title, &secondary.title);
    fill(&mut merged.birthday, &secondary.birthday);
    fill(&mut merged.notes, &secondary.notes);

    for email in &secondary.emails {
        if !merged
            .emails
            .iter()
            .any(|e| e.address.eq_ignore_ascii_case(&email.address))
        {
            merged.emails.push(email.clone());
        }
    }
    for phone in &secondary.phones {
        if !merged
            .phones
            .iter()
            .any(|p| normalize_phone(&p.number) == normalize_phone(&phone.number))
        {
            merged.phones.push(phone.clone());
        }
    }
    for address in &secondary.addresses {
        if !merged.addresses.contains(address) {
            merged.addresses.push(address.clone());
        }
    }

    merged.last_modified = primary.last_modified.max(secondary.last_modified);
    merged
}

fn fill(target: &mut Option<String>, fallback: &Option<String>) {
    if target.is_none() {
        target.clone_from(fallback);
    }
}

fn normalize_phone(number: &str) -> String {
    number
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}
