//! Contact records exchanged between sources

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contacts of one source keyed by full name
pub type ContactMap = BTreeMap<String, Contact>;

/// Order in which name parts are joined into a full name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NameNotation {
    /// "Given Middle Family"
    #[default]
    Human,
    /// "Family, Given Middle"
    Formal,
}

/// E-mail address with a kind label ("work", "home", ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactEmail {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Phone number with a kind label ("mobile", "work", ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactPhone {
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Postal address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContactAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// A contact as held by one source.
///
/// `full_name` is the primary key inside a source and in the snapshot store.
/// `replicated_to` lists the sources this exact snapshot was pushed to
/// without being merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Contact {
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthday: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub emails: Vec<ContactEmail>,
    #[serde(default)]
    pub phones: Vec<ContactPhone>,
    #[serde(default)]
    pub addresses: Vec<ContactAddress>,
    /// Set by the source when the contact's data changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Stamped by the engine when the snapshot was persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replicated_to: BTreeSet<String>,
}

impl Contact {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, address: impl Into<String>) -> Self {
        self.emails.push(ContactEmail {
            address: address.into(),
            kind: None,
        });
        self
    }

    pub fn with_phone(mut self, number: impl Into<String>) -> Self {
        self.phones.push(ContactPhone {
            number: number.into(),
            kind: None,
        });
        self
    }

    pub fn modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }

    pub fn replicated(mut self, source: impl Into<String>) -> Self {
        self.replicated_to.insert(source.into());
        self
    }

    pub fn is_replicated_to(&self, source: &str) -> bool {
        self.replicated_to.contains(source)
    }

    pub fn set_replicated_to(&mut self, source: impl Into<String>) {
        self.replicated_to.insert(source.into());
    }

    pub fn clear_replicated_to(&mut self, source: &str) {
        self.replicated_to.remove(source);
    }

    pub fn clear_labels(&mut self) {
        self.replicated_to.clear();
    }

    /// Add every replication label of `from` to this contact
    pub fn copy_labels_from(&mut self, from: Option<&Contact>) {
        if let Some(from) = from {
            self.replicated_to.extend(from.replicated_to.iter().cloned());
        }
    }

    /// Whether the data changed after the given last sync time.
    ///
    /// A contact without a modification time is never dirty; a contact that
    /// was never synced is dirty as soon as it has one.
    pub fn is_dirty_since(&self, last_sync: Option<DateTime<Utc>>) -> bool {
        match (self.last_modified, last_sync) {
            (Some(modified), Some(synced)) => modified > synced,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn primary_email(&self) -> Option<&str> {
        self.emails.first().map(|e| e.address.as_str())
    }

    pub fn primary_phone(&self) -> Option<&str> {
        self.phones.first().map(|p| p.number.as_str())
    }

    /// Join the name parts in the given notation, if any part is present
    pub fn formatted_name(&self, notation: NameNotation) -> Option<String> {
        let given: Vec<&str> = [self.given_name.as_deref(), self.middle_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        let family = self
            .family_name
            .as_deref()
            .filter(|s| !s.trim().is_empty());

        let name = match (notation, family) {
            (NameNotation::Human, Some(family)) => {
                let mut parts = given;
                parts.push(family);
                parts.join(" ")
            }
            (NameNotation::Formal, Some(family)) if !given.is_empty() => {
                format!("{}, {}", family, given.join(" "))
            }
            (NameNotation::Formal, Some(family)) => family.to_string(),
            (_, None) => given.join(" "),
        };

        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    pub fn summary(&self) -> ContactSummary {
        ContactSummary {
            full_name: self.full_name.clone(),
            email: self.primary_email().map(str::to_string),
            phone: self.primary_phone().map(str::to_string),
        }
    }
}

/// Compact list entry handed back to the caller of a sync
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactSummary {
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl std::fmt::Display for ContactSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name)
    }
}
