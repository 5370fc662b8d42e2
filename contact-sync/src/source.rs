//! Contact sources and the per-source state the engine drives

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::contact::{Contact, ContactMap, NameNotation};
use crate::error::Result;
use crate::progress::ProgressReporter;

/// Login for on-line sources
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a provider gets to see while the engine runs one of its phases
#[derive(Clone)]
pub struct SourceContext {
    pub reporter: ProgressReporter,
    pub cancel: CancellationToken,
    pub notation: NameNotation,
    pub credentials: Option<Credentials>,
}

/// A provider of contacts (address book, phone, on-line account, ...)
#[async_trait]
pub trait ContactSource: Send + Sync {
    /// Stable identity, unique per provider instance (e.g. "Gmail")
    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    /// On-line sources need credentials before a sync may start
    fn needs_authorization(&self) -> bool {
        false
    }

    /// Retrieve every contact the provider currently holds
    async fn fetch(&self, ctx: &SourceContext) -> Result<Vec<Contact>>;

    /// Push the pending maps of `state` back to the provider
    async fn update(&self, ctx: &SourceContext, state: &SourceState) -> Result<()> {
        let _ = (ctx, state);
        Ok(())
    }
}

/// Live contacts of a source plus the reconciliation output for it
#[derive(Debug, Default, Clone)]
pub struct SourceState {
    pub contacts: ContactMap,
    pub added: ContactMap,
    pub updated: ContactMap,
    pub removed: ContactMap,
}

impl SourceState {
    /// Replace the live contacts with a freshly fetched list.
    ///
    /// Full names are the key; a later duplicate replaces the earlier record.
    pub fn load(&mut self, source: &str, contacts: Vec<Contact>) {
        self.contacts.clear();
        for contact in contacts {
            let name = contact.full_name.clone();
            if self.contacts.insert(name.clone(), contact).is_some() {
                warn!(source, full_name = %name, "Duplicate full name in fetched contacts");
            }
        }
    }

    /// Move the pending maps into the live contacts. Removals go last.
    pub fn apply_pending(&mut self) {
        for (name, contact) in &self.added {
            self.contacts.insert(name.clone(), contact.clone());
        }
        for (name, contact) in &self.updated {
            self.contacts.insert(name.clone(), contact.clone());
        }
        for name in self.removed.keys() {
            self.contacts.remove(name);
        }
    }

    pub fn clear_pending(&mut self) {
        self.added.clear();
        self.updated.clear();
        self.removed.clear();
    }

    pub fn has_pending(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }

    pub fn pending_len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Mutable per-source preferences
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub credentials: Option<Credentials>,
    /// Forget the credentials once the session ends
    pub clear_credentials: bool,
    pub notation: NameNotation,
}

/// A provider together with the state and gate the engine keeps for it.
///
/// The state mutex is the source's only gate: fetch, reconciliation, update
/// and persist each hold it for the duration of their work on this source.
pub struct SourceHandle {
    provider: Box<dyn ContactSource>,
    state: Mutex<SourceState>,
    settings: parking_lot::Mutex<SourceSettings>,
}

impl SourceHandle {
    pub fn new(provider: impl ContactSource + 'static) -> Arc<Self> {
        Arc::new(Self {
            provider: Box::new(provider),
            state: Mutex::new(SourceState::default()),
            settings: parking_lot::Mutex::new(SourceSettings::default()),
        })
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn display_name(&self) -> &str {
        self.provider.display_name()
    }

    pub fn needs_authorization(&self) -> bool {
        self.provider.needs_authorization()
    }

    pub fn provider(&self) -> &dyn ContactSource {
        self.provider.as_ref()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.settings.lock().credentials.clone()
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        self.settings.lock().credentials = credentials;
    }

    pub fn clear_credentials(&self) -> bool {
        self.settings.lock().clear_credentials
    }

    pub fn set_clear_credentials(&self, clear: bool) {
        self.settings.lock().clear_credentials = clear;
    }

    pub fn notation(&self) -> NameNotation {
        self.settings.lock().notation
    }

    pub fn set_notation(&self, notation: NameNotation) {
        self.settings.lock().notation = notation;
    }

    /// Drop remembered credentials if the user asked not to keep them
    pub fn forget_credentials_if_requested(&self) {
        let mut settings = self.settings.lock();
        if settings.clear_credentials {
            settings.credentials = None;
        }
    }

    /// Wait for the source gate
    pub async fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().await
    }

    /// Take the source gate if nobody holds it
    pub fn try_state(&self) -> Option<MutexGuard<'_, SourceState>> {
        self.state.try_lock().ok()
    }

    /// Whether both handles denote the same provider instance
    pub fn same_as(&self, other: &SourceHandle) -> bool {
        std::ptr::eq(self, other) || self.name() == other.name()
    }

    pub(crate) fn context(&self, reporter: &ProgressReporter, cancel: &CancellationToken) -> SourceContext {
        let settings = self.settings.lock();
        SourceContext {
            reporter: reporter.clone(),
            cancel: cancel.clone(),
            notation: settings.notation,
            credentials: settings.credentials.clone(),
        }
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("name", &self.name())
            .field("display_name", &self.display_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_keys_by_full_name() {
        let mut state = SourceState::default();
        state.load(
            "local",
            vec![
                Contact::new("Alice").with_email("old@example.com"),
                Contact::new("Bob"),
                Contact::new("Alice").with_email("new@example.com"),
            ],
        );

        assert_eq!(state.contacts.len(), 2);
        assert_eq!(
            state.contacts["Alice"].primary_email(),
            Some("new@example.com")
        );
    }

    #[test]
    fn test_apply_pending_removes_last() {
        let mut state = SourceState::default();
        state.load("local", vec![Contact::new("Alice"), Contact::new("Bob")]);

        state.added.insert("Carol".into(), Contact::new("Carol"));
        state
            .updated
            .insert("Alice".into(), Contact::new("Alice").with_phone("1"));
        state.removed.insert("Bob".into(), Contact::new("Bob"));
        state.added.insert("Dave".into(), Contact::new("Dave"));
        state.removed.insert("Dave".into(), Contact::new("Dave"));

        assert_eq!(state.pending_len(), 5);
        state.apply_pending();

        let names: Vec<&str> = state.contacts.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Alice", "Carol"]);
        assert_eq!(state.contacts["Alice"].primary_phone(), Some("1"));

        state.clear_pending();
        assert!(!state.has_pending());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials::new("user", "secret");
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("secret"));
    }
}
