//! In-process contact source

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::contact::{Contact, ContactMap};
use crate::error::{Result, SyncError};
use crate::source::{ContactSource, SourceContext, SourceState};

/// Contacts held in memory.
///
/// Clones share the same contacts, so a caller can keep one clone to inspect
/// or edit the source while the engine owns another.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    display_name: Option<String>,
    needs_authorization: bool,
    fetch_delay: Option<Duration>,
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    contacts: Mutex<ContactMap>,
    fetch_failure: Mutex<Option<String>>,
    fetches: AtomicUsize,
    updates: AtomicUsize,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            needs_authorization: false,
            fetch_delay: None,
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Behave like an on-line source that needs a login
    pub fn requiring_authorization(mut self) -> Self {
        self.needs_authorization = true;
        self
    }

    pub fn with_contacts(self, contacts: impl IntoIterator<Item = Contact>) -> Self {
        {
            let mut map = self.inner.contacts.lock();
            for contact in contacts {
                map.insert(contact.full_name.clone(), contact);
            }
        }
        self
    }

    /// Hold every fetch for `delay` unless the sync is cancelled first
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn insert(&self, contact: Contact) {
        self.inner
            .contacts
            .lock()
            .insert(contact.full_name.clone(), contact);
    }

    pub fn remove(&self, full_name: &str) -> Option<Contact> {
        self.inner.contacts.lock().remove(full_name)
    }

    pub fn get(&self, full_name: &str) -> Option<Contact> {
        self.inner.contacts.lock().get(full_name).cloned()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.inner.contacts.lock().values().cloned().collect()
    }

    /// Make the next fetches fail with `message`; `None` restores normal behavior
    pub fn fail_fetch(&self, message: Option<&str>) {
        *self.inner.fetch_failure.lock() = message.map(str::to_string);
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.inner.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContactSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    fn needs_authorization(&self) -> bool {
        self.needs_authorization
    }

    async fn fetch(&self, ctx: &SourceContext) -> Result<Vec<Contact>> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.fetch_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }

        let failure = self.inner.fetch_failure.lock().clone();
        if let Some(message) = failure {
            return Err(SyncError::source_error(&self.name, message));
        }

        let contacts = self.contacts();
        let mut phase = ctx.reporter.phase(&self.name, "Retrieving", contacts.len());
        for _ in &contacts {
            phase.advance();
        }
        Ok(contacts)
    }

    async fn update(&self, _ctx: &SourceContext, state: &SourceState) -> Result<()> {
        self.inner.updates.fetch_add(1, Ordering::SeqCst);

        let mut contacts = self.inner.contacts.lock();
        for (name, contact) in state.added.iter().chain(state.updated.iter()) {
            contacts.insert(name.clone(), contact.clone());
        }
        for name in state.removed.keys() {
            contacts.remove(name);
        }

        debug!(
            source = %self.name,
            added = state.added.len(),
            updated = state.updated.len(),
            removed = state.removed.len(),
            "Applied pending changes"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::NameNotation;
    use crate::progress::ProgressReporter;
    use tokio_util::sync::CancellationToken;

    fn context() -> SourceContext {
        SourceContext {
            reporter: ProgressReporter::detached(),
            cancel: CancellationToken::new(),
            notation: NameNotation::Human,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn test_clones_share_contacts() {
        let source = MemorySource::new("phone").with_contacts([Contact::new("Alice")]);
        let other = source.clone();
        other.insert(Contact::new("Bob"));

        let fetched = source.fetch(&context()).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(other.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_fetch_failure() {
        let source = MemorySource::new("Gmail");
        source.fail_fetch(Some("network unreachable"));

        let err = source.fetch(&context()).await.unwrap_err();
        assert!(matches!(err, SyncError::Source { .. }));

        source.fail_fetch(None);
        assert!(source.fetch(&context()).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_applies_pending_maps() {
        let source = MemorySource::new("phone")
            .with_contacts([Contact::new("Alice"), Contact::new("Bob")]);

        let mut state = SourceState::default();
        state.added.insert("Carol".into(), Contact::new("Carol"));
        state
            .updated
            .insert("Alice".into(), Contact::new("Alice").with_phone("555"));
        state.removed.insert("Bob".into(), Contact::new("Bob"));

        source.update(&context(), &state).await.unwrap();

        assert_eq!(source.update_count(), 1);
        assert!(source.get("Bob").is_none());
        assert!(source.get("Carol").is_some());
        assert_eq!(
            source.get("Alice").and_then(|c| c.primary_phone().map(str::to_string)),
            Some("555".to_string())
        );
    }

    #[tokio::test]
    async fn test_delayed_fetch_honors_cancellation() {
        let source = MemorySource::new("slow").with_fetch_delay(Duration::from_secs(30));
        let ctx = context();
        ctx.cancel.cancel();

        let err = source.fetch(&ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
