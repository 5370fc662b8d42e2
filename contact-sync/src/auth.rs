//! Credential gating for on-line sources

use tracing::{debug, info};

use crate::contact::NameNotation;
use crate::error::{Result, SyncError};
use crate::source::{Credentials, SourceHandle};

/// What the logon prompt hands back when the user confirms it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonResult {
    pub credentials: Credentials,
    /// Keep the credentials after the session ends
    pub remember: bool,
    /// Use "Given Family" ordering for this source
    pub human_notation: bool,
}

/// Asks the user for a login. `None` means the prompt was dismissed.
pub trait CredentialPrompt: Send + Sync {
    fn request(&self, display_name: &str) -> Option<LogonResult>;
}

/// A prompt that always answers with the same result
#[derive(Debug, Clone)]
pub struct StaticPrompt(pub Option<LogonResult>);

impl CredentialPrompt for StaticPrompt {
    fn request(&self, _display_name: &str) -> Option<LogonResult> {
        self.0.clone()
    }
}

/// Make sure `source` can be used for a sync.
///
/// Sources that need no authorization, or already hold credentials, pass
/// without asking. Otherwise the prompt is consulted and its answer is stored
/// on the source. Fails with [`SyncError::Credentials`] when no credentials
/// could be obtained.
pub fn check_credentials(source: &SourceHandle, prompt: Option<&dyn CredentialPrompt>) -> Result<()> {
    if !source.needs_authorization() || source.credentials().is_some() {
        return Ok(());
    }

    let Some(prompt) = prompt else {
        debug!(source = source.name(), "No credential prompt configured");
        return Err(SyncError::Credentials(source.display_name().to_string()));
    };

    let Some(result) = prompt.request(source.display_name()) else {
        info!(source = source.name(), "Logon declined");
        return Err(SyncError::Credentials(source.display_name().to_string()));
    };

    source.set_clear_credentials(!result.remember);
    source.set_credentials(Some(result.credentials));
    source.set_notation(if result.human_notation {
        NameNotation::Human
    } else {
        NameNotation::Formal
    });

    debug!(source = source.name(), remember = result.remember, "Credentials accepted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemorySource;

    fn logon(remember: bool, human_notation: bool) -> LogonResult {
        LogonResult {
            credentials: Credentials::new("user@example.com", "hunter2"),
            remember,
            human_notation,
        }
    }

    #[test]
    fn test_source_without_authorization_passes() {
        let source = SourceHandle::new(MemorySource::new("Folder"));
        assert!(check_credentials(&source, None).is_ok());
        assert!(source.credentials().is_none());
    }

    #[test]
    fn test_missing_prompt_fails() {
        let source = SourceHandle::new(
            MemorySource::new("Gmail")
                .with_display_name("Google Mail")
                .requiring_authorization(),
        );
        let err = check_credentials(&source, None).unwrap_err();
        assert!(matches!(err, SyncError::Credentials(ref name) if name == "Google Mail"));
    }

    #[test]
    fn test_declined_prompt_fails() {
        let source = SourceHandle::new(MemorySource::new("Gmail").requiring_authorization());
        let prompt = StaticPrompt(None);
        assert!(matches!(
            check_credentials(&source, Some(&prompt)),
            Err(SyncError::Credentials(_))
        ));
        assert!(source.credentials().is_none());
    }

    #[test]
    fn test_accepted_prompt_stores_settings() {
        let source = SourceHandle::new(MemorySource::new("Gmail").requiring_authorization());
        let prompt = StaticPrompt(Some(logon(false, false)));

        assert!(check_credentials(&source, Some(&prompt)).is_ok());
        assert_eq!(
            source.credentials().map(|c| c.login),
            Some("user@example.com".to_string())
        );
        assert!(source.clear_credentials());
        assert_eq!(source.notation(), NameNotation::Formal);

        source.forget_credentials_if_requested();
        assert!(source.credentials().is_none());
    }

    #[test]
    fn test_existing_credentials_skip_prompt() {
        let source = SourceHandle::new(MemorySource::new("Gmail").requiring_authorization());
        source.set_credentials(Some(Credentials::new("kept", "secret")));

        let prompt = StaticPrompt(Some(logon(true, true)));
        assert!(check_credentials(&source, Some(&prompt)).is_ok());
        assert_eq!(source.credentials().map(|c| c.login), Some("kept".to_string()));
        assert!(!source.clear_credentials());
    }
}
