//! Contact source backed by a directory of JSON files

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::contact::Contact;
use crate::error::{Result, SyncError};
use crate::snapshot::file_stem;
use crate::source::{ContactSource, SourceContext, SourceState};

const CONTACT_EXTENSION: &str = "json";

/// One `*.json` file per contact.
///
/// The file's modification time is the contact's `last_modified`, so editing
/// a file by hand marks the contact dirty for the next sync.
pub struct FolderSource {
    name: String,
    display_name: Option<String>,
    root: PathBuf,
    recursive: bool,
    /// Full name to the file it was read from during the last fetch
    files: Mutex<HashMap<String, PathBuf>>,
}

impl FolderSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            root: root.into(),
            recursive: false,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn contact_files(&self) -> Result<Vec<PathBuf>> {
        let mut walker = WalkDir::new(&self.root).follow_links(true);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut paths = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| {
                SyncError::source_error(&self.name, format!("Walk error: {}", e))
            })?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(CONTACT_EXTENSION)
            {
                paths.push(path.to_path_buf());
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// File holding `full_name`, or a fresh one that no other contact owns
    async fn path_for(&self, full_name: &str) -> Result<PathBuf> {
        if let Some(path) = self.files.lock().get(full_name) {
            return Ok(path.clone());
        }

        let stem = file_stem(full_name);
        let mut suffix = 1;
        loop {
            let file_name = if suffix == 1 {
                format!("{}.{}", stem, CONTACT_EXTENSION)
            } else {
                format!("{} ({}).{}", stem, suffix, CONTACT_EXTENSION)
            };
            let path = self.root.join(file_name);

            let owned = self.files.lock().values().any(|p| p == &path);
            if !owned && !fs::try_exists(&path).await? {
                return Ok(path);
            }
            debug!(source = %self.name, path = %path.display(), full_name, "Contact file name taken");
            suffix += 1;
        }
    }

    async fn read_contact(&self, path: &Path, ctx: &SourceContext) -> Result<Option<Contact>> {
        let content = fs::read(path).await?;
        let mut contact: Contact = match serde_json::from_slice(&content) {
            Ok(contact) => contact,
            Err(e) => {
                warn!(source = %self.name, path = %path.display(), error = %e, "Skipping unreadable contact file");
                ctx.reporter
                    .warning(format!("Skipped '{}': {}", path.display(), e));
                return Ok(None);
            }
        };

        let modified = fs::metadata(path).await?.modified()?;
        contact.last_modified = Some(DateTime::<Utc>::from(modified));

        if contact.full_name.trim().is_empty() {
            contact.full_name = match contact.formatted_name(ctx.notation) {
                Some(name) => name,
                None => match path.file_stem().and_then(|s| s.to_str()) {
                    Some(stem) => stem.to_string(),
                    None => return Ok(None),
                },
            };
        }

        Ok(Some(contact))
    }

    async fn write_contact(&self, contact: &Contact) -> Result<PathBuf> {
        let path = self.path_for(&contact.full_name).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(contact)?).await?;
        fs::rename(&tmp, &path).await?;

        if let Some(modified) = contact.last_modified {
            let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
            filetime::set_file_mtime(&path, mtime)?;
        }

        Ok(path)
    }
}

#[async_trait]
impl ContactSource for FolderSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    async fn fetch(&self, ctx: &SourceContext) -> Result<Vec<Contact>> {
        if !fs::try_exists(&self.root).await? {
            return Err(SyncError::source_error(
                &self.name,
                format!("Folder '{}' does not exist", self.root.display()),
            ));
        }

        let paths = self.contact_files()?;
        let mut phase = ctx.reporter.phase(&self.name, "Retrieving", paths.len());
        let mut contacts = Vec::with_capacity(paths.len());
        let mut files = HashMap::with_capacity(paths.len());

        for path in paths {
            if ctx.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            phase.advance();

            if let Some(contact) = self.read_contact(&path, ctx).await? {
                files.insert(contact.full_name.clone(), path);
                contacts.push(contact);
            }
        }

        *self.files.lock() = files;
        debug!(source = %self.name, count = contacts.len(), "Fetched folder contacts");
        Ok(contacts)
    }

    async fn update(&self, ctx: &SourceContext, state: &SourceState) -> Result<()> {
        let total = state.pending_len();
        let mut phase = ctx.reporter.phase(&self.name, "Updating", total);

        for (name, contact) in state.added.iter().chain(state.updated.iter()) {
            if ctx.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            phase.advance();

            let path = self.write_contact(contact).await?;
            self.files.lock().insert(name.clone(), path);
        }

        for name in state.removed.keys() {
            phase.advance();
            let Some(path) = self.files.lock().remove(name) else {
                continue;
            };
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!(source = %self.name, written = total, "Updated folder contacts");
        Ok(())
    }
}

/// Modification time of a contact file, `None` if it has none
pub fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|t: SystemTime| DateTime::<Utc>::from(t))
}
