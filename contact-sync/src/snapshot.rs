//! Last-synced snapshots, one record per (source, full name)
//!
//! A snapshot is the contact as it was when the last sync completed. It is
//! the only durable record of prior sync state and is what tells a clean
//! contact from a dirty one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, trace, warn};

use crate::contact::Contact;
use crate::error::{Result, SyncError};

const SNAPSHOT_EXTENSION: &str = "contact.json";

/// Longest file stem written for a key, well under the usual 255 byte limit
const MAX_FILE_STEM: usize = 150;

/// Separates a truncated stem from its digest. Never produced by [`escape_key`].
const HASHED_STEM_MARKER: char = '~';

/// Key-value store of last-synced contacts
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn exists(&self, source: &str, full_name: &str) -> Result<bool>;

    async fn load(&self, source: &str, full_name: &str) -> Result<Option<Contact>>;

    /// Store `contact` as the new snapshot for its full name, replacing any prior one
    async fn save(&self, source: &str, contact: &Contact) -> Result<()>;

    async fn remove(&self, source: &str, full_name: &str) -> Result<()>;

    /// Full names that currently have a snapshot
    async fn keys(&self, source: &str) -> Result<Vec<String>>;
}

/// Snapshot of `full_name` as of the last completed sync
pub async fn last_sync_contact(
    store: &dyn SnapshotStore,
    source: &str,
    full_name: &str,
) -> Result<Option<Contact>> {
    store.load(source, full_name).await
}

/// When `full_name` was last synced, `None` if it never was
pub async fn last_sync_time(
    store: &dyn SnapshotStore,
    source: &str,
    full_name: &str,
) -> Result<Option<DateTime<Utc>>> {
    Ok(store
        .load(source, full_name)
        .await?
        .and_then(|contact| contact.last_sync))
}

/// Snapshots kept as JSON files, one directory per source
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.root.join(escape_key(source))
    }

    pub fn snapshot_path(&self, source: &str, full_name: &str) -> PathBuf {
        self.source_dir(source)
            .join(format!("{}.{}", file_stem(full_name), SNAPSHOT_EXTENSION))
    }

    /// Full name stored inside a snapshot whose file stem was hashed
    async fn stored_name(&self, source: &str, path: &Path) -> Option<String> {
        let content = fs::read(path).await.ok()?;
        match serde_json::from_slice::<Contact>(&content) {
            Ok(contact) => Some(contact.full_name),
            Err(e) => {
                warn!(source, path = %path.display(), error = %e, "Skipping unreadable snapshot");
                None
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn exists(&self, source: &str, full_name: &str) -> Result<bool> {
        Ok(fs::try_exists(self.snapshot_path(source, full_name)).await?)
    }

    async fn load(&self, source: &str, full_name: &str) -> Result<Option<Contact>> {
        let path = self.snapshot_path(source, full_name);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::snapshot_error(
                    source,
                    &path,
                    format!("Failed to read snapshot: {}", e),
                ))
            }
        };

        let contact = serde_json::from_slice(&content).map_err(|e| {
            SyncError::snapshot_error(source, &path, format!("Corrupt snapshot: {}", e))
        })?;
        trace!(source, full_name, "Loaded snapshot");
        Ok(Some(contact))
    }

    async fn save(&self, source: &str, contact: &Contact) -> Result<()> {
        let dir = self.source_dir(source);
        fs::create_dir_all(&dir).await.map_err(|e| {
            SyncError::snapshot_error(source, &dir, format!("Failed to create snapshot directory: {}", e))
        })?;

        let path = self.snapshot_path(source, &contact.full_name);
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(contact)?;

        // Rename over the old file so readers never see half a snapshot
        fs::write(&tmp, &content).await.map_err(|e| {
            SyncError::snapshot_error(source, &tmp, format!("Failed to write snapshot: {}", e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            SyncError::snapshot_error(source, &path, format!("Failed to replace snapshot: {}", e))
        })?;

        debug!(source, full_name = %contact.full_name, "Saved snapshot");
        Ok(())
    }

    async fn remove(&self, source: &str, full_name: &str) -> Result<()> {
        let path = self.snapshot_path(source, full_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::snapshot_error(
                source,
                &path,
                format!("Failed to remove snapshot: {}", e),
            )),
        }
    }

    async fn keys(&self, source: &str) -> Result<Vec<String>> {
        let dir = self.source_dir(source);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", SNAPSHOT_EXTENSION);
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            let key = if stem.contains(HASHED_STEM_MARKER) {
                self.stored_name(source, &entry.path()).await
            } else {
                unescape_key(stem)
            };
            if let Some(key) = key {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// In-process snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    sources: RwLock<HashMap<String, BTreeMap<String, Contact>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of snapshots across all sources
    pub fn len(&self) -> usize {
        self.sources.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn exists(&self, source: &str, full_name: &str) -> Result<bool> {
        Ok(self
            .sources
            .read()
            .get(source)
            .is_some_and(|snapshots| snapshots.contains_key(full_name)))
    }

    async fn load(&self, source: &str, full_name: &str) -> Result<Option<Contact>> {
        Ok(self
            .sources
            .read()
            .get(source)
            .and_then(|snapshots| snapshots.get(full_name).cloned()))
    }

    async fn save(&self, source: &str, contact: &Contact) -> Result<()> {
        self.sources
            .write()
            .entry(source.to_string())
            .or_default()
            .insert(contact.full_name.clone(), contact.clone());
        Ok(())
    }

    async fn remove(&self, source: &str, full_name: &str) -> Result<()> {
        if let Some(snapshots) = self.sources.write().get_mut(source) {
            snapshots.remove(full_name);
        }
        Ok(())
    }

    async fn keys(&self, source: &str) -> Result<Vec<String>> {
        Ok(self
            .sources
            .read()
            .get(source)
            .map(|snapshots| snapshots.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Turn a key into a file-name-safe string. Reversible with [`unescape_key`].
pub(crate) fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b' ' | b'-' | b'_' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

/// File stem for a key: the escaped key, or a truncated prefix plus a digest
/// of the whole key when escaping makes it too long for a file name
pub(crate) fn file_stem(key: &str) -> String {
    let escaped = escape_key(key);
    if escaped.len() <= MAX_FILE_STEM {
        return escaped;
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest: String = hasher.finalize()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    let keep = MAX_FILE_STEM - digest.len() - 1;
    format!("{}{}{}", &escaped[..keep], HASHED_STEM_MARKER, digest)
}

pub(crate) fn unescape_key(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("Alice Smith" ; "plain")]
    #[test_case("O'Brien, Pat" ; "punctuation")]
    #[test_case("../etc/passwd" ; "path traversal")]
    #[test_case("Zoë 50%" ; "non ascii and percent")]
    fn test_key_escaping_is_reversible(key: &str) {
        let escaped = escape_key(key);
        assert!(!escaped.contains('/'));
        assert!(!escaped.contains('.'));
        assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path());
        let synced = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut alice = Contact::new("Alice/Work").with_email("alice@example.com");
        alice.last_sync = Some(synced);
        store.save("Gmail", &alice).await.unwrap();
        store.save("Gmail", &Contact::new("Bob")).await.unwrap();

        assert!(store.exists("Gmail", "Alice/Work").await.unwrap());
        assert!(!store.exists("Outlook", "Alice/Work").await.unwrap());

        let loaded = store.load("Gmail", "Alice/Work").await.unwrap().unwrap();
        assert_eq!(loaded, alice);
        assert_eq!(
            last_sync_time(&store, "Gmail", "Alice/Work").await.unwrap(),
            Some(synced)
        );
        assert_eq!(last_sync_time(&store, "Gmail", "Bob").await.unwrap(), None);

        assert_eq!(
            store.keys("Gmail").await.unwrap(),
            vec!["Alice/Work".to_string(), "Bob".to_string()]
        );

        store.remove("Gmail", "Bob").await.unwrap();
        store.remove("Gmail", "Bob").await.unwrap();
        assert_eq!(store.keys("Gmail").await.unwrap().len(), 1);
    }

    #[test]
    fn test_long_keys_get_bounded_distinct_stems() {
        let first = format!("{} One", "Ünïcödé ".repeat(40));
        let second = format!("{} Two", "Ünïcödé ".repeat(40));

        let stem = file_stem(&first);
        assert_eq!(stem.len(), MAX_FILE_STEM);
        assert!(stem.contains(HASHED_STEM_MARKER));
        assert_ne!(stem, file_stem(&second));
        assert_eq!(file_stem(&first), stem);
        assert_eq!(file_stem("Alice Smith"), "Alice Smith");
    }

    #[tokio::test]
    async fn test_fs_store_handles_long_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path());
        let long_name = format!("Dr. {} Smith", "Maximilian-".repeat(40));

        store.save("Gmail", &Contact::new(long_name.as_str())).await.unwrap();
        store.save("Gmail", &Contact::new("Bob")).await.unwrap();

        assert!(store.exists("Gmail", &long_name).await.unwrap());
        assert_eq!(
            store.load("Gmail", &long_name).await.unwrap().map(|c| c.full_name),
            Some(long_name.clone())
        );

        let mut expected = vec![long_name.clone(), "Bob".to_string()];
        expected.sort();
        assert_eq!(store.keys("Gmail").await.unwrap(), expected);

        store.remove("Gmail", &long_name).await.unwrap();
        assert_eq!(store.keys("Gmail").await.unwrap(), vec!["Bob".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path());

        assert!(store.keys("Nokia").await.unwrap().is_empty());
        assert!(store.load("Nokia", "Alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_reports_corrupt_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp_dir.path());

        let path = store.snapshot_path("Gmail", "Alice");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let err = store.load("Gmail", "Alice").await.unwrap_err();
        assert!(matches!(err, SyncError::Snapshot { .. }));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        assert!(store.is_empty());

        store.save("local", &Contact::new("Alice")).await.unwrap();
        store.save("remote", &Contact::new("Alice")).await.unwrap();
        assert_eq!(store.len(), 2);

        assert!(store.exists("local", "Alice").await.unwrap());
        assert_eq!(
            last_sync_contact(&store, "local", "Alice")
                .await
                .unwrap()
                .map(|c| c.full_name),
            Some("Alice".to_string())
        );

        store.remove("local", "Alice").await.unwrap();
        assert!(store.keys("local").await.unwrap().is_empty());
    }
}
