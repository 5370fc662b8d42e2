use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use contact_sync::{
    FolderSource, MergeStrategy, NameNotation, SourceHandle, SyncError, SyncOptions,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default = "default_true")]
    pub persist_snapshots: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub notation: NameNotation,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            merge_strategy: MergeStrategy::default(),
            persist_snapshots: true,
            logging: LoggingConfig::default(),
            sources: vec![
                Self::default_source("phone", "Phone"),
                Self::default_source("laptop", "Laptop"),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
            rotation: LogRotation::default(),
        }
    }
}

impl CliConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CliConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_yaml::to_string(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> contact_sync::Result<()> {
        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(SyncError::Config(format!(
                "Unknown log level: {}",
                self.logging.level
            )));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(SyncError::Config("Source name cannot be empty".to_string()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "Duplicate source name: {}",
                    source.name
                )));
            }
            if !source.path.is_dir() {
                return Err(SyncError::Config(format!(
                    "Source folder does not exist: {} ({})",
                    source.path.display(),
                    source.name
                )));
            }
        }

        Ok(())
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| anyhow::anyhow!("No source named '{}' in configuration", name))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            merge_strategy: self.merge_strategy,
            persist_snapshots: self.persist_snapshots,
            ..SyncOptions::default()
        }
    }

    fn default_source(name: &str, display_name: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            display_name: Some(display_name.to_string()),
            path: PathBuf::from("./contacts").join(name),
            recursive: false,
            notation: NameNotation::Human,
        }
    }
}

impl SourceConfig {
    /// Open the configured folder as an engine-ready source
    pub fn open(&self) -> Arc<SourceHandle> {
        let mut folder = FolderSource::new(&self.name, &self.path).recursive(self.recursive);
        if let Some(display_name) = &self.display_name {
            folder = folder.with_display_name(display_name);
        }

        let handle = SourceHandle::new(folder);
        handle.set_notation(self.notation);
        handle
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }

fn default_snapshot_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("contact-sync")
        .join("snapshots")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("contact-sync")
        .join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.yaml");

        let mut config = CliConfig::default();
        config.merge_strategy = MergeStrategy::UnionFields;
        config.save(&path).await.unwrap();

        let loaded = CliConfig::load(&path).await.unwrap();
        assert_eq!(loaded.merge_strategy, MergeStrategy::UnionFields);
        assert_eq!(loaded.sources.len(), 2);
        assert_eq!(loaded.logging.rotation, LogRotation::Daily);
    }

    #[tokio::test]
    async fn test_minimal_yaml_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "sources:\n  - name: phone\n    path: /tmp/phone\n    notation: formal\n",
        )
        .await
        .unwrap();

        let config = CliConfig::load(&path).await.unwrap();
        assert!(config.persist_snapshots);
        assert_eq!(config.merge_strategy, MergeStrategy::PreferNewer);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.source("phone").unwrap().notation, NameNotation::Formal);
        assert!(config.source("laptop").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sources() {
        let temp_dir = TempDir::new().unwrap();
        let folder = SourceConfig {
            name: "phone".to_string(),
            display_name: None,
            path: temp_dir.path().to_path_buf(),
            recursive: false,
            notation: NameNotation::Human,
        };

        let mut config = CliConfig {
            sources: vec![folder.clone()],
            ..CliConfig::default()
        };
        assert!(config.validate().is_ok());

        config.sources.push(folder.clone());
        assert!(matches!(
            config.validate(),
            Err(SyncError::Config(ref message)) if message.contains("Duplicate")
        ));

        config.sources = vec![SourceConfig {
            path: temp_dir.path().join("missing"),
            ..folder.clone()
        }];
        assert!(config.validate().is_err());

        config.sources = vec![folder];
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_open_applies_notation() {
        let source = SourceConfig {
            name: "phone".to_string(),
            display_name: Some("My Phone".to_string()),
            path: PathBuf::from("/tmp"),
            recursive: true,
            notation: NameNotation::Formal,
        };

        let handle = source.open();
        assert_eq!(handle.name(), "phone");
        assert_eq!(handle.display_name(), "My Phone");
        assert_eq!(handle.notation(), NameNotation::Formal);
    }
}
