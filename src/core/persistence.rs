//! Durable key-value storage for session history.
//!
//! The store surface is deliberately tiny: JSON values under string keys.
//! The default implementation keeps one JSON document per store file in the
//! platform data directory and rewrites it atomically on every `set`, so a
//! crash mid-write can lose at most the latest mutation and never leaves a
//! half-written file behind.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use directories::ProjectDirs;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

/// Storage failure. Surfaced as a warning; in-memory state stays
/// authoritative for the remainder of the process.
#[derive(Debug)]
pub enum PersistenceError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    DataDir,
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Read { path, source } => {
                write!(f, "Failed to read store at {}: {}", path.display(), source)
            }
            PersistenceError::Write { path, source } => {
                write!(f, "Failed to write store at {}: {}", path.display(), source)
            }
            PersistenceError::Parse { path, source } => {
                write!(f, "Failed to parse store at {}: {}", path.display(), source)
            }
            PersistenceError::DataDir => {
                write!(f, "Failed to determine a data directory for this platform")
            }
        }
    }
}

impl StdError for PersistenceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PersistenceError::Read { source, .. } => Some(source),
            PersistenceError::Write { source, .. } => Some(source),
            PersistenceError::Parse { source, .. } => Some(source),
            PersistenceError::DataDir => None,
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError>;
}

/// File-backed store: one JSON object mapping keys to values.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default store location under the platform data directory.
    pub fn default_path() -> Result<PathBuf, PersistenceError> {
        let proj_dirs =
            ProjectDirs::from("org", "permacommons", "lia-chat").ok_or(PersistenceError::DataDir)?;
        Ok(proj_dirs.data_dir().join("sessions.json"))
    }

    fn read_document(&self) -> Result<HashMap<String, Value>, PersistenceError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| PersistenceError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| PersistenceError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn write_document(&self, document: &HashMap<String, Value>) -> Result<(), PersistenceError> {
        let parent = self.path.parent().filter(|dir| !dir.as_os_str().is_empty());

        let write_err = |source: std::io::Error| PersistenceError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(write_err)?;
        }

        let contents = serde_json::to_string_pretty(document).map_err(|source| {
            PersistenceError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(write_err)?;

        temp_file.write_all(contents.as_bytes()).map_err(write_err)?;
        temp_file.as_file_mut().sync_all().map_err(write_err)?;
        temp_file
            .persist(&self.path)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.read_document()?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        let mut document = self.read_document()?;
        document.insert(key.to_string(), value);
        self.write_document(&document)
    }
}

/// Volatile store for tests and ephemeral runs; nothing survives the
/// process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}
