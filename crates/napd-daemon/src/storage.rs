//! Persisted policy storage.
//!
//! Synced policies live in one directory, one JSON document per file; only
//! files ending in `.policy` are considered. A remote sync replaces the
//! whole directory content. The default and self policies are well-known
//! files outside that directory and are only ever read.
//!
//! The directory's modification time doubles as the freshness marker for
//! the staleness check: replacing the content updates it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use napd_core::config::StorageConfig;
use napd_core::policy::{PolicyDocument, PolicyError};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Suffix of files considered policy documents.
const POLICY_SUFFIX: &str = ".policy";

/// Storage-level failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem access failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A policy file does not hold a valid document.
    #[error("failed to load policy file {path}: {source}")]
    Document {
        /// Path of the offending file.
        path: PathBuf,
        /// Validation failure.
        source: PolicyError,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Handle to the on-disk policy layout.
#[derive(Debug, Clone)]
pub struct PolicyStorage {
    policy_dir: PathBuf,
    default_path: PathBuf,
    self_path: PathBuf,
}

impl PolicyStorage {
    /// Builds the storage handle from configuration.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            policy_dir: config.policy_dir(),
            default_path: config.default_policy_path(),
            self_path: config.self_policy_path(),
        }
    }

    /// Builds a storage handle from explicit paths.
    #[must_use]
    pub fn from_paths(policy_dir: PathBuf, default_path: PathBuf, self_path: PathBuf) -> Self {
        Self {
            policy_dir,
            default_path,
            self_path,
        }
    }

    /// The synced policy directory.
    #[must_use]
    pub fn policy_dir(&self) -> &Path {
        &self.policy_dir
    }

    /// Creates the policy directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the directory cannot be created.
    pub fn ensure_policy_dir(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.policy_dir).map_err(|e| StorageError::io(&self.policy_dir, e))
    }

    /// Loads the default policy file. Missing or malformed is fatal at
    /// startup: the daemon refuses to run without a fallback policy.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] or [`StorageError::Document`].
    pub fn load_default(&self) -> Result<PolicyDocument, StorageError> {
        load_policy_file(&self.default_path)
    }

    /// Loads the daemon's own policy file; same failure contract as
    /// [`load_default`](Self::load_default).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] or [`StorageError::Document`].
    pub fn load_self(&self) -> Result<PolicyDocument, StorageError> {
        load_policy_file(&self.self_path)
    }

    /// Reads every `*.policy` file in the policy directory as raw JSON.
    ///
    /// Validation of the documents themselves (the `"Id"` field) happens in
    /// the store's reload, which rejects the batch as a whole; this only
    /// rejects unreadable files and unparseable JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] or [`StorageError::Document`]; any
    /// failing file fails the whole read.
    pub fn load_documents(&self) -> Result<Vec<Value>, StorageError> {
        debug!(dir = %self.policy_dir.display(), "loading policies from directory");

        let entries =
            std::fs::read_dir(&self.policy_dir).map_err(|e| StorageError::io(&self.policy_dir, e))?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.policy_dir, e))?;
            let path = entry.path();
            if is_policy_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let text = std::fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))?;
            let value: Value =
                serde_json::from_str(&text).map_err(|e| StorageError::Document {
                    path: path.clone(),
                    source: PolicyError::Parse {
                        message: e.to_string(),
                    },
                })?;
            documents.push(value);
        }
        Ok(documents)
    }

    /// Replaces every persisted policy document with the given set.
    ///
    /// All existing `*.policy` files are removed, then the documents are
    /// written as `<n>.policy` in order. Writes go through a temporary file
    /// and rename so a crash never leaves a half-written policy file behind.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on any filesystem failure.
    pub fn replace_all(&self, documents: &[Value]) -> Result<(), StorageError> {
        self.ensure_policy_dir()?;
        self.remove_all()?;

        for (index, document) in documents.iter().enumerate() {
            let path = self.policy_dir.join(format!("{index}{POLICY_SUFFIX}"));
            let text = document.to_string();
            write_atomically(&path, &text)?;
        }
        Ok(())
    }

    /// Age of the policy directory since its last modification.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the directory cannot be inspected.
    pub fn age(&self) -> Result<Duration, StorageError> {
        let metadata = std::fs::metadata(&self.policy_dir)
            .map_err(|e| StorageError::io(&self.policy_dir, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| StorageError::io(&self.policy_dir, e))?;
        // A directory touched "in the future" counts as freshly modified.
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    fn remove_all(&self) -> Result<(), StorageError> {
        let entries =
            std::fs::read_dir(&self.policy_dir).map_err(|e| StorageError::io(&self.policy_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.policy_dir, e))?;
            let path = entry.path();
            if is_policy_file(&path) {
                std::fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
            }
        }
        Ok(())
    }
}

fn is_policy_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(POLICY_SUFFIX))
}

fn load_policy_file(path: &Path) -> Result<PolicyDocument, StorageError> {
    let text = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
    PolicyDocument::from_json_str(&text).map_err(|source| StorageError::Document {
        path: path.to_owned(),
        source,
    })
}

fn write_atomically(path: &Path, content: &str) -> Result<(), StorageError> {
    let tmp = path.with_extension("policy.tmp");
    std::fs::write(&tmp, content).map_err(|e| StorageError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}
