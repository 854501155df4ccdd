//! Persistent store for provisions.
//!
//! Provisioning hands the application a shared secret that must survive
//! restarts; without it a band can never be found and validated again.  This
//! store keeps them in a TOML file:
//!
//! ```toml
//! [[provisions]]
//! key = "00112233445566778899aabbccddeeff"
//! id = "ffeeddccbbaa99887766554433221100"
//! strong = true
//! ```
//!
//! The file holds secrets.  It is written with the process umask; callers
//! that need tighter permissions should place it in a private directory.

use std::path::{Path, PathBuf};

use ncl_core::domain::keys::ProvisionId;
use ncl_core::Provision;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Error type for provision store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error accessing provision store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse provision store: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize provision store: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    provisions: Vec<Provision>,
}

/// Provisions loaded from (and saved back to) one file.
#[derive(Debug)]
pub struct ProvisionStore {
    path: PathBuf,
    provisions: Vec<Provision>,
}

impl ProvisionStore {
    /// Opens the store at `path`.  A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] for file-system errors other than "not found",
    /// [`StoreError::Parse`] for malformed content.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file: StoreFile = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(path = %path.display(), count = file.provisions.len(), "provision store opened");
        Ok(Self {
            path,
            provisions: file.provisions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Provisions in insertion order, ready to pass to `start_finding`.
    pub fn provisions(&self) -> &[Provision] {
        &self.provisions
    }

    /// Adds `provision`, replacing any stored provision with the same id.
    pub fn add(&mut self, provision: Provision) {
        match self.provisions.iter_mut().find(|p| p.id == provision.id) {
            Some(existing) => *existing = provision,
            None => self.provisions.push(provision),
        }
    }

    /// Removes the provision with `id`.  Returns `true` if one was stored.
    pub fn remove(&mut self, id: &ProvisionId) -> bool {
        let before = self.provisions.len();
        self.provisions.retain(|p| &p.id != id);
        self.provisions.len() != before
    }

    /// Writes the store back to its file, creating parent directories.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] or [`StoreError::Serialize`].
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let file = StoreFile {
            provisions: self.provisions.clone(),
        };
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.path, content).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("ncl-store-{}", Uuid::new_v4()))
            .join("provisions.toml")
    }

    fn provision(id: u8, strong: bool) -> Provision {
        Provision {
            key: [id.wrapping_add(0x40); 16],
            id: [id; 16],
            strong,
        }
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let store = ProvisionStore::open(scratch_path()).unwrap();
        assert!(store.provisions().is_empty());
    }

    #[test]
    fn test_add_replaces_provision_with_same_id() {
        // Arrange
        let mut store = ProvisionStore::open(scratch_path()).unwrap();
        store.add(provision(1, false));

        // Act
        store.add(provision(1, true));

        // Assert
        assert_eq!(store.provisions(), &[provision(1, true)]);
    }

    #[test]
    fn test_remove_reports_whether_present() {
        let mut store = ProvisionStore::open(scratch_path()).unwrap();
        store.add(provision(1, false));
        assert!(store.remove(&[1; 16]));
        assert!(!store.remove(&[1; 16]));
    }

    #[test]
    fn test_saved_provisions_reload_in_order() {
        // Arrange
        let path = scratch_path();
        let mut store = ProvisionStore::open(&path).unwrap();
        store.add(provision(2, true));
        store.add(provision(1, false));

        // Act
        store.save().unwrap();
        let reloaded = ProvisionStore::open(&path).unwrap();

        // Assert
        assert_eq!(reloaded.provisions(), &[provision(2, true), provision(1, false)]);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_corrupt_key_is_parse_error() {
        // Arrange
        let path = scratch_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[provisions]]\nkey = \"zz\"\nid = \"00\"\n").unwrap();

        // Act
        let result = ProvisionStore::open(&path);

        // Assert
        assert!(matches!(result, Err(StoreError::Parse(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
