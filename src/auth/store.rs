//! Durable credential state.
//!
//! Stores are keyed by [`CredentialScope`] so incoming and outgoing
//! credentials of a layer never overwrite each other. The file store keeps
//! every scope in one JSON object and rewrites it atomically.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{Credential, CredentialScope};
use crate::Result;

/// Persisted credential state. Only [`super::AuthCache`] writes to it.
pub trait CredentialStore: Send + Sync {
    fn load(&self, scope: &CredentialScope) -> Result<Option<Credential>>;

    fn save(&self, scope: &CredentialScope, credential: &Credential) -> Result<()>;
}

/// Process-local store, for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<CredentialScope, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a credential, as if a previous run had saved it.
    pub fn with(self, scope: CredentialScope, credential: Credential) -> Self {
        self.entries.lock().insert(scope, credential);
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, scope: &CredentialScope) -> Result<Option<Credential>> {
        Ok(self.entries.lock().get(scope).cloned())
    }

    fn save(&self, scope: &CredentialScope, credential: &Credential) -> Result<()> {
        self.entries.lock().insert(scope.clone(), credential.clone());
        Ok(())
    }
}

/// JSON file store, so later invocations reuse a still-valid token.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, Credential>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    // Only a cache: start over and let the next save replace it.
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Ignoring unreadable credential file"
                    );
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, Credential>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, scope: &CredentialScope) -> Result<Option<Credential>> {
        Ok(self.read_all()?.remove(&scope.key()))
    }

    fn save(&self, scope: &CredentialScope, credential: &Credential) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut entries = self.read_all()?;
        entries.insert(scope.key(), credential.clone());
        self.write_all(&entries)?;
        tracing::debug!(scope = %scope, path = %self.path.display(), "Persisted credential");
        Ok(())
    }
}
