//! Persisted bridge identity: encryption key, webhook secret, subscription
//! info and the one-time setup flags.
//!
//! Stored as a single JSON file under the data directory. Writes go through a
//! temp file followed by a rename so a crash mid-write never leaves a
//! corrupted entry behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto;

const ENTRY_FILE: &str = "entry.json";

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("failed to read entry file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to write entry file {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("entry file {0} is corrupted: {1}")]
    Corrupt(PathBuf, serde_json::Error),

    #[error("failed to serialize entry: {0}")]
    Serialize(serde_json::Error),
}

/// Subscription details reported by the cloud service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Subscription {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub directive_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Base64 AES-256 key shared with the cloud service.
    pub encryption_key: String,
    /// Hex secret expected in `X-Webhook-Secret` on inbound webhooks.
    pub webhook_secret: String,
    /// Path segment the webhook is served under.
    pub webhook_id: String,
    #[serde(default)]
    pub subscription: Option<Subscription>,
    /// Set once the webhook URL has been accepted by the cloud API.
    #[serde(default)]
    pub webhook_registered_to_api: bool,
    /// Set once the initial bulk entity sync has succeeded.
    #[serde(default)]
    pub initial_sync_performed: bool,
}

impl Entry {
    fn generate() -> Self {
        Entry {
            encryption_key: crypto::generate_key(),
            webhook_secret: crypto::generate_webhook_secret(),
            webhook_id: crypto::generate_webhook_secret(),
            subscription: None,
            webhook_registered_to_api: false,
            initial_sync_performed: false,
        }
    }
}

/// Owns the entry file and keeps the in-memory copy in sync with disk.
#[derive(Debug)]
pub struct EntryStore {
    path: PathBuf,
    entry: Entry,
}

impl EntryStore {
    /// Load the entry from the data directory, generating and persisting a
    /// fresh one on first run.
    pub fn open(data_dir: &Path) -> Result<Self, EntryError> {
        let path = data_dir.join(ENTRY_FILE);

        match std::fs::read(&path) {
            Ok(raw) => {
                let entry = serde_json::from_slice(&raw)
                    .map_err(|e| EntryError::Corrupt(path.clone(), e))?;
                Ok(EntryStore { path, entry })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut store = EntryStore {
                    path,
                    entry: Entry::generate(),
                };
                store.persist()?;
                Ok(store)
            }
            Err(e) => Err(EntryError::Read(path, e)),
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Mutate the entry and persist the result. The flags only ever move from
    /// false to true here, after the corresponding remote call succeeded.
    pub fn update(&mut self, f: impl FnOnce(&mut Entry)) -> Result<(), EntryError> {
        f(&mut self.entry);
        self.persist()
    }

    fn persist(&mut self) -> Result<(), EntryError> {
        let raw = serde_json::to_vec_pretty(&self.entry).map_err(EntryError::Serialize)?;

        let tmp = self.path.with_extension("json.tmp");
        let write = |tmp: &Path| -> std::io::Result<()> {
            let mut file = std::fs::File::create(tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
            std::fs::rename(tmp, &self.path)
        };
        write(&tmp).map_err(|e| EntryError::Write(self.path.clone(), e))
    }
}
