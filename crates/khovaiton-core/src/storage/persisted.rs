//! Durable local mirror of recorded code-to-image mappings.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::models::{FabricCode, MappingTable, MappingValue};
use crate::{Error, Result};

/// Fixed key the persisted blob lives under.
pub const STORAGE_KEY: &str = "khovaiton_fabric_uploads";

/// String blob storage keyed by name.
pub trait PersistentBackend: Send + Sync + 'static {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform data directory, e.g. `~/.local/share/khovaiton`.
    pub fn default_location() -> Result<Self> {
        let dir = dirs::data_dir().ok_or_else(|| {
            Error::Storage("Could not determine platform data directory".to_string())
        })?;
        Ok(Self::new(dir.join("khovaiton")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl PersistentBackend for FileBackend {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// In-process backend; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentBackend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

impl<B: PersistentBackend> PersistentBackend for Arc<B> {
    fn load(&self, key: &str) -> Result<Option<String>> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        (**self).save(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// On-disk shape of the persisted blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    #[serde(default, alias = "fabricToPublicIdMapping")]
    pub fabric_to_object_id: MappingTable,
    /// Unix ms of the last write.
    #[serde(default)]
    pub timestamp: i64,
    /// Codes written locally and not yet confirmed by the mapping store.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub pending_push: BTreeSet<FabricCode>,
}

/// Local persisted cache: read once at start, written through on every change.
pub struct LocalPersistentCache<B> {
    backend: B,
    key: String,
    record: Mutex<PersistedRecord>,
    clock: Arc<dyn Clock>,
}

impl<B: PersistentBackend> LocalPersistentCache<B> {
    /// Load the blob under [`STORAGE_KEY`]. An unreadable blob is logged and
    /// treated as empty.
    pub fn open(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self::open_with_key(backend, STORAGE_KEY, clock)
    }

    pub fn open_with_key(backend: B, key: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let key = key.into();
        let record = match backend.load(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedRecord>(&raw) {
                Ok(record) => record,
                Err(error) => {
                    warn!(key = %key, %error, "Ignoring unreadable persisted image cache");
                    PersistedRecord::default()
                }
            },
            Ok(None) => PersistedRecord::default(),
            Err(error) => {
                warn!(key = %key, %error, "Failed to load persisted image cache");
                PersistedRecord::default()
            }
        };
        debug!(
            key = %key,
            entries = record.fabric_to_object_id.len(),
            pending = record.pending_push.len(),
            "Loaded persisted image cache"
        );
        Self {
            backend,
            key,
            record: Mutex::new(record),
            clock,
        }
    }

    pub fn get(&self, code: &str) -> Option<MappingValue> {
        self.lock().fabric_to_object_id.get(code).cloned()
    }

    pub fn entries(&self) -> MappingTable {
        self.lock().fabric_to_object_id.clone()
    }

    pub fn pending(&self) -> BTreeSet<FabricCode> {
        self.lock().pending_push.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().fabric_to_object_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a local write (upload or manual override) awaiting push.
    ///
    /// The in-memory mirror is updated even when the backend write fails.
    pub fn record_local(&self, code: &FabricCode, value: MappingValue) -> Result<()> {
        let mut record = self.lock();
        record.fabric_to_object_id.insert(code.clone(), value);
        record.pending_push.insert(code.clone());
        record.timestamp = self.clock.now_millis();
        self.persist(&record)
    }

    /// Merge entries observed in the mapping store. Does not mark them pending.
    ///
    /// `seen` is the local table the merge was planned from. A code whose
    /// local value moved away from `seen`, or that was written locally since,
    /// is skipped. Returns the entries actually applied.
    pub fn merge_remote<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a FabricCode, &'a MappingValue)>,
        seen: &MappingTable,
    ) -> Result<MappingTable> {
        let mut record = self.lock();
        let mut merged = MappingTable::new();
        for (code, value) in entries {
            if record.pending_push.contains(code)
                || record.fabric_to_object_id.get(code) != seen.get(code)
            {
                debug!(fabric_code = %code, "Skipping merge over newer local write");
                continue;
            }
            if record.fabric_to_object_id.get(code) != Some(value) {
                record.fabric_to_object_id.insert(code.clone(), value.clone());
                merged.insert(code.clone(), value.clone());
            }
        }
        if merged.is_empty() {
            return Ok(merged);
        }
        record.timestamp = self.clock.now_millis();
        self.persist(&record)?;
        Ok(merged)
    }

    /// Clear the pending flag for entries the mapping store confirmed.
    ///
    /// Only codes whose local value still equals the confirmed value are
    /// cleared; a newer local write stays pending. Returns how many cleared.
    pub fn mark_pushed<'a>(
        &self,
        confirmed: impl IntoIterator<Item = (&'a FabricCode, &'a MappingValue)>,
    ) -> Result<usize> {
        let mut record = self.lock();
        let mut cleared = 0;
        for (code, value) in confirmed {
            if record.fabric_to_object_id.get(code) == Some(value)
                && record.pending_push.remove(code)
            {
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.persist(&record)?;
        }
        Ok(cleared)
    }

    /// Drop every entry and the stored blob.
    pub fn clear(&self) -> Result<()> {
        let mut record = self.lock();
        *record = PersistedRecord::default();
        self.backend.remove(&self.key)
    }

    fn persist(&self, record: &PersistedRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.backend.save(&self.key, &raw)
    }

    fn lock(&self) -> MutexGuard<'_, PersistedRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B> std::fmt::Debug for LocalPersistentCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPersistentCache")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
