//! In-memory mapping table, optionally mirrored to a JSON file after writes.

use std::path::{Path, PathBuf};

use khovaiton_core::mapping::parse_mapping_document;
use khovaiton_core::models::MappingTable;
use khovaiton_core::{FabricCode, MappingValue};
use tokio::sync::Mutex;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Entries that were new or changed value.
    pub updated: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub is_new: bool,
    pub total: usize,
}

#[derive(Debug)]
pub struct MappingRegistry {
    table: Mutex<MappingTable>,
    file: Option<PathBuf>,
}

impl MappingRegistry {
    #[cfg(test)]
    pub fn in_memory(initial: MappingTable) -> Self {
        Self {
            table: Mutex::new(initial),
            file: None,
        }
    }

    /// Load the table from `file` when it exists; writes go back to it.
    pub async fn open(file: Option<PathBuf>) -> Result<Self, AppError> {
        let table = match &file {
            Some(path) => load_table(path).await?,
            None => MappingTable::new(),
        };
        tracing::info!(
            entries = table.len(),
            persisted = file.is_some(),
            "Mapping registry ready"
        );
        Ok(Self {
            table: Mutex::new(table),
            file,
        })
    }

    pub async fn snapshot(&self) -> MappingTable {
        self.table.lock().await.clone()
    }

    /// Upsert entries, counting only those whose value changed.
    pub async fn update(&self, entries: MappingTable) -> Result<WriteOutcome, AppError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let mut updated = 0;
        for (code, value) in entries {
            if next.get(&code) != Some(&value) {
                next.insert(code, value);
                updated += 1;
            }
        }
        if updated > 0 {
            self.persist(&next).await?;
            *table = next;
        }
        Ok(WriteOutcome {
            updated,
            total: table.len(),
        })
    }

    pub async fn add(&self, code: FabricCode, value: MappingValue) -> Result<AddOutcome, AppError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let is_new = next.insert(code, value).is_none();
        self.persist(&next).await?;
        *table = next;
        Ok(AddOutcome {
            is_new,
            total: table.len(),
        })
    }

    /// Replace the whole table.
    pub async fn replace(&self, entries: MappingTable) -> Result<WriteOutcome, AppError> {
        let mut table = self.table.lock().await;
        self.persist(&entries).await?;
        let updated = entries.len();
        *table = entries;
        Ok(WriteOutcome {
            updated,
            total: table.len(),
        })
    }

    /// Write `table` to the backing file; callers swap it in only on success.
    async fn persist(&self, table: &MappingTable) -> Result<(), AppError> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(table)
            .map_err(|error| AppError::storage(error.to_string()))?;
        write_atomically(path, &raw)
            .await
            .map_err(|error| AppError::storage(format!("{}: {error}", path.display())))?;
        tracing::debug!(entries = table.len(), path = %path.display(), "Persisted mappings");
        Ok(())
    }
}

async fn load_table(path: &Path) -> Result<MappingTable, AppError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(parse_mapping_document(&raw)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(MappingTable::new()),
        Err(error) => Err(AppError::storage(format!("{}: {error}", path.display()))),
    }
}

async fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}
