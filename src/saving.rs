use std::fs::{self, File};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::{RecordId, Snapshot, StoredDocument, Timestamp};
use crate::store::{MemoryStore, RecordStore, Subscription};

/// One record as written to the snapshot file: the document is kept in its
/// JSON shape so every schema version reads back through the same path.
#[derive(Serialize, Deserialize)]
struct SavedRecord {
    id: RecordId,
    last_updated: Timestamp,
    document: String,
}

/// Write every snapshot to a gzip-compressed bincode file.
///
/// The file is written next to `path` first and renamed into place, so a
/// crash never leaves a truncated snapshot behind.
pub fn save_snapshots<'a>(
    snapshots: impl IntoIterator<Item = &'a Snapshot>,
    path: &Path,
) -> Result<(), StoreError> {
    let saved: Vec<SavedRecord> = snapshots
        .into_iter()
        .map(|snapshot| SavedRecord {
            id: snapshot.id.clone(),
            last_updated: snapshot.last_updated,
            document: snapshot.document.to_json(snapshot.last_updated).to_string(),
        })
        .collect();

    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut writer = std::io::BufWriter::new(encoder);

        serialize_into(&mut writer, &saved).map_err(|e| StoreError::Encoding(e.to_string()))?;

        let encoder = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        encoder.finish()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_snapshots(path: &Path) -> Result<Vec<Snapshot>, StoreError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut reader = std::io::BufReader::new(decoder);

    let saved: Vec<SavedRecord> =
        deserialize_from(&mut reader).map_err(|e| StoreError::Encoding(e.to_string()))?;
    saved
        .into_iter()
        .map(|record| {
            let value: serde_json::Value = serde_json::from_str(&record.document)
                .map_err(|e| StoreError::Encoding(format!("{}: {e}", record.id)))?;
            let document = StoredDocument::from_json(&value)
                .map_err(|e| StoreError::Encoding(format!("{}: {e}", record.id)))?;
            Ok(Snapshot {
                id: record.id,
                last_updated: record.last_updated,
                document,
            })
        })
        .collect()
}

/// A [`MemoryStore`] whose contents survive restarts.
///
/// Every write or delete rewrites the snapshot file before it is committed,
/// so subscribers never see a version that is not on disk.
pub struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
}

impl FileStore {
    pub fn open(collection: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshots = if path.exists() {
            load_snapshots(&path)?
        } else {
            Vec::new()
        };
        info!("loaded {} karte records from {}", snapshots.len(), path.display());

        Ok(FileStore {
            memory: MemoryStore::with_snapshots(collection, snapshots),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for FileStore {
    fn collection(&self) -> &str {
        self.memory.collection()
    }

    async fn get(&self, id: &RecordId) -> Result<Snapshot, StoreError> {
        self.memory.get(id).await
    }

    async fn put(&self, id: &RecordId, document: StoredDocument) -> Result<Timestamp, StoreError> {
        self.memory
            .put_with(id, document, |records| save_snapshots(records.values(), &self.path))
    }

    async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
        self.memory
            .delete_with(id, |records| save_snapshots(records.values(), &self.path))
    }

    async fn list(&self, limit: usize) -> Result<Vec<Snapshot>, StoreError> {
        self.memory.list(limit).await
    }

    fn subscribe(&self, id: &RecordId) -> Result<Subscription, StoreError> {
        self.memory.subscribe(id)
    }
}
