//! Write-ahead log and snapshot files for the derivation store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <dir>/snapshot.json   both tables + id counters (atomic rename on write)
//! <dir>/store.wal       length-prefixed bincode records since the snapshot
//! ```
//!
//! Every mutation is appended (and synced) before it is applied in memory.
//! A torn final record, left by a crash mid-append, is dropped on replay.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use lessico_lexicon::PartOfSpeech;

use crate::{DerivedForm, StoreError, Word};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const WAL_FILE: &str = "store.wal";
pub const SNAPSHOT_VERSION_V1: &str = "lessico_store_v1";

// ============================================================================
// Write-Ahead Log
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    AddWord {
        id: u64,
        lemma: String,
    },
    AddDerivedForm {
        id: u64,
        lemma_id: u64,
        form: String,
        pos: PartOfSpeech,
    },
    RemoveDerivedForm {
        id: u64,
    },
}

pub struct WriteAheadLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl WriteAheadLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to disk.
    pub fn append(&self, entry: &WalEntry) -> Result<(), StoreError> {
        let data = bincode::serialize(entry).map_err(|e| StoreError::Encode(e.to_string()))?;

        let mut file = self.file.lock();
        let len = data.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every complete record from the start of the log.
    pub fn replay(&self) -> Result<Vec<WalEntry>, StoreError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut good_len: u64 = 0;
        loop {
            let mut len_bytes = [0u8; 4];
            match file.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if file.stream_position()? != good_len {
                        file.set_len(good_len)?;
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            let remaining = file.metadata()?.len().saturating_sub(file.stream_position()?);
            if len as u64 > remaining {
                tracing::warn!(
                    path = %self.path.display(),
                    len,
                    remaining,
                    "record length runs past the end of the write-ahead log, dropping it"
                );
                file.set_len(good_len)?;
                break;
            }
            let mut data = vec![0u8; len];
            match file.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(
                        path = %self.path.display(),
                        "dropping torn record at the end of the write-ahead log"
                    );
                    file.set_len(good_len)?;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let entry: WalEntry =
                bincode::deserialize(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            entries.push(entry);
            good_len += 4 + len as u64;
        }

        Ok(entries)
    }

    /// Drop every record (after a checkpoint).
    pub fn truncate(&self) -> Result<(), StoreError> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        Ok(())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// On-disk image of both tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotV1 {
    pub version: String,
    pub written_at: chrono::DateTime<chrono::Utc>,
    pub next_word_id: u64,
    pub next_derived_form_id: u64,
    pub words: Vec<Word>,
    pub derived_forms: Vec<DerivedForm>,
}

impl SnapshotV1 {
    pub fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        let snapshot: SnapshotV1 = serde_json::from_str(&text)?;
        if snapshot.version != SNAPSHOT_VERSION_V1 {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot version {:?}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    /// Write via a temp file in the same directory, then rename over the
    /// previous snapshot.
    pub fn write_atomic(&self, path: &Path) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}
