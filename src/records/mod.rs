// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Patient record store
//!
//! An in-memory ordered map from record id to patient record, persisted to a
//! single bincode snapshot file. The id of a record equals its insertion
//! position in the text vector index; the ingestion pipeline owns that
//! invariant, this module only stores and reloads the mapping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub type RecordId = u64;

#[derive(Error, Debug)]
pub enum RecordStoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("failed to read record snapshot {path}: {source}")]
    SnapshotRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write record snapshot {path}: {source}")]
    SnapshotWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("record snapshot {path} is not decodable: {reason}")]
    SnapshotDecode { path: PathBuf, reason: String },

    #[error("failed to encode record snapshot: {0}")]
    SnapshotEncode(#[from] bincode::Error),
}

/// One patient intake record plus links to any stored images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub name: String,
    pub age: u32,
    pub email: String,
    pub phone: String,
    pub reason: String,
    pub other_conditions: String,
    pub medications: String,
    /// Fixed-template concatenation of the fields above, used as the
    /// text-embedding input
    pub composed_text: String,
    /// Paths of annotated images attached to this record, in attach order
    pub image_paths: Vec<PathBuf>,
}

impl PatientRecord {
    /// Upgrades a legacy snapshot entry (bare composed text, no structured
    /// fields) to the current shape.
    pub fn from_legacy_text(composed_text: String) -> Self {
        Self {
            name: String::new(),
            age: 0,
            email: String::new(),
            phone: String::new(),
            reason: String::new(),
            other_conditions: String::new(),
            medications: String::new(),
            composed_text,
            image_paths: Vec::new(),
        }
    }
}

/// Record mapping persisted as a full-structure snapshot after every mutation
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: BTreeMap<RecordId, PatientRecord>,
}

impl RecordStore {
    /// Loads the snapshot at `path`, or starts empty if none exists.
    ///
    /// A snapshot written by the previous generation of the system (id to
    /// bare composed-text string) is upgraded to structured records on load.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RecordStoreError> {
        let path = path.into();
        let records = if path.exists() {
            let bytes = fs::read(&path).map_err(|source| RecordStoreError::SnapshotRead {
                path: path.clone(),
                source,
            })?;
            decode_snapshot(&path, &bytes)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, records })
    }

    pub fn get(&self, id: RecordId) -> Option<&PatientRecord> {
        self.records.get(&id)
    }

    /// Inserts or replaces the record, then persists the whole store.
    pub fn put(&mut self, id: RecordId, record: PatientRecord) -> Result<(), RecordStoreError> {
        self.records.insert(id, record);
        self.persist()
    }

    /// Appends an image path to the record's image list, then persists.
    ///
    /// # Errors
    /// `RecordStoreError::NotFound` if no record exists for `id`; nothing is
    /// mutated in that case.
    pub fn append_image(
        &mut self,
        id: RecordId,
        image_path: PathBuf,
    ) -> Result<(), RecordStoreError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(RecordStoreError::NotFound(id))?;
        record.image_paths.push(image_path);
        self.persist()
    }

    /// Serializes the entire mapping to the snapshot file.
    ///
    /// The write goes through a temp file and a rename, so a failure leaves
    /// the previous snapshot on disk unchanged.
    pub fn persist(&self) -> Result<(), RecordStoreError> {
        let bytes = bincode::serialize(&self.records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|source| RecordStoreError::SnapshotWrite {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| RecordStoreError::SnapshotWrite {
            path: self.path.clone(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &PatientRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }
}

fn decode_snapshot(
    path: &Path,
    bytes: &[u8],
) -> Result<BTreeMap<RecordId, PatientRecord>, RecordStoreError> {
    match bincode::deserialize::<BTreeMap<RecordId, PatientRecord>>(bytes) {
        Ok(records) => Ok(records),
        // Legacy shape: id -> bare composed-text string
        Err(_) => match bincode::deserialize::<BTreeMap<RecordId, String>>(bytes) {
            Ok(legacy) => {
                warn!(
                    entries = legacy.len(),
                    "upgrading legacy record snapshot to structured records"
                );
                Ok(legacy
                    .into_iter()
                    .map(|(id, text)| (id, PatientRecord::from_legacy_text(text)))
                    .collect())
            }
            Err(err) => Err(RecordStoreError::SnapshotDecode {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }),
        },
    }
}
