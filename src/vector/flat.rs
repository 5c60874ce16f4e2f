// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Flat exact-L2 vector index
//!
//! Stores fixed-dimension vectors in insertion order in a single flat `f32`
//! buffer and searches by brute-force squared Euclidean distance. A vector's
//! position is its only identifier: there is no deletion and no reordering,
//! so positions stay valid for the lifetime of the index file.
//!
//! Vectors are L2-normalized before insertion and queries are normalized the
//! same way, which makes the L2 ranking equivalent to a cosine ranking.
//!
//! The whole index is rewritten to disk synchronously after every append.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(
        "index {path} stores {stored}-dimensional vectors but the configured \
         embedding dimension is {configured}; the embedding model changed \
         incompatibly since the index was written"
    )]
    DimensionMismatch {
        path: PathBuf,
        stored: usize,
        configured: usize,
    },

    #[error("vector has {got} dimensions, index expects {expected}")]
    BadShape { expected: usize, got: usize },

    #[error("failed to read index {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write index {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("index file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to encode index: {0}")]
    Encode(#[from] bincode::Error),
}

/// On-disk shape: the fixed dimension plus the flat vector buffer
#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    dimension: u64,
    data: Vec<f32>,
}

#[derive(Debug)]
pub struct FlatL2Index {
    path: PathBuf,
    dimension: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    /// Loads the index at `path`, or creates an empty one (persisted
    /// immediately) if the file does not exist.
    ///
    /// # Errors
    /// `IndexError::DimensionMismatch` if the file holds vectors of a
    /// different dimension than `dimension`. This is a configuration error
    /// and callers treat it as fatal at startup.
    pub fn open_or_create(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, IndexError> {
        let path = path.into();
        if !path.exists() {
            let index = Self {
                path,
                dimension,
                data: Vec::new(),
            };
            index.persist()?;
            return Ok(index);
        }

        let bytes = fs::read(&path).map_err(|source| IndexError::Read {
            path: path.clone(),
            source,
        })?;
        let snapshot: IndexSnapshot =
            bincode::deserialize(&bytes).map_err(|err| IndexError::Corrupt {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        let stored = snapshot.dimension as usize;
        if !snapshot.data.is_empty() {
            if stored != dimension {
                return Err(IndexError::DimensionMismatch {
                    path,
                    stored,
                    configured: dimension,
                });
            }
            if snapshot.data.len() % stored != 0 {
                return Err(IndexError::Corrupt {
                    path,
                    reason: format!(
                        "buffer of {} floats is not a multiple of dimension {}",
                        snapshot.data.len(),
                        stored
                    ),
                });
            }
        }

        let index = Self {
            path,
            dimension,
            data: snapshot.data,
        };
        info!(
            path = %index.path.display(),
            vectors = index.len(),
            dimension = index.dimension,
            "vector index loaded"
        );
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Normalizes and appends `vector`, persists the whole index, and
    /// returns the new entry's zero-based position.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::BadShape {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        let mut normalized = vector.to_vec();
        normalize(&mut normalized);
        self.data.extend_from_slice(&normalized);
        self.persist()?;
        Ok(self.len() - 1)
    }

    /// Returns up to `k` positions ordered by ascending squared L2 distance
    /// to the (normalized) query. No relevance threshold is applied.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::BadShape {
                expected: self.dimension,
                got: query.len(),
            });
        }
        let mut normalized = query.to_vec();
        normalize(&mut normalized);

        let mut hits: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, stored)| (position, squared_l2(&normalized, stored)))
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    fn persist(&self) -> Result<(), IndexError> {
        let snapshot = IndexSnapshot {
            dimension: self.dimension as u64,
            data: self.data.clone(),
        };
        let bytes = bincode::serialize(&snapshot)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).map_err(|source| IndexError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| IndexError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// L2-normalizes in place. Zero and non-finite vectors are left as-is.
pub(crate) fn normalize(vector: &mut [f32]) {
    let magnitude: f32 = vector.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return;
    }
    for value in vector.iter_mut() {
        *value /= magnitude;
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let magnitude: f32 = v.iter().map(|&x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0, 0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn add_returns_sequential_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = FlatL2Index::open_or_create(dir.path().join("t.idx"), 2).unwrap();
        assert_eq!(index.add(&[1.0, 0.0]).unwrap(), 0);
        assert_eq!(index.add(&[0.0, 1.0]).unwrap(), 1);
        assert_eq!(index.add(&[1.0, 1.0]).unwrap(), 2);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn self_search_is_top_hit_at_zero_distance() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = FlatL2Index::open_or_create(dir.path().join("t.idx"), 3).unwrap();
        index.add(&[1.0, 0.0, 0.0]).unwrap();
        index.add(&[0.0, 5.0, 0.0]).unwrap();

        // Scaled copy of the second vector: normalization makes it exact
        let hits = index.search(&[0.0, 0.5, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 < 1e-6);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn search_clamps_k_to_population() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = FlatL2Index::open_or_create(dir.path().join("t.idx"), 2).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        let hits = index.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn bad_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = FlatL2Index::open_or_create(dir.path().join("t.idx"), 4).unwrap();
        let err = index.add(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, IndexError::BadShape { expected: 4, got: 2 }));
    }

    #[test]
    fn reopening_with_a_different_dimension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let mut index = FlatL2Index::open_or_create(&path, 4).unwrap();
        index.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        drop(index);

        let err = FlatL2Index::open_or_create(&path, 8).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                stored: 4,
                configured: 8,
                ..
            }
        ));
    }

    #[test]
    fn empty_index_adopts_the_configured_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.idx");
        FlatL2Index::open_or_create(&path, 4).unwrap();
        // No vectors stored yet, so a model change is still allowed
        let index = FlatL2Index::open_or_create(&path, 8).unwrap();
        assert_eq!(index.dimension(), 8);
    }

    #[test]
    fn index_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let mut index = FlatL2Index::open_or_create(&path, 2).unwrap();
        index.add(&[1.0, 0.0]).unwrap();
        index.add(&[0.0, 1.0]).unwrap();
        drop(index);

        let index = FlatL2Index::open_or_create(&path, 2).unwrap();
        assert_eq!(index.len(), 2);
        let hits = index.search(&[0.0, 2.0], 1).unwrap();
        assert_eq!(hits[0].0, 1);
    }
}
