// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Intake ingestion pipeline
//!
//! Turns a submitted intake form into a text embedding, appends it to the
//! text index, and stores the record under the id derived from the vector's
//! position. A detection-positive annotated image is embedded, appended to
//! the image index, saved under a content-hash file name and linked back to
//! the record.

use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::embeddings::{ImageEmbedder, TextEmbedder};
use crate::records::{PatientRecord, RecordId, RecordStoreError};
use crate::state::ClinicState;
use crate::vector::IndexError;

/// One submitted intake form. Only `name` is validated; age bounds are the
/// input surface's concern.
#[derive(Debug, Clone, Default)]
pub struct IntakeForm {
    pub name: String,
    pub age: u32,
    pub email: String,
    pub phone: String,
    pub reason: String,
    pub other_conditions: String,
    pub medications: String,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("o campo 'Nome' é obrigatório")]
    MissingName,

    #[error("text embedding failed: {0}")]
    TextEmbedding(anyhow::Error),

    #[error("image embedding failed: {0}")]
    ImageEmbedding(anyhow::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] RecordStoreError),

    #[error(
        "record store and text index are out of step: the index holds \
         {index_len} vectors but the store holds {store_len} records"
    )]
    StoreDesync { index_len: usize, store_len: usize },

    #[error("failed to save annotated image {path}: {source}")]
    ImageSave {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Builds the fixed-template embedding input from the form fields.
pub fn compose_record_text(form: &IntakeForm) -> String {
    format!(
        "Nome: {}\nIdade: {}\nEmail: {}\nTelefone: {}\nMotivo da consulta: {}\nOutras doenças: {}\nMedicamentos: {}",
        form.name,
        form.age,
        form.email,
        form.phone,
        form.reason,
        form.other_conditions,
        form.medications
    )
}

pub struct IngestPipeline {
    state: Arc<Mutex<ClinicState>>,
    text_embedder: Arc<dyn TextEmbedder>,
    image_embedder: Arc<dyn ImageEmbedder>,
    image_dir: PathBuf,
}

impl IngestPipeline {
    pub fn new(
        state: Arc<Mutex<ClinicState>>,
        text_embedder: Arc<dyn TextEmbedder>,
        image_embedder: Arc<dyn ImageEmbedder>,
        image_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            text_embedder,
            image_embedder,
            image_dir,
        }
    }

    /// Ingests a form: compose, embed, append to the text index, store the
    /// record under the new position. Returns the record id.
    ///
    /// After the write the store/index alignment is validated; a violation
    /// is reported as `StoreDesync` rather than silently carried forward.
    pub async fn ingest_record(&self, form: &IntakeForm) -> Result<RecordId, IngestError> {
        if form.name.trim().is_empty() {
            return Err(IngestError::MissingName);
        }

        let composed_text = compose_record_text(form);
        let embedding = self
            .text_embedder
            .embed(&composed_text)
            .await
            .map_err(IngestError::TextEmbedding)?;

        let mut state = self.state.lock().await;
        let position = state.text_index.add(&embedding)?;
        let id = position as RecordId;

        let record = PatientRecord {
            name: form.name.clone(),
            age: form.age,
            email: form.email.clone(),
            phone: form.phone.clone(),
            reason: form.reason.clone(),
            other_conditions: form.other_conditions.clone(),
            medications: form.medications.clone(),
            composed_text,
            image_paths: Vec::new(),
        };
        state.records.put(id, record)?;

        if !state.is_aligned() {
            return Err(IngestError::StoreDesync {
                index_len: state.text_index.len(),
                store_len: state.records.len(),
            });
        }

        info!(record_id = id, "patient record ingested");
        Ok(id)
    }

    /// Embeds and stores a detection-positive annotated image, then links it
    /// to the record. Returns the saved file path.
    ///
    /// The file name is a SHA-256 of the image content, so re-uploading the
    /// same annotated photo lands on the same path and distinct photos never
    /// collide.
    pub async fn attach_image(
        &self,
        record_id: RecordId,
        image: &DynamicImage,
    ) -> Result<PathBuf, IngestError> {
        let embedding = self
            .image_embedder
            .embed(image)
            .await
            .map_err(IngestError::ImageEmbedding)?;

        let mut state = self.state.lock().await;
        let position = state.image_index.add(&embedding)?;

        let path = self.image_dir.join(format!("{}.png", content_hash(image)));
        image.save(&path).map_err(|source| IngestError::ImageSave {
            path: path.clone(),
            source,
        })?;

        state.records.append_image(record_id, path.clone())?;
        info!(
            record_id,
            image_position = position,
            path = %path.display(),
            "annotated image attached"
        );
        Ok(path)
    }
}

fn content_hash(image: &DynamicImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.to_rgb8().as_raw());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_text_follows_the_intake_template() {
        let form = IntakeForm {
            name: "Maria".to_string(),
            age: 34,
            email: "maria@example.com".to_string(),
            phone: "11 99999-0000".to_string(),
            reason: "Dor de dente".to_string(),
            other_conditions: "Nenhuma".to_string(),
            medications: "Ibuprofeno".to_string(),
        };

        let text = compose_record_text(&form);
        assert!(text.starts_with("Nome: Maria\nIdade: 34\n"));
        assert!(text.contains("Motivo da consulta: Dor de dente"));
        assert!(text.ends_with("Medicamentos: Ibuprofeno"));
    }

    #[test]
    fn content_hash_distinguishes_different_images() {
        let black = DynamicImage::new_rgb8(8, 8);
        let mut white = image::RgbImage::new(8, 8);
        white.pixels_mut().for_each(|p| *p = image::Rgb([255, 255, 255]));
        let white = DynamicImage::ImageRgb8(white);

        assert_ne!(content_hash(&black), content_hash(&white));
        assert_eq!(content_hash(&black), content_hash(&DynamicImage::new_rgb8(8, 8)));
    }
}
