// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Query/answer pipeline
//!
//! Classifies the question, retrieves the nearest records from the text
//! index, assembles their composed text into a context, and dispatches a
//! text-only or image-augmented chat completion.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::embeddings::TextEmbedder;
use crate::llm::{ChatClient, ChatError, IMAGE_ANALYSIS_PROMPT};
use crate::records::RecordId;
use crate::state::ClinicState;
use crate::vector::IndexError;

/// Queries containing any of these (case-insensitive substrings, source
/// locale) are answered with a stored image when one is available.
pub const IMAGE_KEYWORDS: [&str; 7] = [
    "imagem",
    "foto",
    "detecção",
    "cárie",
    "carie",
    "exame",
    "radiografia",
];

/// Number of nearest records retrieved per query
const RETRIEVAL_K: usize = 5;

/// True when the query asks about an image, detection or exam.
pub fn wants_image(query: &str) -> bool {
    let lowered = query.to_lowercase();
    IMAGE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query embedding failed: {0}")]
    Embedding(anyhow::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("nenhum prontuário relevante encontrado para a consulta")]
    NoRelevantRecord,
}

/// Context assembled from the retrieved records, before any external call
#[derive(Debug, Clone)]
pub struct RetrievedContext {
    /// Composed texts of the walked records, in rank order
    pub context: String,
    /// First stored image of the first image-bearing record walked, only
    /// captured for image-relevant queries
    pub image_path: Option<PathBuf>,
    pub wants_image: bool,
}

#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub text: String,
    /// Set when the answer came from the multimodal call; callers surface
    /// this image alongside the text
    pub image_path: Option<PathBuf>,
}

pub struct QueryPipeline {
    state: Arc<Mutex<ClinicState>>,
    text_embedder: Arc<dyn TextEmbedder>,
    chat: ChatClient,
}

impl QueryPipeline {
    pub fn new(
        state: Arc<Mutex<ClinicState>>,
        text_embedder: Arc<dyn TextEmbedder>,
        chat: ChatClient,
    ) -> Self {
        Self {
            state,
            text_embedder,
            chat,
        }
    }

    /// Embeds the query and walks the top-5 records in rank order,
    /// accumulating composed text.
    ///
    /// For an image-relevant query the walk stops at the first record with a
    /// stored image: one image is sent, and lower-ranked records are dropped
    /// from the context even though fewer than five may have been included.
    pub async fn retrieve(&self, query: &str) -> Result<RetrievedContext, QueryError> {
        let wants_image = wants_image(query);
        let embedding = self
            .text_embedder
            .embed(query)
            .await
            .map_err(QueryError::Embedding)?;

        let state = self.state.lock().await;
        let hits = state.text_index.search(&embedding, RETRIEVAL_K)?;

        let mut context = String::new();
        let mut image_path = None;
        for (position, _distance) in hits {
            let Some(record) = state.records.get(position as RecordId) else {
                continue;
            };
            context.push_str(&record.composed_text);
            context.push_str("\n\n");
            if wants_image {
                if let Some(first_image) = record.image_paths.first() {
                    image_path = Some(first_image.clone());
                    break;
                }
            }
        }

        if context.is_empty() {
            return Err(QueryError::NoRelevantRecord);
        }

        Ok(RetrievedContext {
            context,
            image_path,
            wants_image,
        })
    }

    /// Retrieves context and dispatches the appropriate chat completion.
    pub async fn answer(&self, query: &str) -> Result<QueryAnswer, QueryError> {
        let retrieved = self.retrieve(query).await?;

        match retrieved.image_path {
            Some(image_path) => {
                info!(image = %image_path.display(), "dispatching multimodal answer");
                let text = self.chat.image_answer(IMAGE_ANALYSIS_PROMPT, &image_path).await?;
                Ok(QueryAnswer {
                    text,
                    image_path: Some(image_path),
                })
            }
            None => {
                info!("dispatching text-only answer");
                let text = self.chat.text_answer(query, &retrieved.context).await?;
                Ok(QueryAnswer {
                    text,
                    image_path: None,
                })
            }
        }
    }
}
