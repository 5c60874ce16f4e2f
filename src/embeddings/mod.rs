// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Embedding model wrappers
//!
//! Two ONNX Runtime models produce the fixed-dimension vectors the indexes
//! store: a sentence transformer (all-MiniLM-L6-v2, 384-d) for record text
//! and queries, and the CLIP ViT-B/32 visual encoder (512-d) for annotated
//! images. The pipelines depend on the `TextEmbedder` / `ImageEmbedder`
//! traits, not the concrete models, so they can be exercised without model
//! files on disk.

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;

pub mod clip;
pub mod minilm;

pub use clip::ClipImageModel;
pub use minilm::MiniLmTextModel;

/// Produces fixed-dimension embeddings for text.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension; fixed for the lifetime of the model.
    fn dimension(&self) -> usize;
}

/// Produces fixed-dimension embeddings for images.
#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    async fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;

    /// Output dimension; fixed for the lifetime of the model.
    fn dimension(&self) -> usize;
}
