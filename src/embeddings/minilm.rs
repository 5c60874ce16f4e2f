// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! ONNX wrapper for the all-MiniLM-L6-v2 sentence transformer
//!
//! Tokenizes with the HuggingFace tokenizer, runs the transformer through
//! ONNX Runtime and applies attention-mask mean pooling over the token
//! embeddings to get one 384-dimensional sentence vector.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ndarray::{Array2, Axis};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::info;

use super::TextEmbedder;

/// Output dimension of all-MiniLM-L6-v2
const MINILM_DIMENSION: usize = 384;

#[derive(Clone)]
pub struct MiniLmTextModel {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    dimension: usize,
}

impl std::fmt::Debug for MiniLmTextModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniLmTextModel")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl MiniLmTextModel {
    /// Loads the model and tokenizer from disk and validates the output
    /// shape with a probe inference.
    ///
    /// # Errors
    /// Returns an error (treated as fatal at startup) if either file is
    /// missing, the session cannot be built, or the model does not produce
    /// 384-dimensional token embeddings.
    pub fn load(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("text model file not found: {}", model_path.display());
        }
        if !tokenizer_path.exists() {
            anyhow::bail!("tokenizer file not found: {}", tokenizer_path.display());
        }

        let session = Session::builder()
            .context("failed to create session builder")?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .context("failed to set CPU execution provider")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set optimization level")?
            .with_intra_threads(4)
            .context("failed to set intra threads")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load text model from {}", model_path.display()))?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {}", e))?;

        let model = Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimension: MINILM_DIMENSION,
        };

        // Probe inference validates the hidden dimension before the model is
        // allowed near an index
        let probe = model.encode("validation probe")?;
        if probe.len() != MINILM_DIMENSION {
            anyhow::bail!(
                "text model produced {}-dimensional embeddings, expected {}",
                probe.len(),
                MINILM_DIMENSION
            );
        }

        info!(dimension = MINILM_DIMENSION, "text embedding model loaded");
        Ok(model)
    }

    /// Tokenize, run the transformer, mean-pool over non-padding tokens.
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {}", e))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids = vec![0i64; input_ids.len()];

        let mask_for_pooling = attention_mask.clone();
        let seq_len = input_ids.len();

        let input_ids_array = Array2::from_shape_vec((1, seq_len), input_ids)
            .context("failed to create input_ids array")?;
        let attention_mask_array = Array2::from_shape_vec((1, seq_len), attention_mask)
            .context("failed to create attention_mask array")?;
        let token_type_ids_array = Array2::from_shape_vec((1, seq_len), token_type_ids)
            .context("failed to create token_type_ids array")?;

        let mut session = self.session.lock().unwrap();
        let outputs = session.run(ort::inputs![
            "input_ids" => Value::from_array(input_ids_array)?,
            "attention_mask" => Value::from_array(attention_mask_array)?,
            "token_type_ids" => Value::from_array(token_type_ids_array)?
        ])?;

        // Output name varies between exports; position 0 is the token-level
        // embedding tensor [batch, seq_len, hidden]
        let output = outputs[0]
            .try_extract_array::<f32>()
            .context("failed to extract output tensor")?;
        let tokens = output.index_axis(Axis(0), 0);
        let hidden = tokens.shape()[1];

        let mut pooled = vec![0.0f32; hidden];
        let mut mask_sum = 0.0f32;
        for (i, row) in tokens.axis_iter(Axis(0)).enumerate() {
            let mask = mask_for_pooling[i] as f32;
            mask_sum += mask;
            for (j, value) in row.iter().enumerate() {
                pooled[j] += value * mask;
            }
        }
        for value in &mut pooled {
            *value /= mask_sum.max(1e-9);
        }

        Ok(pooled)
    }
}

#[async_trait]
impl TextEmbedder for MiniLmTextModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.encode(text)?;
        if embedding.len() != self.dimension {
            anyhow::bail!(
                "unexpected embedding dimension: {} (expected {})",
                embedding.len(),
                self.dimension
            );
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
