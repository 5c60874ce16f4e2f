// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! ONNX wrapper for the CLIP ViT-B/32 visual encoder

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::ImageEmbedder;

const CLIP_INPUT_SIZE: u32 = 224;

// Per-channel normalization constants of the CLIP image preprocessor
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct ClipImageModel {
    session: Arc<Mutex<Session>>,
    dimension: usize,
}

impl std::fmt::Debug for ClipImageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipImageModel")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl ClipImageModel {
    /// Loads the visual encoder and learns its output dimension from a probe
    /// inference over a blank image.
    ///
    /// # Errors
    /// Returns an error (treated as fatal at startup) if the model file is
    /// missing, the session cannot be built, or the output is not a
    /// `[1, dim]` embedding tensor.
    pub fn load(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("image model file not found: {}", model_path.display());
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
            .with_context(|| format!("failed to load image model from {}", model_path.display()))?;

        let session = Arc::new(Mutex::new(session));

        let probe = DynamicImage::new_rgb8(CLIP_INPUT_SIZE, CLIP_INPUT_SIZE);
        let embedding = run_encoder(&session, &probe)?;
        let dimension = embedding.len();
        if dimension == 0 {
            anyhow::bail!("image model produced an empty embedding");
        }

        info!(dimension, "image embedding model loaded");
        Ok(Self { session, dimension })
    }
}

#[async_trait]
impl ImageEmbedder for ClipImageModel {
    async fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let embedding = run_encoder(&self.session, image)?;
        if embedding.len() != self.dimension {
            anyhow::bail!(
                "unexpected image embedding dimension: {} (expected {})",
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

fn run_encoder(session: &Arc<Mutex<Session>>, image: &DynamicImage) -> Result<Vec<f32>> {
    let pixel_values = preprocess(image);

    let mut session = session.lock().unwrap();
    let outputs = session.run(ort::inputs![
        "pixel_values" => Value::from_array(pixel_values)?
    ])?;

    let output = outputs[0]
        .try_extract_array::<f32>()
        .context("failed to extract image embedding tensor")?;
    let shape = output.shape().to_vec();
    if shape.len() != 2 || shape[0] != 1 {
        anyhow::bail!("image model output has unexpected shape {:?}", shape);
    }

    Ok(output.iter().copied().collect())
}

/// Resize-and-center-crop to 224x224, scale to [0, 1], normalize per channel,
/// lay out as `[1, 3, 224, 224]`.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let resized = image
        .resize_to_fill(CLIP_INPUT_SIZE, CLIP_INPUT_SIZE, FilterType::CatmullRom)
        .to_rgb8();

    let size = CLIP_INPUT_SIZE as usize;
    let mut pixel_values = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            let value = pixel.0[channel] as f32 / 255.0;
            pixel_values[[0, channel, y as usize, x as usize]] =
                (value - CLIP_MEAN[channel]) / CLIP_STD[channel];
        }
    }
    pixel_values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_produces_clip_layout() {
        let image = DynamicImage::new_rgb8(640, 480);
        let tensor = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
        // Black input maps to -mean/std on every channel
        for channel in 0..3 {
            let expected = -CLIP_MEAN[channel] / CLIP_STD[channel];
            assert!((tensor[[0, channel, 0, 0]] - expected).abs() < 1e-5);
        }
    }
}
