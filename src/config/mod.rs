// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Environment-driven configuration
//!
//! Everything comes from environment variables (a `.env` file is honored by
//! the binary). The chat API key is the only mandatory setting; missing it is
//! a startup failure, never a per-request one.

use anyhow::{bail, Result};
use std::env;
use std::io;
use std::path::{Path, PathBuf};

/// Process-wide configuration resolved once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bearer token for the hosted chat-completion endpoint
    pub api_key: String,
    /// Base URL of the chat API (".../v1")
    pub chat_api_url: String,
    /// Model used for text-only answers
    pub chat_text_model: String,
    /// Model used for image-augmented answers
    pub chat_vision_model: String,
    pub text_model_path: PathBuf,
    pub text_tokenizer_path: PathBuf,
    pub image_model_path: PathBuf,
    pub detector_model_path: PathBuf,
}

impl AppConfig {
    /// Resolves configuration from the environment.
    ///
    /// # Errors
    /// Fails if `OPENAI_API_KEY` is unset or empty. Every other variable has
    /// a default.
    pub fn from_env() -> Result<Self> {
        let api_key = match env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY is not set; the node cannot answer queries without it"),
        };

        Ok(Self {
            api_key,
            chat_api_url: env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            chat_text_model: env::var("CHAT_TEXT_MODEL")
                .unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
            chat_vision_model: env::var("CHAT_VISION_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            text_model_path: env_path(
                "TEXT_MODEL_PATH",
                "./models/all-MiniLM-L6-v2-onnx/model.onnx",
            ),
            text_tokenizer_path: env_path(
                "TEXT_TOKENIZER_PATH",
                "./models/all-MiniLM-L6-v2-onnx/tokenizer.json",
            ),
            image_model_path: env_path(
                "IMAGE_MODEL_PATH",
                "./models/clip-vit-b-32-onnx/visual_model.onnx",
            ),
            detector_model_path: env_path("DETECTOR_MODEL_PATH", "./models/cavity-yolo/best.onnx"),
        })
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

/// On-disk layout of the persisted state under a single data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the data directory and the saved-image directory.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.image_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the full record mapping
    pub fn records_snapshot(&self) -> PathBuf {
        self.root.join("records.bin")
    }

    pub fn text_index(&self) -> PathBuf {
        self.root.join("text_vectors.idx")
    }

    pub fn image_index(&self) -> PathBuf {
        self.root.join("image_vectors.idx")
    }

    /// Directory of annotated images, named by content hash
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("images")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_live_under_root() {
        let layout = DataLayout::new("/tmp/clinic");
        assert_eq!(layout.records_snapshot(), PathBuf::from("/tmp/clinic/records.bin"));
        assert_eq!(layout.text_index(), PathBuf::from("/tmp/clinic/text_vectors.idx"));
        assert_eq!(layout.image_index(), PathBuf::from("/tmp/clinic/image_vectors.idx"));
        assert_eq!(layout.image_dir(), PathBuf::from("/tmp/clinic/images"));
    }
}
