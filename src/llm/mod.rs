// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Hosted chat-completion client via OpenAI-compatible API
//!
//! Two variants: a text-only completion over the retrieved record context,
//! and a multimodal completion whose message content carries a text block
//! and a base64 data-URL image block.

use reqwest::Client;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::vision::image_utils::{self, ImageError};

// --- OpenAI-compatible serde structs ---

#[derive(serde::Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(serde::Serialize)]
struct ChatMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(serde::Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("chat API response contained no choices")]
    EmptyResponse,

    #[error("failed to encode image {path}: {source}")]
    ImageEncode { path: PathBuf, source: ImageError },
}

const SYSTEM_PROMPT: &str = "Você é um assistente de inteligência artificial especializado em \
auxiliar dentistas a consultar informações detalhadas sobre seus pacientes. Responda de maneira \
clara e técnica.";

/// Prompt sent alongside a stored image in the multimodal variant
pub const IMAGE_ANALYSIS_PROMPT: &str =
    "Analise a imagem odontológica para identificar possíveis cáries ou anomalias.";

/// Client for the hosted chat-completion endpoint, bearer-token
/// authenticated.
pub struct ChatClient {
    client: Client,
    api_url: String,
    api_key: String,
    text_model: String,
    vision_model: String,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("api_url", &self.api_url)
            .field("text_model", &self.text_model)
            .field("vision_model", &self.vision_model)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub fn new(
        api_url: &str,
        api_key: &str,
        text_model: &str,
        vision_model: &str,
    ) -> Result<Self, ChatError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            text_model: text_model.to_string(),
            vision_model: vision_model.to_string(),
        })
    }

    /// Text-only completion: dental-assistant system prompt plus the
    /// retrieved context and the original question.
    pub async fn text_answer(&self, question: &str, context: &str) -> Result<String, ChatError> {
        let request = ChatRequest {
            model: self.text_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: json!(SYSTEM_PROMPT),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: json!(format!("{context}\n\nPergunta: {question}")),
                },
            ],
            max_tokens: 150,
            temperature: 0.7,
        };
        self.dispatch(request).await
    }

    /// Multimodal completion: the analysis prompt plus one stored image as a
    /// base64 data URL.
    pub async fn image_answer(&self, prompt: &str, image_path: &Path) -> Result<String, ChatError> {
        let data_url =
            image_utils::data_url_for_file(image_path).map_err(|source| ChatError::ImageEncode {
                path: image_path.to_path_buf(),
                source,
            })?;

        let request = ChatRequest {
            model: self.vision_model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]),
            }],
            max_tokens: 300,
            temperature: 0.3,
        };
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: ChatRequest) -> Result<String, ChatError> {
        debug!(model = %request.model, "dispatching chat completion");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await?;
        chat.choices
            .first()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or(ChatError::EmptyResponse)
    }
}
