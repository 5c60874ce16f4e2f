// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HTTP trigger surface for the intake and query pipelines

pub mod http_server;

pub use http_server::{router, serve, AppState};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ingest::IngestError;
use crate::query::QueryError;
use crate::records::RecordStoreError;

/// JSON error body returned for every failed request
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    ValidationError { field: String, message: String },
    NotFound(String),
    UpstreamError(String),
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::ValidationError { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::ValidationError { .. } => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::UpstreamError(_) => "upstream_error",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::UpstreamError(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            ApiError::ValidationError { field, message } => format!("{field}: {message}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error_type: self.error_type().to_string(),
            message: self.message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::MissingName => ApiError::ValidationError {
                field: "name".to_string(),
                message: err.to_string(),
            },
            IngestError::Store(RecordStoreError::NotFound(id)) => {
                ApiError::NotFound(format!("record {id} not found"))
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::NoRelevantRecord => ApiError::NotFound(err.to_string()),
            QueryError::Chat(chat) => ApiError::UpstreamError(chat.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}
