// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! axum router and handlers
//!
//! Two interaction surfaces, mirroring the original two-tab form: intake
//! with optional cavity detection (`POST /v1/records`), and the question
//! surface (`POST /v1/query`). Record listing and a health probe round the
//! API out.

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::ApiError;
use crate::ingest::{IngestPipeline, IntakeForm};
use crate::query::QueryPipeline;
use crate::records::{PatientRecord, RecordId};
use crate::state::ClinicState;
use crate::vision::{self, image_utils, CavityDetector, Detection};

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestPipeline>,
    pub query: Arc<QueryPipeline>,
    pub detector: Arc<CavityDetector>,
    pub clinic: Arc<Mutex<ClinicState>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/records", post(intake_handler).get(records_handler))
        .route("/v1/query", post(query_handler))
        // Photo uploads are capped at 10MB by the decoder; leave headroom
        // for the multipart framing
        .layer(DefaultBodyLimit::max(12 * 1024 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to install shutdown handler: {err}");
    }
}

// --- intake ---

#[derive(Debug, Serialize)]
struct IntakeResponse {
    record_id: RecordId,
    detections: Vec<Detection>,
    image_path: Option<String>,
    message: String,
}

#[derive(Default)]
struct IntakeSubmission {
    form: IntakeForm,
    photo: Option<Vec<u8>>,
}

async fn read_submission(mut multipart: Multipart) -> Result<IntakeSubmission, ApiError> {
    let mut submission = IntakeSubmission::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "photo" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
                submission.photo = Some(bytes.to_vec());
            }
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
                match name.as_str() {
                    "name" => submission.form.name = value,
                    "age" => {
                        submission.form.age = value.trim().parse().map_err(|_| {
                            ApiError::ValidationError {
                                field: "age".to_string(),
                                message: format!("'{value}' is not a number"),
                            }
                        })?
                    }
                    "email" => submission.form.email = value,
                    "phone" => submission.form.phone = value,
                    "reason" => submission.form.reason = value,
                    "other_conditions" => submission.form.other_conditions = value,
                    "medications" => submission.form.medications = value,
                    _ => {}
                }
            }
        }
    }
    Ok(submission)
}

/// Intake: validate, detect over the optional photo, ingest, and attach the
/// annotated image when the detector found something.
async fn intake_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let submission = read_submission(multipart).await?;

    let mut detections = Vec::new();
    let mut annotated = None;
    if let Some(bytes) = &submission.photo {
        let (image, _format) = image_utils::decode_image_bytes(bytes)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        detections = state
            .detector
            .detect(&image)
            .map_err(|e| ApiError::InternalError(format!("detection failed: {e}")))?;
        if !detections.is_empty() {
            annotated = Some(vision::annotate(&image, &detections));
        }
    }

    let record_id = state.ingest.ingest_record(&submission.form).await?;

    let (image_path, message) = match annotated {
        Some(annotated) => {
            let path = state.ingest.attach_image(record_id, &annotated).await?;
            (
                Some(path.display().to_string()),
                "Prontuário salvo; imagem anotada salva no banco vetorial.".to_string(),
            )
        }
        None if submission.photo.is_some() => (
            None,
            "Prontuário salvo; nenhuma cárie detectada na imagem, a imagem não será salva."
                .to_string(),
        ),
        None => (None, "Prontuário salvo; nenhuma imagem foi enviada.".to_string()),
    };

    Ok(Json(IntakeResponse {
        record_id,
        detections,
        image_path,
        message,
    }))
}

// --- record listing ---

#[derive(Debug, Serialize)]
struct StoredRecord {
    id: RecordId,
    #[serde(flatten)]
    record: PatientRecord,
}

async fn records_handler(State(state): State<AppState>) -> impl IntoResponse {
    let clinic = state.clinic.lock().await;
    let records: Vec<StoredRecord> = clinic
        .records
        .iter()
        .map(|(id, record)| StoredRecord {
            id,
            record: record.clone(),
        })
        .collect();
    Json(records)
}

// --- query ---

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    answer: String,
    /// Base64 data URL of the analyzed image, when one was used
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.question.trim().is_empty() {
        return Err(ApiError::ValidationError {
            field: "question".to_string(),
            message: "insira uma pergunta para buscar".to_string(),
        });
    }

    let answer = state.query.answer(&request.question).await?;

    let image = match &answer.image_path {
        Some(path) => Some(
            image_utils::data_url_for_file(path)
                .map_err(|e| ApiError::InternalError(format!("failed to encode image: {e}")))?,
        ),
        None => None,
    };

    Ok(Json(QueryResponse {
        answer: answer.text,
        image,
    }))
}

// --- health ---

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let clinic = state.clinic.lock().await;
    Json(json!({
        "status": "ok",
        "records": clinic.records.len(),
        "text_vectors": clinic.text_index.len(),
        "image_vectors": clinic.image_index.len(),
        "aligned": clinic.is_aligned(),
    }))
}
