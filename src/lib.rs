// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod api;
pub mod config;
pub mod embeddings;
pub mod ingest;
pub mod llm;
pub mod query;
pub mod records;
pub mod state;
pub mod vector;
pub mod vision;

// Re-export the types the binary and the tests compose
pub use config::{AppConfig, DataLayout};
pub use embeddings::{ImageEmbedder, TextEmbedder};
pub use ingest::{compose_record_text, IngestError, IngestPipeline, IntakeForm};
pub use llm::{ChatClient, ChatError};
pub use query::{wants_image, QueryAnswer, QueryError, QueryPipeline, RetrievedContext};
pub use records::{PatientRecord, RecordId, RecordStore, RecordStoreError};
pub use state::ClinicState;
pub use vector::{FlatL2Index, IndexError};
