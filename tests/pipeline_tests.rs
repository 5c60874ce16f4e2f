// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! End-to-end pipeline tests over stub embedders
//!
//! The stubs embed text as word counts over a tiny vocabulary, which makes
//! retrieval ranking deterministic without any model files on disk.

use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use tokio::sync::Mutex;

use odonto_rag_node::embeddings::{ImageEmbedder, TextEmbedder};
use odonto_rag_node::{
    ChatClient, ClinicState, FlatL2Index, IngestError, IngestPipeline, IntakeForm, QueryError,
    QueryPipeline, RecordStore,
};

struct WordCountEmbedder {
    words: Vec<&'static str>,
}

#[async_trait]
impl TextEmbedder for WordCountEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        Ok(self
            .words
            .iter()
            .map(|word| lowered.matches(word).count() as f32)
            .collect())
    }

    fn dimension(&self) -> usize {
        self.words.len()
    }
}

struct FixedImageEmbedder;

#[async_trait]
impl ImageEmbedder for FixedImageEmbedder {
    async fn embed(&self, _image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0, 0.0])
    }

    fn dimension(&self) -> usize {
        4
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    clinic: Arc<Mutex<ClinicState>>,
    ingest: IngestPipeline,
    query: QueryPipeline,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let text_embedder: Arc<dyn TextEmbedder> = Arc::new(WordCountEmbedder {
        words: vec!["maria", "joão", "cárie"],
    });
    let image_embedder: Arc<dyn ImageEmbedder> = Arc::new(FixedImageEmbedder);

    let text_index =
        FlatL2Index::open_or_create(dir.path().join("text.idx"), text_embedder.dimension())
            .unwrap();
    let image_index =
        FlatL2Index::open_or_create(dir.path().join("image.idx"), image_embedder.dimension())
            .unwrap();
    let records = RecordStore::load(dir.path().join("records.bin")).unwrap();
    let clinic = Arc::new(Mutex::new(ClinicState::new(records, text_index, image_index)));

    let image_dir = dir.path().join("images");
    std::fs::create_dir_all(&image_dir).unwrap();

    let ingest = IngestPipeline::new(
        clinic.clone(),
        text_embedder.clone(),
        image_embedder,
        image_dir,
    );
    // The chat endpoint is never reached by these tests; retrieval is
    // exercised through `retrieve`, which stops before any external call
    let chat = ChatClient::new("http://127.0.0.1:9", "test-key", "text-model", "vision-model")
        .unwrap();
    let query = QueryPipeline::new(clinic.clone(), text_embedder, chat);

    Harness {
        _dir: dir,
        clinic,
        ingest,
        query,
    }
}

fn form(name: &str, reason: &str) -> IntakeForm {
    IntakeForm {
        name: name.to_string(),
        age: 30,
        email: format!("{}@example.com", name.to_lowercase()),
        phone: "11 91234-5678".to_string(),
        reason: reason.to_string(),
        other_conditions: "Nenhuma".to_string(),
        medications: "Nenhum".to_string(),
    }
}

#[tokio::test]
async fn record_ids_follow_insertion_order() {
    let h = harness();
    assert_eq!(h.ingest.ingest_record(&form("Maria", "Dor")).await.unwrap(), 0);
    assert_eq!(h.ingest.ingest_record(&form("João", "Dor")).await.unwrap(), 1);
    assert_eq!(h.ingest.ingest_record(&form("Pedro", "Dor")).await.unwrap(), 2);

    let clinic = h.clinic.lock().await;
    assert_eq!(clinic.text_index.len(), 3);
    assert_eq!(clinic.records.len(), 3);
    assert!(clinic.is_aligned());
    assert_eq!(clinic.records.get(0).unwrap().name, "Maria");
    assert_eq!(clinic.records.get(2).unwrap().name, "Pedro");
}

#[tokio::test]
async fn blank_name_is_rejected_and_nothing_is_stored() {
    let h = harness();
    let err = h.ingest.ingest_record(&form("   ", "Dor")).await.unwrap_err();
    assert!(matches!(err, IngestError::MissingName));

    let clinic = h.clinic.lock().await;
    assert_eq!(clinic.records.len(), 0);
    assert_eq!(clinic.text_index.len(), 0);
}

#[tokio::test]
async fn attach_image_links_the_record_and_saves_the_file() {
    let h = harness();
    let id = h.ingest.ingest_record(&form("João", "Dor")).await.unwrap();

    let annotated = DynamicImage::new_rgb8(16, 16);
    let path = h.ingest.attach_image(id, &annotated).await.unwrap();

    assert!(path.exists());
    let clinic = h.clinic.lock().await;
    assert_eq!(clinic.records.get(id).unwrap().image_paths, vec![path]);
    assert_eq!(clinic.image_index.len(), 1);
}

#[tokio::test]
async fn attach_image_to_a_missing_record_fails() {
    let h = harness();
    let annotated = DynamicImage::new_rgb8(16, 16);
    let err = h.ingest.attach_image(42, &annotated).await.unwrap_err();
    assert!(matches!(err, IngestError::Store(_)));
}

#[tokio::test]
async fn maria_query_is_answered_from_text_only_context() {
    let h = harness();
    h.ingest.ingest_record(&form("Maria", "Dor de dente")).await.unwrap();

    let retrieved = h.query.retrieve("Qual o histórico da Maria?").await.unwrap();
    assert!(!retrieved.wants_image);
    assert!(retrieved.image_path.is_none());
    assert!(retrieved.context.starts_with("Nome: Maria"));
}

#[tokio::test]
async fn cavity_query_over_an_imaged_record_captures_the_image() {
    let h = harness();
    h.ingest.ingest_record(&form("Maria", "Dor de dente")).await.unwrap();
    let joao = h.ingest.ingest_record(&form("João", "Dor de dente")).await.unwrap();
    let saved = h
        .ingest
        .attach_image(joao, &DynamicImage::new_rgb8(16, 16))
        .await
        .unwrap();

    let retrieved = h
        .query
        .retrieve("A radiografia do João mostra cárie?")
        .await
        .unwrap();
    assert!(retrieved.wants_image);
    assert_eq!(retrieved.image_path, Some(saved));
    // João's record ranks first and carries the image, so the walk stops there
    assert!(retrieved.context.contains("Nome: João"));
    assert!(!retrieved.context.contains("Nome: Maria"));
}

#[tokio::test]
async fn context_walk_stops_at_the_first_image_bearing_record() {
    let h = harness();
    h.ingest.ingest_record(&form("Maria", "Dor de dente")).await.unwrap();
    let joao = h.ingest.ingest_record(&form("João", "Dor de dente")).await.unwrap();
    h.ingest
        .ingest_record(&form("Pedro", "Suspeita de cárie"))
        .await
        .unwrap();
    h.ingest
        .attach_image(joao, &DynamicImage::new_rgb8(16, 16))
        .await
        .unwrap();

    // Ranks Maria first (two mentions), João second, Pedro third; the image
    // sits on the second-ranked record
    let retrieved = h
        .query
        .retrieve("radiografia: maria maria joão")
        .await
        .unwrap();
    assert!(retrieved.wants_image);
    assert!(retrieved.image_path.is_some());
    assert!(retrieved.context.contains("Nome: Maria"));
    assert!(retrieved.context.contains("Nome: João"));
    // Lower-ranked records after the image match are dropped from context
    assert!(!retrieved.context.contains("Nome: Pedro"));
}

#[tokio::test]
async fn image_relevant_query_without_stored_images_stays_text_only() {
    let h = harness();
    h.ingest.ingest_record(&form("Maria", "Dor de dente")).await.unwrap();

    let retrieved = h.query.retrieve("Tem alguma foto da maria?").await.unwrap();
    assert!(retrieved.wants_image);
    assert!(retrieved.image_path.is_none());
    assert!(retrieved.context.contains("Nome: Maria"));
}

#[tokio::test]
async fn empty_store_reports_no_relevant_record() {
    let h = harness();
    let err = h.query.retrieve("Qual o histórico da Maria?").await.unwrap_err();
    assert!(matches!(err, QueryError::NoRelevantRecord));
}
