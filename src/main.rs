// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use odonto_rag_node::{
    api::{self, AppState},
    config::{AppConfig, DataLayout},
    embeddings::{ClipImageModel, ImageEmbedder, MiniLmTextModel, TextEmbedder},
    ingest::IngestPipeline,
    llm::ChatClient,
    query::QueryPipeline,
    records::RecordStore,
    state::ClinicState,
    vector::FlatL2Index,
    vision::CavityDetector,
};

#[derive(Parser, Debug)]
#[command(
    name = "odonto-rag-node",
    version,
    about = "Dental intake, cavity detection and record retrieval node"
)]
struct Args {
    /// Port for the HTTP API
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    port: u16,

    /// Directory holding the record snapshot, vector indexes and saved images
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let layout = DataLayout::new(&args.data_dir);
    layout
        .ensure()
        .with_context(|| format!("failed to create data directory {}", args.data_dir.display()))?;

    info!("loading models");
    let text_embedder = Arc::new(
        MiniLmTextModel::load(&config.text_model_path, &config.text_tokenizer_path)
            .context("failed to load the text embedding model")?,
    );
    let image_embedder = Arc::new(
        ClipImageModel::load(&config.image_model_path)
            .context("failed to load the image embedding model")?,
    );
    let detector = Arc::new(
        CavityDetector::load(&config.detector_model_path)
            .context("failed to load the cavity detection model")?,
    );

    // Index dimensions come from the loaded models; a persisted index built
    // with a different model aborts here
    let text_index = FlatL2Index::open_or_create(layout.text_index(), text_embedder.dimension())?;
    let image_index =
        FlatL2Index::open_or_create(layout.image_index(), image_embedder.dimension())?;
    let records = RecordStore::load(layout.records_snapshot())?;

    info!(
        records = records.len(),
        text_vectors = text_index.len(),
        image_vectors = image_index.len(),
        "persisted state loaded"
    );

    let clinic = Arc::new(Mutex::new(ClinicState::new(records, text_index, image_index)));
    {
        let state = clinic.lock().await;
        if !state.is_aligned() {
            warn!(
                text_vectors = state.text_index.len(),
                records = state.records.len(),
                "record store and text index are out of step; a previous run \
                 likely crashed between an index append and the record persist"
            );
        }
    }

    let chat = ChatClient::new(
        &config.chat_api_url,
        &config.api_key,
        &config.chat_text_model,
        &config.chat_vision_model,
    )?;

    let text_embedder: Arc<dyn TextEmbedder> = text_embedder;
    let image_embedder: Arc<dyn ImageEmbedder> = image_embedder;

    let ingest = Arc::new(IngestPipeline::new(
        clinic.clone(),
        text_embedder.clone(),
        image_embedder,
        layout.image_dir(),
    ));
    let query = Arc::new(QueryPipeline::new(clinic.clone(), text_embedder, chat));

    api::serve(
        AppState {
            ingest,
            query,
            detector,
            clinic,
        },
        args.port,
    )
    .await
}
