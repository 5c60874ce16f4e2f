// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Record snapshot and vector index persistence tests

use std::collections::BTreeMap;
use std::path::PathBuf;

use odonto_rag_node::{FlatL2Index, PatientRecord, RecordStore};

fn sample_record(name: &str) -> PatientRecord {
    PatientRecord {
        name: name.to_string(),
        age: 41,
        email: format!("{}@example.com", name.to_lowercase()),
        phone: "11 91234-5678".to_string(),
        reason: "Dor de dente".to_string(),
        other_conditions: "Nenhuma".to_string(),
        medications: "Nenhum".to_string(),
        composed_text: format!("Nome: {name}\nIdade: 41"),
        image_paths: Vec::new(),
    }
}

#[test]
fn record_store_round_trips_through_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.bin");

    let mut store = RecordStore::load(&path).unwrap();
    store.put(0, sample_record("Maria")).unwrap();
    let mut with_image = sample_record("João");
    with_image.image_paths.push(PathBuf::from("images/abc.png"));
    store.put(1, with_image).unwrap();
    let original: Vec<_> = store.iter().map(|(id, r)| (id, r.clone())).collect();
    drop(store);

    let reloaded = RecordStore::load(&path).unwrap();
    let restored: Vec<_> = reloaded.iter().map(|(id, r)| (id, r.clone())).collect();
    assert_eq!(original, restored);
}

#[test]
fn legacy_snapshot_entries_are_normalized_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.bin");

    // Snapshot written by the previous generation: id -> bare composed text
    let mut legacy = BTreeMap::new();
    legacy.insert(0u64, "Nome: Maria\nIdade: 34".to_string());
    legacy.insert(1u64, "Nome: João\nIdade: 52".to_string());
    std::fs::write(&path, bincode::serialize(&legacy).unwrap()).unwrap();

    let store = RecordStore::load(&path).unwrap();
    assert_eq!(store.len(), 2);

    let maria = store.get(0).unwrap();
    assert_eq!(maria.composed_text, "Nome: Maria\nIdade: 34");
    assert!(maria.image_paths.is_empty());
    assert!(maria.name.is_empty());

    // Persisting after the upgrade writes the structured shape
    let mut store = store;
    store.persist().unwrap();
    let reloaded = RecordStore::load(&path).unwrap();
    assert_eq!(reloaded.get(1).unwrap().composed_text, "Nome: João\nIdade: 52");
}

#[test]
fn mutations_are_visible_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.bin");

    let mut store = RecordStore::load(&path).unwrap();
    store.put(0, sample_record("Maria")).unwrap();
    store
        .append_image(0, PathBuf::from("images/cafe.png"))
        .unwrap();
    drop(store);

    let reloaded = RecordStore::load(&path).unwrap();
    assert_eq!(
        reloaded.get(0).unwrap().image_paths,
        vec![PathBuf::from("images/cafe.png")]
    );
}

#[test]
fn empty_index_file_is_created_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("text_vectors.idx");

    let index = FlatL2Index::open_or_create(&path, 384).unwrap();
    assert!(path.exists());
    assert!(index.is_empty());
    assert_eq!(index.dimension(), 384);
}
