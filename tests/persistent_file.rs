//! Sessions persisted to a directory.
//!
//! These tests verify that the file substrate:
//! - survives a close and reopen
//! - enforces its byte budget through the gateway's eviction path
//! - refuses corrupted documents and concurrent owners

#![cfg(feature = "persistent")]

use std::fs;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::tempdir;

use dossier::storage::persistent::{open_directory, FileSubstrate, FileSubstrateConfig};
use dossier::{DossierError, EntityId, ManualClock, PersistError, SaveOutcome, Session, Substrate};

fn id(name: &str) -> EntityId {
    EntityId::new(name).unwrap()
}

#[test]
fn test_session_survives_reopen() {
    let dir = tempdir().unwrap();

    {
        let substrate = open_directory(dir.path(), None).unwrap();
        let mut session = Session::builder().substrate(Arc::new(substrate)).open().unwrap();
        session.upsert(&id("S-1"), |r| {
            r.set_field("name", "Grace");
        });
        session.append_image(&id("S-1"), vec![0xAB; 128], "scan.png").unwrap();
        session.set_active_entity(Some(id("S-1")));
        session.close().unwrap();
    }

    let substrate = open_directory(dir.path(), None).unwrap();
    let session = Session::builder().substrate(Arc::new(substrate)).open().unwrap();
    let record = session.get(&id("S-1")).unwrap();
    assert_eq!(record.field("name").and_then(|v| v.as_text()), Some("Grace"));
    assert_eq!(record.images()[0].payload, vec![0xAB; 128]);
    assert_eq!(session.store().active_entity(), Some(&id("S-1")));
}

#[test]
fn test_budget_enforced_with_eviction() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()));
    let substrate = Arc::new(
        FileSubstrate::open(
            dir.path(),
            FileSubstrateConfig {
                capacity: Some(8 * 1024),
                sync_on_write: false,
            },
        )
        .unwrap(),
    );
    let mut session = Session::builder()
        .substrate(substrate.clone())
        .clock(clock.clone())
        .open()
        .unwrap();

    session.append_image(&id("old"), vec![1; 6 * 1024], "old.png").unwrap();
    clock.advance(Duration::days(9));
    session.append_image(&id("new"), vec![2; 1024], "new.png").unwrap();

    let outcome = session.flush().unwrap();
    assert!(matches!(outcome, SaveOutcome::WrittenAfterEviction { .. }));
    assert!(substrate.used_bytes().unwrap() <= 8 * 1024);

    let stored = session.gateway().load().unwrap();
    assert!(stored.record(&id("old")).is_none());
    assert!(stored.record(&id("new")).is_some());
    assert!(session.get(&id("old")).is_ok());
}

#[test]
fn test_corrupted_document_blocks_open() {
    let dir = tempdir().unwrap();
    {
        let substrate = open_directory(dir.path(), None).unwrap();
        let mut session = Session::builder().substrate(Arc::new(substrate)).open().unwrap();
        session.upsert(&id("A"), |_| {});
        session.flush().unwrap();
    }

    let path = dir.path().join("dossier.snapshot.dsr");
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x55;
    fs::write(&path, &bytes).unwrap();

    let substrate = open_directory(dir.path(), None).unwrap();
    let err = Session::builder().substrate(Arc::new(substrate)).open().unwrap_err();
    assert!(matches!(err, DossierError::Persist(PersistError::Corrupted { .. })));
    assert_eq!(fs::read(&path).unwrap(), bytes);
}

#[test]
fn test_directory_has_one_owner() {
    let dir = tempdir().unwrap();
    let _first = open_directory(dir.path(), None).unwrap();
    let err = open_directory(dir.path(), None).unwrap_err();
    assert!(err.is_persist());
}

#[test]
fn test_interrupted_write_leaves_previous_document() {
    let dir = tempdir().unwrap();
    {
        let substrate = open_directory(dir.path(), None).unwrap();
        let mut session = Session::builder().substrate(Arc::new(substrate)).open().unwrap();
        session.upsert(&id("A"), |_| {});
        session.flush().unwrap();
    }

    // A crash between temp-file write and rename leaves a stray temp file.
    let stray = dir.path().join("dossier.snapshot.dsr.tmp.interrupted");
    fs::write(&stray, b"DSSR\x01partial").unwrap();

    let substrate = open_directory(dir.path(), None).unwrap();
    assert!(!stray.exists());
    let session = Session::builder().substrate(Arc::new(substrate)).open().unwrap();
    assert!(session.get(&id("A")).is_ok());
}

#[test]
fn test_invalid_capacity_rejected() {
    let dir = tempdir().unwrap();
    let err = open_directory(
        dir.path(),
        Some(FileSubstrateConfig {
            capacity: Some(16),
            sync_on_write: true,
        }),
    )
    .unwrap_err();
    assert!(err.is_validation());
}
