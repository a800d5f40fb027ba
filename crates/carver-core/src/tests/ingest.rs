use std::sync::Arc;

use crate::backend::Backends;
use crate::ingest::{ChunkPipeline, CommitOutcome};
use crate::model::{CarveStatus, CarverKind};
use crate::session::SessionManager;
use crate::store::{CarveStore, MemoryStore};
use carver_storage::StorageBackend;
use carver_types::error::CarveError;

use crate::testutil::{b64, registry, scheduled, FailingBackend, Harness, MemoryBackend, ENV, NODE};

#[test]
fn inline_chunk_keeps_payload_verbatim() {
    let h = Harness::inline(CarverKind::Db);
    let raw = b64(b"hello world");
    let chunk = h
        .pipeline
        .build_chunk(CarverKind::Db, ENV, NODE, "R1", "S1", &raw, 4)
        .unwrap();
    assert_eq!(chunk.data, raw);
    assert_eq!(chunk.size, 11);
    assert_eq!(chunk.sequence, 4);
    assert_eq!(chunk.carver, CarverKind::Db);
    assert!(chunk.deleted_at.is_none());
}

#[test]
fn remote_chunk_stores_reference() {
    let h = Harness::remote(Arc::new(MemoryBackend::new()));
    let chunk = h
        .pipeline
        .build_chunk(CarverKind::S3, ENV, NODE, "R1", "S1", &b64(b"abc"), 2)
        .unwrap();
    assert_eq!(chunk.data, "s3://carves/prod:node-a:S1:2");
    assert_eq!(chunk.size, 3);
}

#[test]
fn undecodable_payload_is_rejected() {
    let h = Harness::inline(CarverKind::Db);
    let err = h
        .pipeline
        .build_chunk(CarverKind::Db, ENV, NODE, "R1", "S1", "%%%", 0)
        .unwrap_err();
    assert!(matches!(err, CarveError::Decoding { .. }), "{err}");
}

#[test]
fn remote_commit_uploads_decoded_bytes() {
    let storage = Arc::new(MemoryBackend::new());
    let h = Harness::remote(storage.clone());
    h.open("C1", "R1", "S1", 1);

    let outcome = h.pipeline.ingest(ENV, "R1", "S1", 0, &b64(b"payload")).unwrap();
    assert_eq!(outcome.commit, CommitOutcome::Stored);
    assert!(outcome.complete);
    assert_eq!(storage.keys(), vec!["prod:node-a:S1:0".to_string()]);

    assert_eq!(storage.get("prod:node-a:S1:0").unwrap().unwrap(), b"payload");
    let rows = h.store.chunks("S1").unwrap();
    assert_eq!(rows[0].data, "s3://carves/prod:node-a:S1:0");
}

#[test]
fn remote_commit_without_store_is_unavailable() {
    let h = Harness::inline(CarverKind::S3);
    h.open("C1", "R1", "S1", 1);

    let err = h.pipeline.ingest(ENV, "R1", "S1", 0, &b64(b"data")).unwrap_err();
    assert!(matches!(err, CarveError::BackendUnavailable(_)), "{err}");
    assert!(h.store.chunks("S1").unwrap().is_empty());
    assert_eq!(h.sessions.get("C1").unwrap().completed_blocks, 0);
}

#[test]
fn failed_upload_is_lost_not_fatal() {
    let h = Harness::remote(Arc::new(FailingBackend));
    h.open("C1", "R1", "S1", 2);

    let outcome = h.pipeline.ingest(ENV, "R1", "S1", 0, &b64(b"a")).unwrap();
    assert_eq!(outcome.commit, CommitOutcome::Lost);
    assert!(!outcome.complete);
    assert!(h.store.chunks("S1").unwrap().is_empty());
    assert_eq!(h.sessions.get("C1").unwrap().completed_blocks, 0);
}

#[test]
fn duplicate_chunk_is_not_counted_twice() {
    let h = Harness::inline(CarverKind::Db);
    h.open("C1", "R1", "S1", 2);

    let first = h.pipeline.ingest(ENV, "R1", "S1", 0, &b64(b"a")).unwrap();
    assert_eq!(first.commit, CommitOutcome::Stored);
    assert_eq!(first.completed_blocks, 1);

    let again = h.pipeline.ingest(ENV, "R1", "S1", 0, &b64(b"a")).unwrap();
    assert_eq!(again.commit, CommitOutcome::Duplicate);
    assert_eq!(again.completed_blocks, 1);
    assert!(!again.complete);
    assert_eq!(h.store.chunks("S1").unwrap().len(), 1);
}

#[test]
fn forged_session_rejected_before_storage() {
    let h = Harness::inline(CarverKind::Db);
    h.open("C1", "R1", "S1", 1);
    h.open("C2", "R2", "S2", 1);

    let err = h.pipeline.ingest(ENV, "R1", "S2", 0, &b64(b"x")).unwrap_err();
    assert!(matches!(err, CarveError::OwnershipMismatch { .. }), "{err}");
    assert!(h.store.chunks("S2").unwrap().is_empty());
    assert_eq!(h.sessions.get("C2").unwrap().completed_blocks, 0);
}

#[test]
fn wrong_environment_rejected() {
    let h = Harness::inline(CarverKind::Db);
    h.open("C1", "R1", "S1", 1);
    let err = h.pipeline.ingest("dev", "R1", "S1", 0, &b64(b"x")).unwrap_err();
    assert!(matches!(err, CarveError::EnvironmentMismatch { .. }), "{err}");
    assert!(h.store.chunks("S1").unwrap().is_empty());
}

#[test]
fn out_of_range_sequence_rejected() {
    let h = Harness::inline(CarverKind::Db);
    h.open("C1", "R1", "S1", 2);
    match h.pipeline.ingest(ENV, "R1", "S1", 2, &b64(b"x")) {
        Err(CarveError::SequenceOutOfRange {
            session_id,
            sequence,
            total,
        }) => {
            assert_eq!(session_id, "S1");
            assert_eq!(sequence, 2);
            assert_eq!(total, 2);
        }
        other => panic!("expected SequenceOutOfRange, got {other:?}"),
    }
    assert!(h.store.chunks("S1").unwrap().is_empty());
}

#[test]
fn last_chunk_flips_to_completed() {
    let h = Harness::inline(CarverKind::Local);
    h.open("C1", "R1", "S1", 3);
    for seq in [2, 0] {
        let outcome = h.pipeline.ingest(ENV, "R1", "S1", seq, &b64(b"x")).unwrap();
        assert!(!outcome.complete);
    }
    assert_eq!(h.sessions.get("C1").unwrap().status, CarveStatus::InProgress);

    let outcome = h.pipeline.ingest(ENV, "R1", "S1", 1, &b64(b"x")).unwrap();
    assert!(outcome.complete);
    let session = h.sessions.get("C1").unwrap();
    assert_eq!(session.status, CarveStatus::Completed);
    assert!(session.completed_at.is_some());
}

#[test]
fn session_backend_wins_over_pipeline_default() {
    // A session bound while the deployment used `db` keeps writing inline.
    let store: Arc<dyn CarveStore> = Arc::new(MemoryStore::new());
    let db_sessions = SessionManager::new(store.clone(), registry(), CarverKind::Db);
    db_sessions.schedule(scheduled("C1", "R1", "/a")).unwrap();
    db_sessions.initialize("R1", 0, 1, 10, "S1").unwrap();

    let s3_sessions = Arc::new(SessionManager::new(store.clone(), registry(), CarverKind::S3));
    let pipeline = ChunkPipeline::new(s3_sessions, Backends::inline(CarverKind::S3));
    let outcome = pipeline.ingest(ENV, "R1", "S1", 0, &b64(b"x")).unwrap();
    assert_eq!(outcome.commit, CommitOutcome::Stored);
    assert_eq!(store.chunks("S1").unwrap()[0].carver, CarverKind::Db);
}
