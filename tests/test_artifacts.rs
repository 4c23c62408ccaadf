//! Tests for the artifact store: layout, classification, traversal
//! protection, listing and retention.

use std::time::{Duration, SystemTime};

use qaflow::artifacts::{ArtifactKind, ArtifactStore};
use qaflow::errors::{ArtifactError, OrchestratorError};

#[tokio::test]
async fn create_run_directory_builds_fixed_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    let run_dir = store.create_run_directory("run-1").await.unwrap();
    for sub in ["screenshots", "videos", "logs", "reports"] {
        assert!(run_dir.join(sub).is_dir(), "missing {}", sub);
    }
}

#[tokio::test]
async fn save_artifact_classifies_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();

    let shot = store
        .save_artifact("run-1", "login.png", b"png", None)
        .await
        .unwrap();
    let video = store
        .save_artifact("run-1", "session.webm", b"webm", None)
        .await
        .unwrap();
    let log = store
        .save_artifact("run-1", "console.log", b"line", None)
        .await
        .unwrap();
    let other = store
        .save_artifact("run-1", "trace.bin", b"\x00", None)
        .await
        .unwrap();

    assert_eq!(shot, "screenshots/login.png");
    assert_eq!(video, "videos/session.webm");
    assert_eq!(log, "logs/console.log");
    assert_eq!(other, "trace.bin");

    let forced = store
        .save_artifact("run-1", "capture.raw", b"x", Some(ArtifactKind::Screenshot))
        .await
        .unwrap();
    assert_eq!(forced, "screenshots/capture.raw");

    let bytes = store.get_artifact("run-1", "screenshots/login.png").await.unwrap();
    assert_eq!(bytes, b"png");
}

#[tokio::test]
async fn traversal_outside_run_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();
    store.create_run_directory("run-2").await.unwrap();
    store
        .save_artifact("run-2", "secret.json", b"{}", None)
        .await
        .unwrap();

    for bad in [
        "../../etc/passwd",
        "../run-2/reports/secret.json",
        "reports/../../run-2/reports/secret.json",
        "/etc/passwd",
        "..",
        ".",
    ] {
        let err = store.get_artifact_path("run-1", bad).await.unwrap_err();
        assert!(
            matches!(err, ArtifactError::PathEscape { .. }),
            "expected escape for {}, got {:?}",
            bad,
            err
        );
    }
}

#[tokio::test]
async fn path_escape_maps_to_security_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();

    let err = store.get_artifact("run-1", "../../etc/passwd").await.unwrap_err();
    let err: OrchestratorError = err.into();
    assert!(matches!(err, OrchestratorError::Security(_)));
}

#[tokio::test]
async fn invalid_run_ids_never_touch_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    for bad in ["", "..", "a/b", "run 1", "run\0x"] {
        let err = store.create_run_directory(bad).await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidRunId(_)), "{:?}", bad);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn artifact_names_may_not_contain_directories() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();

    let err = store
        .save_artifact("run-1", "../escape.png", b"x", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ArtifactError::PathEscape { .. }));
}

#[tokio::test]
async fn missing_artifact_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();

    let err = store
        .get_artifact("run-1", "reports/nope.json")
        .await
        .unwrap_err();
    assert!(matches!(err, ArtifactError::NotFound(_)));
}

#[tokio::test]
async fn list_artifacts_skips_state_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();

    store
        .save_json("run-1", "flow_run.json", &serde_json::json!({"state": true}))
        .await
        .unwrap();
    store
        .save_json("run-1", "reports/report.json", &serde_json::json!({"total": 0}))
        .await
        .unwrap();
    store
        .save_artifact("run-1", "home.png", b"png", None)
        .await
        .unwrap();

    let records = store.list_artifacts("run-1").await.unwrap();
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["reports/report.json", "screenshots/home.png"]);
    assert_eq!(records[0].kind, ArtifactKind::Report);
    assert_eq!(records[1].kind, ArtifactKind::Screenshot);
    assert!(records.iter().all(|r| r.run_id == "run-1"));
}

#[tokio::test]
async fn storage_stats_counts_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    for run in ["a", "b"] {
        store.create_run_directory(run).await.unwrap();
        store.save_artifact(run, "shot.png", b"1234", None).await.unwrap();
    }
    store.save_artifact("a", "out.log", b"12", None).await.unwrap();

    let stats = store.storage_stats().await.unwrap();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.files, 3);
    assert_eq!(stats.bytes, 10);
    assert_eq!(stats.by_kind[&ArtifactKind::Screenshot].files, 2);
    assert_eq!(stats.by_kind[&ArtifactKind::Log].bytes, 2);
}

#[tokio::test]
async fn sweep_removes_only_expired_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let old = store.create_run_directory("old-run").await.unwrap();
    store.create_run_directory("fresh-run").await.unwrap();

    let past = SystemTime::now() - Duration::from_secs(30 * 24 * 60 * 60);
    std::fs::File::open(&old).unwrap().set_modified(past).unwrap();

    let removed = store.sweep_expired(14).await.unwrap();
    assert_eq!(removed, vec!["old-run".to_string()]);
    assert!(!old.exists());
    assert!(dir.path().join("fresh-run").exists());
}

#[tokio::test]
async fn delete_run_artifacts_reports_absence() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    store.create_run_directory("run-1").await.unwrap();

    assert!(store.delete_run_artifacts("run-1").await.unwrap());
    assert!(!store.delete_run_artifacts("run-1").await.unwrap());
}
