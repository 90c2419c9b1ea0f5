//! Tracker tests against the in-memory backend.

use super::*;
use std::sync::Arc;
use tempfile::TempDir;

fn tracker() -> (Arc<InMemoryTrackingBackend>, ExperimentTracker) {
    let backend = Arc::new(InMemoryTrackingBackend::new());
    let tracker = ExperimentTracker::new(backend.clone(), "breast-cancer");
    (backend, tracker)
}

fn artifact() -> ModelArtifact {
    ModelArtifact::new("majority_class", serde_json::json!({ "label": 1 }))
}

// ============================================================================
// Naming
// ============================================================================

#[test]
fn test_canonical_model_name() {
    assert_eq!(canonical_model_name("Nearest Centroid"), "Nearest_Centroid");
    assert_eq!(canonical_model_name("  Random   Forest \t v2 "), "Random_Forest_v2");
    assert_eq!(canonical_model_name("svc"), "svc");
}

#[test]
fn test_model_source_uri() {
    assert_eq!(model_source_uri("abc", "model"), "runs:/abc/model");
    assert_eq!(model_source_uri("abc", "/model/"), "runs:/abc/model");
}

#[test]
fn test_run_status_wire_names() {
    assert_eq!(RunStatus::Finished.to_string(), "FINISHED");
    assert!(RunStatus::Failed.is_terminal());
    assert!(!RunStatus::Running.is_terminal());
    assert_eq!(serde_json::to_string(&RunStatus::Running).unwrap(), "\"RUNNING\"");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_start_and_end_run() {
    let (backend, tracker) = tracker();
    let run = tracker
        .start_run(RunSpec::new("parent").with_tag("owner", "lab"))
        .await
        .unwrap();

    assert_eq!(tracker.status(&run), Some(RunStatus::Running));
    tracker.end_run(&run, RunStatus::Finished).await.unwrap();
    assert_eq!(tracker.status(&run), Some(RunStatus::Finished));

    let recorded = backend.run(&run.run_id).unwrap();
    assert_eq!(recorded.status, RunStatus::Finished);
    assert_eq!(recorded.tags.get("owner").map(String::as_str), Some("lab"));
}

#[tokio::test]
async fn test_experiment_resolved_once() {
    let (backend, tracker) = tracker();
    tracker.start_run(RunSpec::new("a")).await.unwrap();
    tracker.start_run(RunSpec::new("b")).await.unwrap();
    let ensures = backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, TrackingCall::EnsureExperiment(_)))
        .count();
    assert_eq!(ensures, 1);
}

#[tokio::test]
async fn test_nested_run_links_parent() {
    let (backend, tracker) = tracker();
    let parent = tracker.start_run(RunSpec::new("parent")).await.unwrap();
    let child = tracker
        .start_run(RunSpec::new("child").nested_in(&parent))
        .await
        .unwrap();

    assert!(child.is_nested());
    assert_eq!(child.parent_run_id.as_deref(), Some(parent.run_id.as_str()));
    let recorded = backend.run(&child.run_id).unwrap();
    assert_eq!(recorded.tags.get(PARENT_RUN_TAG), Some(&parent.run_id));
}

#[tokio::test]
async fn test_parent_cannot_close_with_open_child() {
    let (_backend, tracker) = tracker();
    let parent = tracker.start_run(RunSpec::new("parent")).await.unwrap();
    let child = tracker
        .start_run(RunSpec::new("child").nested_in(&parent))
        .await
        .unwrap();

    let err = tracker.end_run(&parent, RunStatus::Finished).await.unwrap_err();
    match err {
        TrackingError::OpenChildRuns { run_id, children } => {
            assert_eq!(run_id, parent.run_id);
            assert_eq!(children, vec![child.run_id.clone()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(tracker.status(&parent), Some(RunStatus::Running));

    tracker.end_run(&child, RunStatus::Failed).await.unwrap();
    // Ending a child leaves the parent running.
    assert_eq!(tracker.status(&parent), Some(RunStatus::Running));
    tracker.end_run(&parent, RunStatus::Finished).await.unwrap();
    assert!(tracker.open_runs().is_empty());
}

#[tokio::test]
async fn test_child_of_closed_parent_rejected() {
    let (_backend, tracker) = tracker();
    let parent = tracker.start_run(RunSpec::new("parent")).await.unwrap();
    tracker.end_run(&parent, RunStatus::Finished).await.unwrap();

    let err = tracker
        .start_run(RunSpec::new("late").nested_in(&parent))
        .await
        .unwrap_err();
    assert!(matches!(err, TrackingError::ParentNotActive { .. }));
}

#[tokio::test]
async fn test_double_end_rejected() {
    let (_backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("once")).await.unwrap();
    tracker.end_run(&run, RunStatus::Finished).await.unwrap();
    let err = tracker.end_run(&run, RunStatus::Failed).await.unwrap_err();
    assert!(matches!(err, TrackingError::RunNotActive { .. }));
    assert_eq!(tracker.status(&run), Some(RunStatus::Finished));
}

#[tokio::test]
async fn test_in_run_closes_on_success_and_failure() {
    let (backend, tracker) = tracker();

    let value: Result<u32, TrackingError> = tracker
        .in_run(RunSpec::new("ok"), |run| async move {
            assert!(!run.run_id.is_empty());
            Ok(7)
        })
        .await;
    assert_eq!(value.unwrap(), 7);
    assert_eq!(backend.run_named("ok").unwrap().status, RunStatus::Finished);

    let failed: Result<(), TrackingError> = tracker
        .in_run(RunSpec::new("boom"), |run| async move {
            Err(TrackingError::RunNotActive { run_id: run.run_id })
        })
        .await;
    assert!(failed.is_err());
    assert_eq!(backend.run_named("boom").unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_backend_close_failure_still_detaches_child() {
    let (backend, tracker) = tracker();
    let parent = tracker.start_run(RunSpec::new("parent")).await.unwrap();
    let child = tracker
        .start_run(RunSpec::new("child").nested_in(&parent))
        .await
        .unwrap();
    backend.fail_on("update_run", child.run_id.clone());

    let err = tracker.end_run(&child, RunStatus::Finished).await.unwrap_err();
    assert!(matches!(err, TrackingError::Backend { operation: "update_run", .. }));
    assert_eq!(tracker.status(&child), Some(RunStatus::Finished));

    tracker.end_run(&parent, RunStatus::Finished).await.unwrap();
    assert!(tracker.open_runs().is_empty());
    assert_eq!(backend.run(&parent.run_id).unwrap().status, RunStatus::Finished);
}

#[tokio::test]
async fn test_in_run_failure_closes_open_children() {
    let (backend, tracker) = tracker();

    let failed: Result<(), TrackingError> = tracker
        .in_run(RunSpec::new("outer"), |run| {
            let tracker = &tracker;
            async move {
                tracker
                    .start_run(RunSpec::new("inner").nested_in(&run))
                    .await?;
                Err(TrackingError::RunNotActive { run_id: run.run_id })
            }
        })
        .await;

    assert!(failed.is_err());
    assert!(tracker.open_runs().is_empty());
    assert_eq!(backend.run_named("inner").unwrap().status, RunStatus::Failed);
    assert_eq!(backend.run_named("outer").unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_in_run_success_with_open_child_fails_both() {
    let (backend, tracker) = tracker();

    let result: Result<(), TrackingError> = tracker
        .in_run(RunSpec::new("outer"), |run| {
            let tracker = &tracker;
            async move {
                tracker
                    .start_run(RunSpec::new("inner").nested_in(&run))
                    .await?;
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(TrackingError::OpenChildRuns { .. })));
    assert!(tracker.open_runs().is_empty());
    assert_eq!(backend.run_named("inner").unwrap().status, RunStatus::Failed);
    assert_eq!(backend.run_named("outer").unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_in_run_close_failure_is_reported() {
    let (backend, tracker) = tracker();
    // The first run of a fresh backend is run-0001.
    backend.fail_on("update_run", "run-0001");

    let result: Result<u32, TrackingError> = tracker
        .in_run(RunSpec::new("flaky"), |_run| async move { Ok(1) })
        .await;

    assert!(matches!(result, Err(TrackingError::Backend { operation: "update_run", .. })));
    assert!(tracker.open_runs().is_empty());
}

#[tokio::test]
async fn test_abort_run_closes_descendants_first() {
    let (backend, tracker) = tracker();
    let root = tracker.start_run(RunSpec::new("root")).await.unwrap();
    let mid = tracker
        .start_run(RunSpec::new("mid").nested_in(&root))
        .await
        .unwrap();
    let leaf = tracker
        .start_run(RunSpec::new("leaf").nested_in(&mid))
        .await
        .unwrap();

    tracker.abort_run(&root).await.unwrap();

    assert!(tracker.open_runs().is_empty());
    let closed: Vec<String> = backend
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            TrackingCall::UpdateRun(id, RunStatus::Failed) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(closed, vec![leaf.run_id, mid.run_id, root.run_id.clone()]);

    // Already closed: nothing to do.
    tracker.abort_run(&root).await.unwrap();
}

// ============================================================================
// Logging
// ============================================================================

#[tokio::test]
async fn test_logging_preserves_call_order() {
    let (backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("log")).await.unwrap();

    tracker
        .log_params(&run, [("classifier", "svc"), ("random_seed", "42")])
        .await
        .unwrap();
    tracker.log_metrics(&run, [("val_acc", 0.5)]).await.unwrap();
    tracker.log_metrics(&run, [("val_acc", 0.75)]).await.unwrap();
    tracker.set_tags(&run, [("description", "svc")]).await.unwrap();

    let recorded = backend.run(&run.run_id).unwrap();
    assert_eq!(
        recorded.params,
        vec![
            ("classifier".to_string(), "svc".to_string()),
            ("random_seed".to_string(), "42".to_string())
        ]
    );
    assert_eq!(recorded.metric("val_acc"), Some(0.75));
    assert_eq!(recorded.param("random_seed"), Some("42"));
    assert_eq!(recorded.tags.get("description").map(String::as_str), Some("svc"));
}

#[tokio::test]
async fn test_logging_to_closed_run_rejected() {
    let (_backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("closed")).await.unwrap();
    tracker.end_run(&run, RunStatus::Finished).await.unwrap();

    let err = tracker.log_metrics(&run, [("x", 1.0)]).await.unwrap_err();
    assert!(matches!(err, TrackingError::RunNotActive { .. }));
}

#[tokio::test]
async fn test_log_artifacts_keeps_relative_paths() {
    let (backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("files")).await.unwrap();

    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("plots")).unwrap();
    std::fs::write(dir.path().join("confusion_matrix.csv"), "a,b\n").unwrap();
    std::fs::write(dir.path().join("plots/roc.txt"), "roc").unwrap();

    let written = tracker.log_artifacts(&run, dir.path(), None).await.unwrap();
    assert_eq!(written, vec!["confusion_matrix.csv", "plots/roc.txt"]);

    let recorded = backend.run(&run.run_id).unwrap();
    assert_eq!(recorded.artifacts["plots/roc.txt"], b"roc".to_vec());
}

// ============================================================================
// Models
// ============================================================================

#[tokio::test]
async fn test_log_and_register_model() {
    let (backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("svc")).await.unwrap();

    tracker.log_model(&run, &artifact(), "model").await.unwrap();
    let recorded = backend.run(&run.run_id).unwrap();
    let descriptor = String::from_utf8(recorded.artifacts["model/MLmodel"].clone()).unwrap();
    assert!(descriptor.contains("artifact_path: model"));
    assert!(descriptor.contains("python_function"));
    assert!(recorded.artifacts.contains_key("model/model.json"));

    let registered = tracker
        .register_model(&run, "Majority Class", Some("baseline"), &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(registered.name, "Majority_Class");
    assert_eq!(registered.version, 1);
    assert_eq!(registered.source_uri, format!("runs:/{}/model", run.run_id));
    assert_eq!(registered.tags.get("description").map(String::as_str), Some("baseline"));
    assert_eq!(backend.versions("Majority_Class").len(), 1);
}

#[tokio::test]
async fn test_register_twice_bumps_version() {
    let (backend, tracker) = tracker();
    for _ in 0..2 {
        let run = tracker.start_run(RunSpec::new("svc")).await.unwrap();
        tracker.log_model(&run, &artifact(), "model").await.unwrap();
        tracker
            .register_model(&run, "svc", None, &BTreeMap::new())
            .await
            .unwrap();
        tracker.end_run(&run, RunStatus::Finished).await.unwrap();
    }
    let versions: Vec<u64> = backend.versions("svc").iter().map(|m| m.version).collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_register_without_model_is_rejected() {
    let (_backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("empty")).await.unwrap();
    let err = tracker
        .register_model(&run, "svc", None, &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackingError::NoActiveModelArtifact { .. }));
}

#[tokio::test]
async fn test_register_after_close_is_rejected() {
    let (_backend, tracker) = tracker();
    let run = tracker.start_run(RunSpec::new("closed")).await.unwrap();
    tracker.log_model(&run, &artifact(), "model").await.unwrap();
    tracker.end_run(&run, RunStatus::Finished).await.unwrap();

    let err = tracker
        .register_model(&run, "svc", None, &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TrackingError::NoActiveModelArtifact { .. }));
}

#[tokio::test]
async fn test_backend_failure_surfaces() {
    let (backend, tracker) = tracker();
    backend.fail_on("create_run", "doomed");
    let err = tracker.start_run(RunSpec::new("doomed")).await.unwrap_err();
    assert!(matches!(
        err,
        TrackingError::Backend {
            operation: "create_run",
            ..
        }
    ));
    assert!(tracker.open_runs().is_empty());
}
