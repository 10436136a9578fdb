use nabla_forge::config::{ForgeConfig, SandboxConfig};
use nabla_forge::core::{BuildRequest, FlashRequest, FlashStage};
use nabla_forge::jobs::{ForgeJob, JobManager, JobStatus};
use nabla_forge::orchestrator::OperationKind;
use nabla_forge::Orchestrator;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn offline_orchestrator() -> Arc<Orchestrator> {
    let mut config = ForgeConfig::default();
    config.local_probe.enabled = false;
    Arc::new(Orchestrator::new(config))
}

/// Container runtime whose `run` blocks until killed.
fn hanging_runtime(tools: &Path) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
echo "$*" >> "{calls}"
case "$1" in
  images) echo "4f2a7c1d9e3b"; exit 0 ;;
  run) exec sleep 30 ;;
esac
exit 0
"#,
        calls = tools.join("calls.log").display()
    );
    let path = tools.join("fake-docker");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn calls(tools: &Path) -> String {
    fs::read_to_string(tools.join("calls.log")).unwrap_or_default()
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_finished(manager: &JobManager, job_id: &Uuid) -> ForgeJob {
    for _ in 0..200 {
        let job = manager.get_job(job_id).unwrap();
        if job.status.is_finished() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never finished", job_id);
}

#[tokio::test]
async fn test_submit_and_update_job() {
    let manager = JobManager::new();
    let job_id = manager.submit_job(ForgeJob::new(OperationKind::Build, None));

    let job = manager.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.started_at.is_none());

    assert_ok!(manager.update_job(&job_id, |job| job.start()));
    assert_eq!(manager.get_job(&job_id).unwrap().status, JobStatus::Running);

    manager
        .update_job(&job_id, |job| job.complete(serde_json::json!({ "success": true })))
        .unwrap();
    let job = manager.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert_eq!(job.result.unwrap()["success"], true);

    assert_err!(manager.update_job(&Uuid::new_v4(), |job| job.start()));
}

#[tokio::test]
async fn test_failed_operation_marks_job_failed() {
    let manager = JobManager::new();
    let orchestrator = offline_orchestrator();
    let workspace = TempDir::new().unwrap();
    std::fs::write(workspace.path().join("app.bin"), [0u8; 16]).unwrap();

    let mut request = FlashRequest::new(workspace.path());
    request.firmware_path = Some("app.bin".into());
    let job_id = manager.spawn(OperationKind::Flash, Some(workspace.path().to_path_buf()), async move {
        orchestrator.flash(request).await
    });

    let job = wait_finished(&manager, &job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.kind, OperationKind::Flash);
    assert_eq!(job.error.as_deref(), Some("no programmer backend available"));
    let result = job.result.unwrap();
    assert_eq!(result["success"], false);
    assert_eq!(result["failed_stage"], serde_json::json!(FlashStage::Connecting));
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let manager = JobManager::new();
    let orchestrator = offline_orchestrator();
    let job_id = manager.spawn(OperationKind::Detect, None, async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        orchestrator.detect_target(Default::default()).await
    });

    assert!(manager.cancel_job(&job_id).unwrap());
    let job = manager.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error.as_deref(), Some("Job cancelled"));

    // An aborted task never overwrites the cancelled state.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get_job(&job_id).unwrap().status, JobStatus::Cancelled);

    assert!(!manager.cancel_job(&job_id).unwrap());
    assert_err!(manager.cancel_job(&Uuid::new_v4()));
}

#[tokio::test]
async fn test_list_and_cleanup_jobs() {
    let manager = JobManager::new();
    let finished = manager.submit_job(ForgeJob::new(OperationKind::Build, None));
    let pending = manager.submit_job(ForgeJob::new(OperationKind::Flash, None));
    assert_eq!(manager.list_jobs().len(), 2);

    manager
        .update_job(&finished, |job| {
            job.fail("build failed".to_string(), None);
            job.completed_at = job.completed_at.map(|t| t - 7200);
        })
        .unwrap();

    assert_eq!(manager.cleanup_completed_jobs(3600), 1);
    let remaining = manager.list_jobs();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, pending);
    assert_eq!(manager.cleanup_completed_jobs(3600), 0);
}

#[tokio::test]
async fn test_cancelled_build_kills_container_and_releases_gate() {
    let tools = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();
    fs::write(workspace.path().join("Makefile"), "all:\n\t@echo building\n").unwrap();

    let mut config = ForgeConfig::default();
    config.local_probe.enabled = false;
    config.sandbox = SandboxConfig {
        runtime: hanging_runtime(tools.path()),
        ..SandboxConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(config));
    let manager = JobManager::new();

    let build = {
        let orchestrator = orchestrator.clone();
        let request = BuildRequest::new(workspace.path());
        manager.spawn(OperationKind::Build, Some(workspace.path().to_path_buf()), async move {
            orchestrator.build(request).await
        })
    };
    assert!(wait_for(|| calls(tools.path()).contains("run --rm --name forge-build-")).await);
    assert_eq!(manager.get_job(&build).unwrap().status, JobStatus::Running);

    let detect = {
        let orchestrator = orchestrator.clone();
        manager.spawn(OperationKind::Detect, None, async move {
            orchestrator.detect_target(Default::default()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let waiting = manager.get_job(&detect).unwrap();
    assert_eq!(waiting.status, JobStatus::Queued);
    assert!(waiting.started_at.is_none());

    assert!(manager.cancel_job(&build).unwrap());

    let detected = wait_finished(&manager, &detect).await;
    assert_eq!(detected.status, JobStatus::Failed);
    assert!(detected.started_at.is_some());

    let log = calls(tools.path());
    let container = log
        .split_whitespace()
        .find(|word| word.starts_with("forge-build-"))
        .unwrap()
        .to_string();
    assert!(wait_for(|| calls(tools.path()).contains(&format!("kill {}", container))).await);
    assert!(!orchestrator.status().busy);
}
