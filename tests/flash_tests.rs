use nabla_forge::config::ForgeConfig;
use nabla_forge::core::{BackendKind, FamilySource, FlashRequest, FlashStage, SelectionPolicy};
use nabla_forge::error::ErrorCode;
use nabla_forge::targets::McuFamily;
use nabla_forge::Orchestrator;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fake_driver(dir: &Path, program_body: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
echo "$*" >> "{calls}"
if [ "$1" = "--version" ]; then
  echo "Open On-Chip Debugger 0.12.0" >&2
  exit 0
fi
echo "Info : STLINK V2J37S7 (API v2) VID:PID 0483:3748" >&2
echo "Info : device id = 0x20036410" >&2
case "$*" in
  *program*)
    {program_body}
    ;;
esac
exit 0
"#,
        calls = dir.join("calls.log").display(),
        program_body = program_body
    );
    let path = dir.join("fake-openocd");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn calls(tools: &Path) -> String {
    fs::read_to_string(tools.join("calls.log")).unwrap_or_default()
}

fn workspace_with_firmware() -> TempDir {
    let workspace = TempDir::new().unwrap();
    let artifacts = workspace.path().join("out/artifacts");
    fs::create_dir_all(&artifacts).unwrap();
    fs::write(artifacts.join("blinky.bin"), vec![0xA5u8; 1024]).unwrap();
    workspace
}

fn forge(driver: PathBuf, scratch: &Path) -> Orchestrator {
    let mut config = ForgeConfig::default();
    config.local_probe.driver = driver;
    config.local_probe.scratch_dir = Some(scratch.to_path_buf());
    Orchestrator::new(config)
}

#[tokio::test]
async fn test_no_backend_available_without_spawning() {
    let workspace = workspace_with_firmware();
    let scratch = TempDir::new().unwrap();
    let forge = forge(PathBuf::from("/nonexistent/forge-openocd"), scratch.path());

    let result = forge.flash(FlashRequest::new(workspace.path())).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::NoBackendAvailable));
    assert_eq!(result.failed_stage, Some(FlashStage::Connecting));
    assert_eq!(result.stage, FlashStage::Error);
    assert!(!result.retryable);
    assert!(result.backend.is_none());
    assert!(!result.message.is_empty());
    assert!(result.firmware.unwrap().ends_with("out/artifacts/blinky.bin"));
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);

    let mut remote_only = FlashRequest::new(workspace.path());
    remote_only.policy = Some(SelectionPolicy::RemoteOnly);
    let result = forge.flash(remote_only).await;
    assert_eq!(result.error_code, Some(ErrorCode::NoBackendAvailable));
}

#[tokio::test]
async fn test_validation_happens_before_any_probe_work() {
    let tools = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let forge = forge(fake_driver(tools.path(), "exit 0"), scratch.path());

    let empty = TempDir::new().unwrap();
    let result = forge.flash(FlashRequest::new(empty.path())).await;
    assert_eq!(result.error_code, Some(ErrorCode::ValidationError));
    assert!(result.message.contains("no .hex or .bin"));

    let workspace = workspace_with_firmware();
    let mut request = FlashRequest::new(workspace.path());
    request.timeout_sec = 1;
    assert_eq!(forge.flash(request).await.error_code, Some(ErrorCode::ValidationError));

    let mut request = FlashRequest::new(workspace.path());
    request.target_family = Some("Z9".to_string());
    assert_eq!(forge.flash(request).await.error_code, Some(ErrorCode::ValidationError));

    let mut request = FlashRequest::new(workspace.path());
    request.firmware_path = Some(PathBuf::from("../outside.bin"));
    assert_eq!(forge.flash(request).await.error_code, Some(ErrorCode::ValidationError));

    assert!(calls(tools.path()).is_empty());
}

#[tokio::test]
async fn test_flash_through_local_probe() {
    let tools = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let workspace = workspace_with_firmware();
    let forge = forge(
        fake_driver(
            tools.path(),
            r#"echo "** Programming Finished **" >&2
    echo "** Verified OK **" >&2"#,
        ),
        scratch.path(),
    );

    let result = forge.flash(FlashRequest::new(workspace.path())).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.backend, Some(BackendKind::Local));
    assert_eq!(result.backend_name.as_deref(), Some("local-probe"));
    assert_eq!(result.device_id.as_deref(), Some("0x20036410"));
    assert_eq!(result.target.as_ref().unwrap().name, "STM32F103C8");
    assert_eq!(result.bytes, 1024);
    assert_eq!(result.stage, FlashStage::Done);
    assert_eq!(result.error_code, None);
    assert!(result.stderr.contains("Verified OK"));
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    assert!(calls(tools.path()).contains("-f target/stm32f1x.cfg -c program "));

    let status = forge.status();
    assert!(!status.busy);
    assert_eq!(status.stage, FlashStage::Done);
    assert_eq!(status.completed_operations, 1);
    assert_eq!(status.last_message.as_deref(), Some(result.message.as_str()));
    let progress = status.progress.unwrap();
    assert_eq!(progress.stage, FlashStage::Done);
    assert_eq!(progress.percent, 100);
}

#[tokio::test]
async fn test_status_reports_progress_during_flash() {
    let tools = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let workspace = workspace_with_firmware();
    let forge = Arc::new(forge(
        fake_driver(
            tools.path(),
            r#"sleep 1
    echo "** Verified OK **" >&2"#,
        ),
        scratch.path(),
    ));

    let flashing = {
        let forge = forge.clone();
        let request = FlashRequest::new(workspace.path());
        tokio::spawn(async move { forge.flash(request).await })
    };

    let mut seen = Vec::new();
    while !flashing.is_finished() {
        let status = forge.status();
        if status.busy {
            seen.push((status.stage, status.progress.map(|p| p.stage)));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let result = flashing.await.unwrap();

    assert!(result.success, "{}", result.message);
    assert!(
        seen.contains(&(FlashStage::Programming, Some(FlashStage::Programming))),
        "observed {:?}",
        seen
    );
    assert!(!forge.status().busy);
}

#[tokio::test]
async fn test_manual_family_selects_profile() {
    let tools = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let workspace = workspace_with_firmware();
    let forge = forge(
        fake_driver(tools.path(), r#"echo "** Verified OK **" >&2"#),
        scratch.path(),
    );

    let mut request = FlashRequest::new(workspace.path());
    request.auto_detect = false;
    request.target_family = Some("f4".to_string());
    let result = forge.flash(request).await;

    assert!(result.success, "{}", result.message);
    let target = result.target.unwrap();
    assert_eq!(target.family, McuFamily::F4);
    assert_eq!(target.family_source, FamilySource::Manual);
    assert!(calls(tools.path()).contains("-f target/stm32f4x.cfg -c program "));
}

#[tokio::test]
async fn test_verification_failure_reports_its_stage() {
    let tools = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let workspace = workspace_with_firmware();
    let forge = forge(
        fake_driver(tools.path(), r#"echo "** Programming Finished **" >&2"#),
        scratch.path(),
    );

    let result = forge.flash(FlashRequest::new(workspace.path())).await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::ProgrammingVerificationFailure));
    assert_eq!(result.failed_stage, Some(FlashStage::Verifying));
    assert!(result.stdout.contains("Programming Finished"));
    assert!(result.retryable);
    let status = forge.status();
    assert_eq!(status.stage, FlashStage::Error);
    assert_eq!(status.progress.unwrap().stage, FlashStage::Verifying);
}

#[tokio::test]
async fn test_detect_target_through_router() {
    let tools = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let forge = forge(fake_driver(tools.path(), "exit 0"), scratch.path());

    let result = forge.detect_target(Default::default()).await;
    assert!(result.success, "{}", result.message);
    assert!(result.detected);
    assert_eq!(result.backend, Some(BackendKind::Local));
    assert_eq!(result.target.unwrap().family, McuFamily::F1);

    let missing = forge_without_probe();
    let result = missing.detect_target(Default::default()).await;
    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::NoBackendAvailable));

    let listed = forge.list_backends().await;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].available);
    assert_eq!(listed[0].endpoint, "usb:stlink");

    let health = forge.health_check().await;
    assert!(health.local_available);
    assert_eq!(health.targets_detected, 1);
}

fn forge_without_probe() -> Orchestrator {
    let mut config = ForgeConfig::default();
    config.local_probe.enabled = false;
    Orchestrator::new(config)
}
