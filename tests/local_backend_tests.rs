use nabla_forge::backend::{FlashOptions, FlashProgress, LocalProbeBackend, ProgrammerBackend};
use nabla_forge::config::LocalProbeConfig;
use nabla_forge::core::FlashStage;
use nabla_forge::error::{ErrorCode, ForgeError};
use nabla_forge::firmware::FirmwareImage;
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PROGRAM_OK: &str = r#"echo "** Programming Started **" >&2
    echo "** Programming Finished **" >&2
    echo "** Verify Started **" >&2
    echo "** Verified OK **" >&2
    echo "** Resetting Target **" >&2"#;

/// Probe driver stand-in: logs its arguments, reports an attached probe and
/// a device id, and runs `program_body` for `program` commands.
fn fake_driver(dir: &Path, id_line: &str, program_body: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
echo "$*" >> "{calls}"
if [ "$1" = "--version" ]; then
  echo "Open On-Chip Debugger 0.12.0" >&2
  exit 0
fi
echo "Info : clock speed 1000 kHz" >&2
echo "Info : STLINK V2J37S7 (API v2) VID:PID 0483:3748" >&2
{id_line}
case "$*" in
  *program*)
    {program_body}
    ;;
esac
exit 0
"#,
        calls = dir.join("calls.log").display(),
        id_line = id_line,
        program_body = program_body
    );
    let path = dir.join("fake-openocd");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

const F103_ID: &str = r#"echo "Info : device id = 0x20036410" >&2"#;

struct Rig {
    tools: TempDir,
    scratch: TempDir,
    backend: Arc<LocalProbeBackend>,
}

impl Rig {
    fn new(id_line: &str, program_body: &str) -> Self {
        let tools = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let driver = fake_driver(tools.path(), id_line, program_body);
        let backend = Arc::new(LocalProbeBackend::new(LocalProbeConfig {
            driver,
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..LocalProbeConfig::default()
        }));
        Self { tools, scratch, backend }
    }

    fn calls(&self) -> String {
        fs::read_to_string(self.tools.path().join("calls.log")).unwrap_or_default()
    }

    fn scratch_files(&self) -> usize {
        fs::read_dir(self.scratch.path()).unwrap().count()
    }
}

fn binary_image() -> FirmwareImage {
    FirmwareImage::from_bytes((0u8..=255).cycle().take(2048).collect())
}

#[tokio::test]
async fn test_available_and_detects_target() {
    let rig = Rig::new(F103_ID, PROGRAM_OK);
    assert!(rig.backend.is_available().await);
    rig.backend.connect().await.unwrap();

    let target = rig.backend.detect_target().await.unwrap();
    assert!(target.connected);
    assert_eq!(target.device_id.as_deref(), Some("0x20036410"));
    assert_eq!(target.name, "STM32F103C8");
    assert_eq!(target.target_profile.as_deref(), Some("stm32f1x"));

    let calls = rig.calls();
    assert!(calls.contains("--version"));
    assert!(calls.contains("-f interface/stlink.cfg -f target/stm32f1x.cfg -c init -c exit"));
}

#[tokio::test]
async fn test_probe_without_device_id() {
    let rig = Rig::new("", PROGRAM_OK);
    let target = rig.backend.detect_target().await.unwrap();
    assert!(target.connected);
    assert!(target.device_id.is_none());
}

#[tokio::test]
async fn test_flash_verifies_and_removes_scratch_file() {
    let rig = Rig::new(F103_ID, PROGRAM_OK);
    let events: Arc<Mutex<Vec<FlashProgress>>> = Arc::default();
    let sink = events.clone();
    let progress = move |event: FlashProgress| sink.lock().push(event);

    let report = rig
        .backend
        .flash(&binary_image(), &FlashOptions::default(), &progress)
        .await
        .unwrap();

    assert!(report.verified);
    assert_eq!(report.bytes, 2048);
    assert_eq!(report.device_id.as_deref(), Some("0x20036410"));
    assert_eq!(rig.scratch_files(), 0);

    let calls = rig.calls();
    assert!(calls.contains("-c program "));
    assert!(calls.contains("forge-fw-"));
    assert!(calls.contains(".bin verify reset exit 0x08000000"));

    let stages: Vec<FlashStage> = events.lock().iter().map(|e| e.stage).collect();
    assert_eq!(stages.first(), Some(&FlashStage::Programming));
    assert!(stages.contains(&FlashStage::Verifying));
    assert_eq!(stages.last(), Some(&FlashStage::Done));
}

#[tokio::test]
async fn test_hex_images_keep_their_own_addresses() {
    let rig = Rig::new(F103_ID, PROGRAM_OK);
    let hex = FirmwareImage::from_bytes(b":0400000001020304F2\n:00000001FF\n".to_vec());
    let options = FlashOptions {
        target_profile: Some("stm32f4x".to_string()),
        ..FlashOptions::default()
    };
    rig.backend.flash(&hex, &options, &|_| {}).await.unwrap();

    let calls = rig.calls();
    assert!(calls.contains("-f target/stm32f4x.cfg"));
    assert!(calls.contains(".hex verify reset exit"));
    assert!(!calls.contains("0x08000000"));
}

#[tokio::test]
async fn test_missing_verification_marker() {
    let rig = Rig::new(F103_ID, r#"echo "** Programming Finished **" >&2"#);
    let err = rig
        .backend
        .flash(&binary_image(), &FlashOptions::default(), &|_| {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProgrammingVerificationFailure);
    assert!(err.raw_output().contains("Programming Finished"));
    assert_eq!(rig.scratch_files(), 0);

    // Without verify the same output is a success.
    let options = FlashOptions {
        verify: false,
        ..FlashOptions::default()
    };
    let report = rig.backend.flash(&binary_image(), &options, &|_| {}).await.unwrap();
    assert!(!report.verified);
}

#[tokio::test]
async fn test_driver_failures_are_classified() {
    let rig = Rig::new(
        F103_ID,
        r#"echo "Error: checksum mismatch - attempting binary compare" >&2
    exit 1"#,
    );
    let err = rig
        .backend
        .flash(&binary_image(), &FlashOptions::default(), &|_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::VerificationFailed { .. }));

    let rig = Rig::new(
        F103_ID,
        r#"echo "Error: init mode failed (unable to connect to the target)" >&2
    exit 1"#,
    );
    let err = rig
        .backend
        .flash(&binary_image(), &FlashOptions::default(), &|_| {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeviceCommunicationError);
    assert!(err.raw_output().contains("unable to connect"));
    assert_eq!(rig.scratch_files(), 0);
}

#[tokio::test]
async fn test_flash_timeout_kills_driver_and_cleans_up() {
    let rig = Rig::new(F103_ID, "exec sleep 30");
    let options = FlashOptions {
        timeout: Duration::from_secs(1),
        ..FlashOptions::default()
    };
    let started = std::time::Instant::now();
    let err = rig.backend.flash(&binary_image(), &options, &|_| {}).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ExecutionTimeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.raw_output().contains("STLINK"));
    assert_eq!(rig.scratch_files(), 0);
}

#[tokio::test]
async fn test_concurrent_call_fails_fast_as_busy() {
    let rig = Rig::new(
        F103_ID,
        r#"sleep 2
    echo "** Verified OK **" >&2"#,
    );
    let backend = rig.backend.clone();
    let flashing = tokio::spawn(async move {
        backend
            .flash(&binary_image(), &FlashOptions::default(), &|_| {})
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = rig.backend.detect_target().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::BackendBusy);
    assert!(!rig.backend.is_available().await);

    let report = flashing.await.unwrap().unwrap();
    assert!(report.verified);
    assert!(rig.backend.detect_target().await.is_ok());
}

#[tokio::test]
async fn test_reset_sequence() {
    let rig = Rig::new(F103_ID, PROGRAM_OK);
    rig.backend.reset().await.unwrap();
    assert!(rig.calls().contains("-c init -c reset -c exit"));
}

#[tokio::test]
async fn test_disabled_probe_is_never_available() {
    let rig = Rig::new(F103_ID, PROGRAM_OK);
    let backend = LocalProbeBackend::new(LocalProbeConfig {
        enabled: false,
        ..rig.backend.config().clone()
    });
    assert!(!backend.is_available().await);
    assert!(rig.calls().is_empty());
}
