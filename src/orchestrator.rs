//! Composes the executor, classifier and programmer backends into the four
//! public operations. Operations never return `Err`; every failure is folded
//! into the result with an error code and a non-empty message.

use crate::backend::{FlashOptions, FlashProgress, ProgrammerBackend};
use crate::config::ForgeConfig;
use crate::core::{
    BackendStatus, BuildAndFlashRequest, BuildAndFlashResult, BuildRequest, BuildResult, BuildSystem,
    ClassifyReport, DetectRequest, DetectResult, EnvironmentReport, FamilySource, FlashRequest, FlashResult,
    FlashStage, PipelineStage, RouterHealthReport, Severity, TargetInfo,
};
use crate::detection::manifest_path;
use crate::diagnostics::{self, format_diagnostic};
use crate::error::{ForgeError, ForgeResult};
use crate::execution::{SandboxExecutor, SandboxJob};
use crate::firmware::{resolve_firmware_path, FirmwareImage};
use crate::jobs;
use crate::router::BackendRouter;
use crate::targets::McuFamily;
use parking_lot::RwLock;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

pub const JOBS_RANGE: RangeInclusive<u32> = 1..=32;
pub const BUILD_TIMEOUT_RANGE: RangeInclusive<u64> = 10..=3600;
pub const LOG_TAIL_KB_RANGE: RangeInclusive<u32> = 1..=1024;
pub const FLASH_TIMEOUT_RANGE: RangeInclusive<u64> = 5..=1800;
pub const DETECT_TIMEOUT_RANGE: RangeInclusive<u64> = 1..=120;

const ARTIFACT_EXTENSIONS: [&str; 4] = ["elf", "hex", "bin", "map"];

/// Slack on top of a flash timeout so the backend's own timeout fires first
/// and reports the driver output.
const FLASH_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Build,
    Detect,
    Flash,
    BuildAndFlash,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub busy: bool,
    pub operation: Option<OperationKind>,
    pub stage: FlashStage,
    pub progress: Option<FlashProgress>,
    pub last_message: Option<String>,
    pub completed_operations: u64,
}

impl Default for OrchestratorStatus {
    fn default() -> Self {
        Self {
            busy: false,
            operation: None,
            stage: FlashStage::Idle,
            progress: None,
            last_message: None,
            completed_operations: 0,
        }
    }
}

/// Holds the operation gate; clears the busy flag when dropped, including
/// when the operation's future is cancelled.
struct ActiveOperation<'a> {
    status: &'a RwLock<OrchestratorStatus>,
    _gate: MutexGuard<'a, ()>,
}

impl Drop for ActiveOperation<'_> {
    fn drop(&mut self) {
        let mut status = self.status.write();
        status.busy = false;
        status.operation = None;
        status.completed_operations += 1;
    }
}

pub struct Orchestrator {
    config: ForgeConfig,
    executor: SandboxExecutor,
    router: Arc<BackendRouter>,
    gate: Mutex<()>,
    status: RwLock<OrchestratorStatus>,
}

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, value: T, range: &RangeInclusive<T>) -> ForgeResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ForgeError::validation(format!(
            "{} must be {}-{}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Last `max_bytes` of `text`, starting on a character boundary.
pub fn log_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn is_plain_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl Orchestrator {
    pub fn new(config: ForgeConfig) -> Self {
        let router = Arc::new(BackendRouter::from_config(&config));
        Self::with_router(config, router)
    }

    pub fn with_router(config: ForgeConfig, router: Arc<BackendRouter>) -> Self {
        let executor = SandboxExecutor::new(config.sandbox.clone());
        Self {
            config,
            executor,
            router,
            gate: Mutex::new(()),
            status: RwLock::new(OrchestratorStatus::default()),
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    /// Snapshot of the running operation. Never waits on it.
    pub fn status(&self) -> OrchestratorStatus {
        self.status.read().clone()
    }

    async fn begin(&self, operation: OperationKind) -> ActiveOperation<'_> {
        let gate = self.gate.lock().await;
        {
            let mut status = self.status.write();
            status.busy = true;
            status.operation = Some(operation);
            status.stage = FlashStage::Idle;
            status.progress = None;
        }
        tracing::info!("Starting {:?}", operation);
        jobs::mark_started();
        ActiveOperation {
            status: &self.status,
            _gate: gate,
        }
    }

    fn set_stage(&self, stage: FlashStage) {
        tracing::info!("Flash stage -> {}", stage);
        self.status.write().stage = stage;
    }

    fn record(&self, message: &str) {
        self.status.write().last_message = Some(message.to_string());
    }

    async fn validate_workspace(&self, workspace: &Path) -> ForgeResult<PathBuf> {
        let resolved = fs::canonicalize(workspace)
            .await
            .map_err(|_| ForgeError::validation(format!("workspace does not exist: {}", workspace.display())))?;
        let meta = fs::metadata(&resolved).await?;
        if !meta.is_dir() {
            return Err(ForgeError::validation(format!(
                "workspace is not a directory: {}",
                workspace.display()
            )));
        }
        if self.config.allowed_roots.is_empty() {
            return Ok(resolved);
        }
        for root in &self.config.allowed_roots {
            let root = fs::canonicalize(root).await.unwrap_or_else(|_| root.clone());
            if resolved.starts_with(&root) {
                return Ok(resolved);
            }
        }
        Err(ForgeError::validation(format!(
            "workspace {} is outside the allowed roots",
            resolved.display()
        )))
    }

    async fn validate_build(&self, request: &BuildRequest) -> ForgeResult<(PathBuf, BuildSystem)> {
        check_range("jobs", request.jobs, &JOBS_RANGE)?;
        check_range("timeout_sec", request.timeout_sec, &BUILD_TIMEOUT_RANGE)?;
        check_range("log_tail_kb", request.log_tail_kb, &LOG_TAIL_KB_RANGE)?;
        if request.make_target.trim().is_empty() || request.make_target.contains(char::is_whitespace) {
            return Err(ForgeError::validation("make_target must be a single non-empty word"));
        }

        let workspace = self.validate_workspace(&request.workspace).await?;
        let project = match request.project_subdir.as_deref().filter(|s| !s.is_empty()) {
            Some(subdir) if !is_plain_relative(subdir) => {
                return Err(ForgeError::validation(format!(
                    "project_subdir must be a relative path inside the workspace: {}",
                    subdir
                )))
            }
            Some(subdir) => workspace.join(subdir),
            None => workspace.clone(),
        };
        match manifest_path(&project).await {
            Some((system, manifest)) => {
                tracing::debug!("Found {:?} manifest {:?}", system, manifest);
                Ok((workspace, system))
            }
            None => Err(ForgeError::validation(format!(
                "no Makefile or CMakeLists.txt in {}",
                project.display()
            ))),
        }
    }

    // ---- build -------------------------------------------------------

    pub async fn build(&self, request: BuildRequest) -> BuildResult {
        let _op = self.begin(OperationKind::Build).await;
        let result = self.run_build(&request).await;
        self.record(&result.message);
        result
    }

    async fn run_build(&self, request: &BuildRequest) -> BuildResult {
        let start = Instant::now();
        match self.try_build(request, start).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!("Build rejected: {}", err);
                BuildResult::failed(request, &err, elapsed_ms(start))
            }
        }
    }

    async fn try_build(&self, request: &BuildRequest, start: Instant) -> ForgeResult<BuildResult> {
        let (workspace, build_system) = self.validate_build(request).await?;

        let source = self.executor.ensure_image().await?;
        tracing::debug!("Toolchain image {} ({:?})", self.executor.image(), source);

        let output_dir = workspace.join("out");
        let job = SandboxJob {
            workspace: workspace.clone(),
            output_dir: output_dir.clone(),
            project_subdir: request.project_subdir.clone().filter(|s| !s.is_empty()),
            clean: request.clean,
            jobs: request.jobs,
            make_target: request.make_target.clone(),
            timeout: Duration::from_secs(request.timeout_sec),
        };
        let output = self.executor.run(&job).await?;

        let log = match &output.log_path {
            Some(path) => fs::read(path)
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default(),
            None => String::new(),
        };

        let mut parse_text = log.clone();
        if parse_text.trim().is_empty() || !output.success() {
            parse_text.push('\n');
            parse_text.push_str(&output.stderr);
        }
        let diagnostics = diagnostics::classify(&parse_text, Some(&workspace));
        let summary = diagnostics::summarize(&diagnostics);

        let tail_source = if log.is_empty() {
            format!("{}{}", output.stdout, output.stderr)
        } else {
            log
        };
        let tail = log_tail(&tail_source, request.log_tail_kb as usize * 1024);
        let artifacts = collect_artifacts(&workspace, &output_dir.join("artifacts")).await;

        let success = output.success();
        let (message, error_code) = if output.timed_out {
            let err = ForgeError::Timeout {
                operation: "build".to_string(),
                timeout: job.timeout,
                output: String::new(),
            };
            (err.to_string(), Some(err.code()))
        } else if success {
            (
                format!(
                    "Build succeeded in {:.1}s with {} artifact(s), {} warning(s)",
                    start.elapsed().as_secs_f64(),
                    artifacts.len(),
                    summary.warnings
                ),
                None,
            )
        } else {
            let first = diagnostics
                .iter()
                .find(|d| d.severity == Severity::Error)
                .map(|d| format!(": {}", format_diagnostic(d)))
                .unwrap_or_default();
            let err = ForgeError::Execution(format!(
                "build exited with {:?}, {} error(s){}",
                output.exit_code, summary.errors, first
            ));
            (err.to_string(), Some(err.code()))
        };

        tracing::info!("{}", message);
        Ok(BuildResult {
            success,
            exit_code: output.exit_code,
            workspace,
            output_dir,
            build_system: Some(build_system),
            artifacts,
            diagnostics,
            summary,
            log_tail: tail,
            duration_ms: elapsed_ms(start),
            timed_out: output.timed_out,
            message,
            error_code,
        })
    }

    // ---- detect ------------------------------------------------------

    pub async fn detect_target(&self, request: DetectRequest) -> DetectResult {
        let _op = self.begin(OperationKind::Detect).await;
        let result = self.run_detect(&request).await;
        self.record(&result.message);
        result
    }

    async fn run_detect(&self, request: &DetectRequest) -> DetectResult {
        let failed = |err: ForgeError, backend: Option<&Arc<dyn ProgrammerBackend>>| DetectResult {
            success: false,
            detected: false,
            target: None,
            backend: backend.map(|b| b.kind()),
            backend_name: backend.map(|b| b.name().to_string()),
            message: err.to_string(),
            error_code: Some(err.code()),
        };

        if let Err(err) = check_range("timeout_sec", request.timeout_sec, &DETECT_TIMEOUT_RANGE) {
            return failed(err, None);
        }
        self.set_stage(FlashStage::Connecting);
        let Some(backend) = self.router.select_best(request.policy).await else {
            return failed(ForgeError::NoBackendAvailable, None);
        };

        let timeout = Duration::from_secs(request.timeout_sec);
        let attempt = async {
            backend.connect().await?;
            self.set_stage(FlashStage::Detecting);
            backend.detect_target().await
        };
        let target = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(target)) => target,
            Ok(Err(err)) => return failed(err, Some(&backend)),
            Err(_) => {
                let err = ForgeError::Timeout {
                    operation: "target detection".to_string(),
                    timeout,
                    output: String::new(),
                };
                return failed(err, Some(&backend));
            }
        };
        self.set_stage(FlashStage::Done);

        let detected = target.connected && target.device_id.is_some();
        let message = match (&target.device_id, target.connected) {
            (Some(id), _) => format!("Detected {} ({}) via {}", target.name, id, backend.name()),
            (None, true) => "Probe connected but no target identifier was read; check target power and wiring".to_string(),
            (None, false) => "No target detected; check the probe connection".to_string(),
        };
        DetectResult {
            success: true,
            detected,
            target: Some(target),
            backend: Some(backend.kind()),
            backend_name: Some(backend.name().to_string()),
            message,
            error_code: None,
        }
    }

    // ---- flash -------------------------------------------------------

    pub async fn flash(&self, request: FlashRequest) -> FlashResult {
        let _op = self.begin(OperationKind::Flash).await;
        let result = self.run_flash(&request).await;
        self.record(&result.message);
        result
    }

    async fn run_flash(&self, request: &FlashRequest) -> FlashResult {
        let start = Instant::now();
        let mut result = FlashResult {
            success: false,
            device_id: None,
            target: None,
            firmware: None,
            bytes: 0,
            message: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            backend: None,
            backend_name: None,
            stage: FlashStage::Idle,
            failed_stage: None,
            error_code: None,
            retryable: false,
        };
        if let Err(err) = self.try_flash(request, &mut result).await {
            let failed_stage = match &err {
                ForgeError::VerificationFailed { .. } => FlashStage::Verifying,
                _ => self.status.read().stage,
            };
            tracing::warn!("Flash failed during {}: {}", failed_stage, err);
            if result.stdout.is_empty() && result.stderr.is_empty() {
                result.stdout = err.raw_output().to_string();
            }
            result.success = false;
            result.message = err.to_string();
            result.error_code = Some(err.code());
            result.retryable = err.is_retryable();
            result.failed_stage = Some(failed_stage);
            result.stage = FlashStage::Error;
            self.set_stage(FlashStage::Error);
        }
        result.duration_ms = elapsed_ms(start);
        result
    }

    async fn try_flash(&self, request: &FlashRequest, result: &mut FlashResult) -> ForgeResult<()> {
        self.set_stage(FlashStage::Idle);
        check_range("timeout_sec", request.timeout_sec, &FLASH_TIMEOUT_RANGE)?;
        let manual_family = match request.target_family.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(name) => Some(
                McuFamily::parse(name)
                    .ok_or_else(|| ForgeError::validation(format!("unknown target family: {}", name)))?,
            ),
            None => None,
        };
        let workspace = self.validate_workspace(&request.workspace).await?;
        let firmware_path = resolve_firmware_path(&workspace, request.firmware_path.as_deref()).await?;
        let image = FirmwareImage::load(&firmware_path).await?;
        result.firmware = Some(firmware_path.clone());
        result.bytes = image.len();

        self.set_stage(FlashStage::Connecting);
        let backend = self
            .router
            .select_best(request.policy)
            .await
            .ok_or(ForgeError::NoBackendAvailable)?;
        result.backend = Some(backend.kind());
        result.backend_name = Some(backend.name().to_string());
        backend.connect().await?;

        let mut target_profile = None;
        if request.auto_detect {
            self.set_stage(FlashStage::Detecting);
            match backend.detect_target().await {
                Ok(target) => {
                    target_profile = target.target_profile.clone();
                    result.device_id = target.device_id.clone();
                    result.target = Some(target);
                }
                Err(err) => tracing::warn!("Target detection failed, continuing without it: {}", err),
            }
        }
        if target_profile.is_none() {
            if let Some(family) = manual_family {
                target_profile = family.target_profile().map(str::to_string);
                if result.target.is_none() {
                    result.target = Some(TargetInfo {
                        family,
                        family_source: FamilySource::Manual,
                        target_profile: target_profile.clone(),
                        ..TargetInfo::disconnected()
                    });
                }
            }
        }

        let options = FlashOptions {
            target_profile,
            verify: request.verify,
            reset: request.reset,
            timeout: Duration::from_secs(request.timeout_sec),
        };
        self.set_stage(FlashStage::Programming);
        let progress = |event: FlashProgress| {
            tracing::info!("[{}] {}% {}", event.stage, event.percent, event.message);
            let mut status = self.status.write();
            if event.stage != FlashStage::Done {
                status.stage = event.stage;
            }
            status.progress = Some(event);
        };

        tracing::info!(
            "Flashing {} ({} bytes, {:?}) via {}",
            firmware_path.display(),
            image.len(),
            image.format,
            backend.name()
        );
        let outer = options.timeout + FLASH_GRACE;
        let report = match tokio::time::timeout(outer, backend.flash(&image, &options, &progress)).await {
            Ok(report) => report?,
            Err(_) => {
                return Err(ForgeError::Timeout {
                    operation: "flash".to_string(),
                    timeout: outer,
                    output: String::new(),
                })
            }
        };

        self.set_stage(FlashStage::Done);
        result.success = true;
        result.stage = FlashStage::Done;
        result.bytes = report.bytes;
        if report.device_id.is_some() {
            result.device_id = report.device_id;
        }
        result.message = report.message;
        result.stdout = report.stdout;
        result.stderr = report.stderr;
        Ok(())
    }

    // ---- pipeline ----------------------------------------------------

    pub async fn build_and_flash(&self, request: BuildAndFlashRequest) -> BuildAndFlashResult {
        let _op = self.begin(OperationKind::BuildAndFlash).await;
        let build = self.run_build(&request.build).await;
        if !build.success {
            let message = format!("build stage failed: {}", build.message);
            self.record(&message);
            return BuildAndFlashResult {
                success: false,
                failed_stage: Some(PipelineStage::Build),
                build,
                flash: None,
                message,
            };
        }

        let flash = self.run_flash(&request.flash_request()).await;
        let (success, failed_stage, message) = if flash.success {
            (true, None, format!("Built and flashed: {}", flash.message))
        } else {
            (false, Some(PipelineStage::Flash), format!("flash stage failed: {}", flash.message))
        };
        self.record(&message);
        BuildAndFlashResult {
            success,
            failed_stage,
            build,
            flash: Some(flash),
            message,
        }
    }

    // ---- queries -----------------------------------------------------

    pub async fn list_backends(&self) -> Vec<BackendStatus> {
        self.router.list_all().await
    }

    pub async fn health_check(&self) -> RouterHealthReport {
        self.router.health_check().await
    }

    pub async fn check_environment(&self) -> EnvironmentReport {
        let runtime_available = self.executor.runtime_available().await;
        let runtime_version = self.executor.runtime_version().await.unwrap_or_default();
        let image_available = runtime_available && self.executor.image_available().await;
        let image = self.executor.image().to_string();
        let hint = if !runtime_available {
            Some(format!(
                "container runtime '{}' not found or not running",
                self.config.sandbox.runtime.display()
            ))
        } else if !image_available {
            Some(format!("run: {} pull {}", self.config.sandbox.runtime.display(), image))
        } else {
            None
        };
        EnvironmentReport {
            ready: runtime_available && image_available,
            runtime_available,
            runtime_version,
            image_available,
            image,
            hint,
        }
    }

    /// Pure; does not take the operation gate.
    pub fn classify_log(&self, log: &str, workspace: Option<&Path>) -> ClassifyReport {
        let diagnostics = diagnostics::classify(log, workspace);
        ClassifyReport {
            total: diagnostics.len(),
            summary: diagnostics::summarize(&diagnostics),
            formatted: diagnostics.iter().map(format_diagnostic).collect(),
            diagnostics,
        }
    }
}

async fn collect_artifacts(workspace: &Path, dir: &Path) -> Vec<String> {
    let mut artifacts = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return artifacts;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let wanted = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| ARTIFACT_EXTENSIONS.contains(&e));
        let is_file = entry.metadata().await.map(|m| m.is_file()).unwrap_or(false);
        if wanted && is_file {
            let shown = path.strip_prefix(workspace).unwrap_or(&path);
            artifacts.push(shown.display().to_string());
        }
    }
    artifacts.sort();
    artifacts
}
