use crate::error::{ErrorCode, ForgeError};
use crate::targets::{McuFamily, TargetDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildSystem {
    Makefile,
    CMake,
}

fn default_true() -> bool {
    true
}

fn default_jobs() -> u32 {
    4
}

fn default_make_target() -> String {
    "all".to_string()
}

fn default_build_timeout() -> u64 {
    600
}

fn default_log_tail_kb() -> u32 {
    96
}

fn default_flash_timeout() -> u64 {
    120
}

fn default_detect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub workspace: PathBuf,
    #[serde(default)]
    pub project_subdir: Option<String>,
    #[serde(default = "default_true")]
    pub clean: bool,
    #[serde(default = "default_jobs")]
    pub jobs: u32,
    #[serde(default = "default_make_target")]
    pub make_target: String,
    #[serde(default = "default_build_timeout")]
    pub timeout_sec: u64,
    #[serde(default = "default_log_tail_kb")]
    pub log_tail_kb: u32,
}

impl BuildRequest {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            project_subdir: None,
            clean: true,
            jobs: default_jobs(),
            make_target: default_make_target(),
            timeout_sec: default_build_timeout(),
            log_tail_kb: default_log_tail_kb(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    Compiler,
    Linker,
    BuildSystem,
    Toolchain,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Compiler => write!(f, "compiler"),
            DiagnosticKind::Linker => write!(f, "linker"),
            DiagnosticKind::BuildSystem => write!(f, "build-system"),
            DiagnosticKind::Toolchain => write!(f, "toolchain"),
        }
    }
}

/// Ordered so that sorting puts errors first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    /// Workspace-relative where possible, empty when the line carries no location.
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub total: usize,
    pub errors: usize,
    pub warnings: usize,
    pub notes: usize,
    pub files_affected: usize,
    pub file_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    pub build_system: Option<BuildSystem>,
    /// Workspace-relative paths that existed when the build returned.
    pub artifacts: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: DiagnosticSummary,
    pub log_tail: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub message: String,
    pub error_code: Option<ErrorCode>,
}

impl BuildResult {
    pub(crate) fn failed(request: &BuildRequest, err: &ForgeError, duration_ms: u64) -> Self {
        Self {
            success: false,
            exit_code: None,
            workspace: request.workspace.clone(),
            output_dir: request.workspace.join("out"),
            build_system: None,
            artifacts: Vec::new(),
            diagnostics: Vec::new(),
            summary: DiagnosticSummary::default(),
            log_tail: String::new(),
            duration_ms,
            timed_out: matches!(err, ForgeError::Timeout { .. }),
            message: err.to_string(),
            error_code: Some(err.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashStage {
    Idle,
    Connecting,
    Detecting,
    Programming,
    Verifying,
    Resetting,
    Done,
    Error,
}

impl fmt::Display for FlashStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashStage::Idle => "idle",
            FlashStage::Connecting => "connecting",
            FlashStage::Detecting => "detecting",
            FlashStage::Programming => "programming",
            FlashStage::Verifying => "verifying",
            FlashStage::Resetting => "resetting",
            FlashStage::Done => "done",
            FlashStage::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    PreferLocal,
    PreferRemote,
    LocalOnly,
    RemoteOnly,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::PreferLocal
    }
}

impl std::str::FromStr for SelectionPolicy {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "prefer-local" | "auto" => Ok(SelectionPolicy::PreferLocal),
            "prefer-remote" => Ok(SelectionPolicy::PreferRemote),
            "local-only" | "local" => Ok(SelectionPolicy::LocalOnly),
            "remote-only" | "remote" => Ok(SelectionPolicy::RemoteOnly),
            other => Err(ForgeError::validation(format!("unknown selection policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashRequest {
    pub workspace: PathBuf,
    #[serde(default)]
    pub firmware_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_detect: bool,
    /// Family short name such as "F4", used when auto-detect is off or finds nothing.
    #[serde(default)]
    pub target_family: Option<String>,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_true")]
    pub reset: bool,
    #[serde(default = "default_flash_timeout")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub policy: Option<SelectionPolicy>,
}

impl FlashRequest {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            firmware_path: None,
            auto_detect: true,
            target_family: None,
            verify: true,
            reset: true,
            timeout_sec: default_flash_timeout(),
            policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    #[serde(default = "default_detect_timeout")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub policy: Option<SelectionPolicy>,
}

impl Default for DetectRequest {
    fn default() -> Self {
        Self {
            timeout_sec: default_detect_timeout(),
            policy: None,
        }
    }
}

/// Build options plus the flash options that apply once the build succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAndFlashRequest {
    #[serde(flatten)]
    pub build: BuildRequest,
    #[serde(default)]
    pub firmware_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub auto_detect: bool,
    #[serde(default)]
    pub target_family: Option<String>,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_true")]
    pub reset: bool,
    #[serde(default = "default_flash_timeout")]
    pub flash_timeout_sec: u64,
    #[serde(default)]
    pub policy: Option<SelectionPolicy>,
}

impl BuildAndFlashRequest {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            build: BuildRequest::new(workspace),
            firmware_path: None,
            auto_detect: true,
            target_family: None,
            verify: true,
            reset: true,
            flash_timeout_sec: default_flash_timeout(),
            policy: None,
        }
    }

    pub fn flash_request(&self) -> FlashRequest {
        FlashRequest {
            workspace: self.build.workspace.clone(),
            firmware_path: self.firmware_path.clone(),
            auto_detect: self.auto_detect,
            target_family: self.target_family.clone(),
            verify: self.verify,
            reset: self.reset,
            timeout_sec: self.flash_timeout_sec,
            policy: self.policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub log: String,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyReport {
    pub total: usize,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: DiagnosticSummary,
    pub formatted: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FamilySource {
    Database,
    PrefixFallback,
    BridgePartNumber,
    Manual,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetInfo {
    pub connected: bool,
    pub device_id: Option<String>,
    pub name: String,
    pub family: McuFamily,
    pub family_source: FamilySource,
    pub target_profile: Option<String>,
    pub descriptor: Option<&'static TargetDescriptor>,
}

impl TargetInfo {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            device_id: None,
            name: "Unknown".to_string(),
            family: McuFamily::Unknown,
            family_source: FamilySource::Unknown,
            target_profile: None,
            descriptor: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlashResult {
    pub success: bool,
    pub device_id: Option<String>,
    pub target: Option<TargetInfo>,
    pub firmware: Option<PathBuf>,
    pub bytes: usize,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub backend: Option<BackendKind>,
    pub backend_name: Option<String>,
    pub stage: FlashStage,
    pub failed_stage: Option<FlashStage>,
    pub error_code: Option<ErrorCode>,
    /// Whether the same request may succeed if sent again.
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectResult {
    pub success: bool,
    pub detected: bool,
    pub target: Option<TargetInfo>,
    pub backend: Option<BackendKind>,
    pub backend_name: Option<String>,
    pub message: String,
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub kind: BackendKind,
    pub endpoint: String,
    pub available: bool,
    pub version: Option<String>,
    pub target: Option<TargetInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterHealthReport {
    pub local_available: bool,
    pub remote_configured: usize,
    pub remote_available: usize,
    pub targets_detected: usize,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Build,
    Flash,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildAndFlashResult {
    pub success: bool,
    pub failed_stage: Option<PipelineStage>,
    pub build: BuildResult,
    pub flash: Option<FlashResult>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub ready: bool,
    pub runtime_available: bool,
    pub runtime_version: String,
    pub image_available: bool,
    pub image: String,
    pub hint: Option<String>,
}
