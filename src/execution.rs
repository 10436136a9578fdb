use crate::config::SandboxConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::process::{run_with_timeout, CapturedOutput};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use uuid::Uuid;

/// Where the workspace appears inside the sandbox: the read-only mount and
/// the scratch copy the driver script builds from.
pub const SANDBOX_MOUNT_POINTS: &[&str] = &["/src", "/work"];

/// Driver script mounted at `/tools/build.sh` inside the container.
pub const BUILD_SCRIPT: &str = include_str!("../scripts/build.sh");

const SCRIPT_DIR: &str = ".forge";
const LOG_FILE: &str = "build.log";

#[derive(Debug, Clone)]
pub struct SandboxJob {
    /// Absolute, already validated workspace root.
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    pub project_subdir: Option<String>,
    pub clean: bool,
    pub jobs: u32,
    pub make_target: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub container: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Persisted build log, when the driver got far enough to write one.
    pub log_path: Option<PathBuf>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Cached,
    Pulled,
}

/// Kills a named container when dropped while still armed. Dropping the
/// `docker run` client alone leaves the container running, so a cancelled
/// build goes through here.
struct ContainerGuard {
    runtime: PathBuf,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: &Path, name: &str) -> Self {
        Self {
            runtime: runtime.to_path_buf(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("Build abandoned, killing container {}", self.name);
        let spawned = std::process::Command::new(&self.runtime)
            .args(["kill", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            // Reaped off the runtime so drop never blocks.
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => tracing::warn!("Failed to kill container {}: {}", self.name, e),
        }
    }
}

/// Runs builds inside a throwaway, network-less container.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn image(&self) -> &str {
        &self.config.image
    }

    fn runtime(&self) -> Command {
        Command::new(&self.config.runtime)
    }

    async fn probe(&self, args: &[&str], timeout: Duration) -> ForgeResult<CapturedOutput> {
        let mut cmd = self.runtime();
        cmd.args(args);
        run_with_timeout(cmd, timeout)
            .await
            .map_err(|e| self.spawn_error(e))
    }

    fn spawn_error(&self, err: io::Error) -> ForgeError {
        if err.kind() == io::ErrorKind::NotFound {
            ForgeError::ToolchainUnavailable(format!(
                "container runtime '{}' is not installed",
                self.config.runtime.display()
            ))
        } else {
            ForgeError::Execution(format!(
                "failed to start '{}': {}",
                self.config.runtime.display(),
                err
            ))
        }
    }

    /// True when the runtime CLI exists and its daemon answers.
    pub async fn runtime_available(&self) -> bool {
        match self.probe(&["info"], self.config.probe_timeout()).await {
            Ok(output) => output.success(),
            Err(e) => {
                tracing::debug!("Container runtime probe failed: {}", e);
                false
            }
        }
    }

    pub async fn runtime_version(&self) -> Option<String> {
        let output = self
            .probe(&["--version"], self.config.probe_timeout())
            .await
            .ok()?;
        let version = output.stdout.trim();
        (output.success() && !version.is_empty()).then(|| version.to_string())
    }

    pub async fn image_available(&self) -> bool {
        match self
            .probe(&["images", "-q", &self.config.image], self.config.probe_timeout())
            .await
        {
            Ok(output) => output.success() && !output.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    pub async fn pull_image(&self) -> ForgeResult<()> {
        tracing::warn!("Toolchain image {} not cached, pulling", self.config.image);
        let output = self
            .probe(&["pull", &self.config.image], self.config.pull_timeout())
            .await?;
        if output.success() {
            tracing::info!("Pulled toolchain image {}", self.config.image);
            return Ok(());
        }
        Err(ForgeError::ToolchainUnavailable(format!(
            "cannot obtain image {}; run `{} pull {}`: {}",
            self.config.image,
            self.config.runtime.display(),
            self.config.image,
            output.stderr.trim()
        )))
    }

    /// Local cache first, registry second.
    pub async fn ensure_image(&self) -> ForgeResult<ImageSource> {
        if self.image_available().await {
            return Ok(ImageSource::Cached);
        }
        self.pull_image().await?;
        Ok(ImageSource::Pulled)
    }

    fn run_args(&self, job: &SandboxJob, container: &str, script: &Path) -> Vec<String> {
        vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container.into(),
            "--network=none".into(),
            "-v".into(),
            format!("{}:/src:ro", job.workspace.display()),
            "-v".into(),
            format!("{}:/out:rw", job.output_dir.display()),
            "-v".into(),
            format!("{}:/tools/build.sh:ro", script.display()),
            "-e".into(),
            format!("CLEAN={}", if job.clean { 1 } else { 0 }),
            "-e".into(),
            format!("JOBS={}", job.jobs),
            "-e".into(),
            format!("MAKE_TARGET={}", job.make_target),
            "-e".into(),
            format!("PROJECT_SUBDIR={}", job.project_subdir.as_deref().unwrap_or("")),
            self.config.image.clone(),
            "bash".into(),
            "/tools/build.sh".into(),
        ]
    }

    /// Run one build. A timeout is not an error here: the partial output is
    /// returned with `timed_out` set and the container killed.
    pub async fn run(&self, job: &SandboxJob) -> ForgeResult<SandboxOutput> {
        let script_dir = job.output_dir.join(SCRIPT_DIR);
        fs::create_dir_all(&script_dir).await?;
        let script = script_dir.join("build.sh");
        fs::write(&script, BUILD_SCRIPT).await?;

        let container = format!("forge-build-{}", Uuid::new_v4());
        let mut cmd = self.runtime();
        cmd.args(self.run_args(job, &container, &script));

        tracing::info!(
            "Starting sandboxed build {} for {:?} (image {}, timeout {:?})",
            container,
            job.workspace,
            self.config.image,
            job.timeout
        );
        let mut guard = ContainerGuard::new(&self.config.runtime, &container);
        let output = match run_with_timeout(cmd, job.timeout).await {
            Ok(output) => output,
            Err(e) => {
                guard.disarm();
                return Err(self.spawn_error(e));
            }
        };

        if output.timed_out {
            self.kill_container(&container).await;
        }
        guard.disarm();

        let log_path = job.output_dir.join(LOG_FILE);
        let log_path = fs::metadata(&log_path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
            .then_some(log_path);

        tracing::info!(
            "Sandboxed build {} finished: exit={:?} timed_out={} in {:?}",
            container,
            output.exit_code,
            output.timed_out,
            output.elapsed
        );

        Ok(SandboxOutput {
            container,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            log_path,
            timed_out: output.timed_out,
            duration: output.elapsed,
        })
    }

    /// Killing the CLI client does not stop the container itself.
    async fn kill_container(&self, container: &str) {
        match self.probe(&["kill", container], self.config.probe_timeout()).await {
            Ok(output) if output.success() => tracing::info!("Killed container {}", container),
            Ok(output) => tracing::debug!("Container {} already gone: {}", container, output.stderr.trim()),
            Err(e) => tracing::warn!("Failed to kill container {}: {}", container, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(root: &Path) -> SandboxJob {
        SandboxJob {
            workspace: root.to_path_buf(),
            output_dir: root.join("out"),
            project_subdir: Some("firmware".to_string()),
            clean: false,
            jobs: 8,
            make_target: "flash".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn run_args_follow_sandbox_contract() {
        let executor = SandboxExecutor::new(SandboxConfig::default());
        let root = Path::new("/ws");
        let args = executor.run_args(&job(root), "c1", Path::new("/ws/out/.forge/build.sh"));
        let joined = args.join(" ");
        assert!(joined.contains("--network=none"));
        assert!(joined.contains("-v /ws:/src:ro"));
        assert!(joined.contains("-v /ws/out:/out:rw"));
        assert!(joined.contains("-v /ws/out/.forge/build.sh:/tools/build.sh:ro"));
        assert!(joined.contains("-e CLEAN=0 -e JOBS=8 -e MAKE_TARGET=flash -e PROJECT_SUBDIR=firmware"));
        assert!(joined.ends_with("bash /tools/build.sh"));
    }

    #[tokio::test]
    async fn missing_runtime_is_toolchain_unavailable() {
        let executor = SandboxExecutor::new(SandboxConfig {
            runtime: PathBuf::from("/nonexistent/forge-runtime"),
            ..SandboxConfig::default()
        });
        assert!(!executor.runtime_available().await);
        assert!(executor.runtime_version().await.is_none());
        let err = executor.ensure_image().await.unwrap_err();
        assert!(matches!(err, ForgeError::ToolchainUnavailable(_)));
    }
}
