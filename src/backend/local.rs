use super::{describe_target, FlashOptions, FlashProgress, FlashReport, ProgrammerBackend, ProgressCallback};
use crate::config::LocalProbeConfig;
use crate::core::{BackendKind, FlashStage, TargetInfo};
use crate::error::{ForgeError, ForgeResult};
use crate::firmware::FirmwareImage;
use crate::process::{run_with_timeout, CapturedOutput};
use crate::targets::DeviceId;
use async_trait::async_trait;
use regex::Regex;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

static DEVICE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)device id\s*=\s*(0x[0-9a-f]+)").expect("device id pattern")
});

/// Parse the identifier the probe driver prints during init.
pub fn parse_device_id(output: &str) -> Option<DeviceId> {
    DEVICE_ID
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

/// Debug probe on this machine, driven through an external driver process.
/// One driver invocation at a time owns the probe.
pub struct LocalProbeBackend {
    config: LocalProbeConfig,
    session: Mutex<()>,
}

impl LocalProbeBackend {
    pub fn new(config: LocalProbeConfig) -> Self {
        Self {
            config,
            session: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LocalProbeConfig {
        &self.config
    }

    fn claim(&self) -> ForgeResult<MutexGuard<'_, ()>> {
        self.session
            .try_lock()
            .map_err(|_| ForgeError::Busy(self.name().to_string()))
    }

    /// Locate the driver without spawning anything.
    fn driver(&self) -> ForgeResult<PathBuf> {
        which::which(&self.config.driver).map_err(|_| {
            ForgeError::ToolchainUnavailable(format!(
                "probe driver '{}' not found in PATH",
                self.config.driver.display()
            ))
        })
    }

    fn command(&self, driver: &Path, profile: Option<&str>, commands: &[&str]) -> Command {
        let mut cmd = Command::new(driver);
        if let Some(scripts) = &self.config.scripts_dir {
            cmd.arg("-s").arg(scripts);
        }
        let profile = profile.unwrap_or(&self.config.target_profile);
        cmd.arg("-f")
            .arg(format!("interface/{}.cfg", self.config.interface))
            .arg("-f")
            .arg(format!("target/{}.cfg", profile.trim_end_matches(".cfg")));
        for command in commands {
            cmd.arg("-c").arg(command);
        }
        cmd
    }

    async fn run(&self, cmd: Command, operation: &str, timeout: Duration) -> ForgeResult<CapturedOutput> {
        let output = run_with_timeout(cmd, timeout).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ForgeError::ToolchainUnavailable(format!(
                "probe driver '{}' not found",
                self.config.driver.display()
            )),
            _ => ForgeError::Execution(format!("failed to start probe driver: {}", e)),
        })?;
        if output.timed_out {
            return Err(ForgeError::Timeout {
                operation: operation.to_string(),
                timeout,
                output: output.combined(),
            });
        }
        Ok(output)
    }

    fn probe_seen(&self, output: &str) -> bool {
        let keyword = self.config.interface.to_ascii_lowercase().replace(['-', '_'], "");
        output.to_ascii_lowercase().replace(['-', '_'], "").contains(&keyword)
    }

    fn write_scratch(&self, image: &FirmwareImage) -> ForgeResult<tempfile::NamedTempFile> {
        let suffix = format!(".{}", image.format.extension());
        let mut builder = tempfile::Builder::new();
        builder.prefix("forge-fw-").suffix(&suffix);
        let mut file = match &self.config.scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(&image.data)?;
        file.flush()?;
        Ok(file)
    }

    fn program_command(&self, path: &Path, image: &FirmwareImage, options: &FlashOptions) -> String {
        let path = path.display().to_string();
        let mut command = if path.contains(char::is_whitespace) {
            format!("program {{{}}}", path)
        } else {
            format!("program {}", path)
        };
        if options.verify {
            command.push_str(" verify");
        }
        if options.reset {
            command.push_str(" reset");
        }
        command.push_str(" exit");
        if image.format.needs_base_address() {
            command.push_str(&format!(" 0x{:08X}", self.config.flash_base_address));
        }
        command
    }
}

#[async_trait]
impl ProgrammerBackend for LocalProbeBackend {
    fn name(&self) -> &str {
        "local-probe"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn endpoint(&self) -> String {
        format!("usb:{}", self.config.interface)
    }

    async fn connect(&self) -> ForgeResult<()> {
        let driver = self.driver()?;
        let mut cmd = Command::new(&driver);
        cmd.arg("--version");
        let output = self.run(cmd, "probe driver version check", VERSION_TIMEOUT).await?;
        if output.success() {
            tracing::debug!("Probe driver: {}", output.combined().lines().next().unwrap_or("").trim());
            Ok(())
        } else {
            Err(ForgeError::ToolchainUnavailable(format!(
                "probe driver '{}' is not runnable: {}",
                driver.display(),
                output.combined().trim()
            )))
        }
    }

    async fn disconnect(&self) {}

    async fn is_available(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Ok(driver) = self.driver() else {
            tracing::debug!("Local probe unavailable: driver not installed");
            return false;
        };
        let Ok(_session) = self.claim() else {
            return false;
        };
        let cmd = self.command(&driver, None, &["init", "exit"]);
        match self.run(cmd, "probe availability check", self.config.detect_timeout()).await {
            Ok(output) => {
                let text = output.combined();
                self.probe_seen(&text) && !text.to_ascii_lowercase().contains("error")
            }
            Err(e) => {
                tracing::debug!("Local probe unavailable: {}", e);
                false
            }
        }
    }

    async fn detect_target(&self) -> ForgeResult<TargetInfo> {
        let driver = self.driver()?;
        let _session = self.claim()?;
        let cmd = self.command(&driver, None, &["init", "exit"]);
        let output = self.run(cmd, "target detection", self.config.detect_timeout()).await?;
        let text = output.combined();

        if let Some(id) = parse_device_id(&text) {
            let target = describe_target(id, None);
            tracing::info!("Local probe detected {} ({})", target.name, id);
            return Ok(target);
        }
        if self.probe_seen(&text) {
            tracing::warn!("Probe answered but reported no device identifier");
            return Ok(TargetInfo {
                connected: true,
                ..TargetInfo::disconnected()
            });
        }
        Ok(TargetInfo::disconnected())
    }

    async fn flash(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        progress: &ProgressCallback<'_>,
    ) -> ForgeResult<FlashReport> {
        let driver = self.driver()?;
        let _session = self.claim()?;

        // Removed when dropped, including when this future is cancelled.
        let scratch = self.write_scratch(image)?;
        let program = self.program_command(scratch.path(), image, options);
        let cmd = self.command(&driver, options.target_profile.as_deref(), &[&program]);

        progress(FlashProgress::new(
            FlashStage::Programming,
            0,
            format!("programming {} bytes via {}", image.len(), self.endpoint()),
        ));
        let output = self.run(cmd, "flash", options.timeout).await?;
        let text = output.combined();
        let lower = text.to_ascii_lowercase();
        let device_id = parse_device_id(&text).map(|id| id.to_string());

        if !output.success() {
            if lower.contains("verify failed") || lower.contains("checksum mismatch") {
                return Err(ForgeError::VerificationFailed {
                    message: "probe driver reported a verification mismatch".to_string(),
                    output: text,
                });
            }
            return Err(ForgeError::device(
                format!("probe driver exited with {:?}", output.exit_code),
                text,
            ));
        }

        let verified = lower.contains("verified");
        if options.verify {
            progress(FlashProgress::new(FlashStage::Verifying, 90, "checking verification marker"));
            if !verified {
                return Err(ForgeError::VerificationFailed {
                    message: "programming finished without a verification marker".to_string(),
                    output: text,
                });
            }
        }
        if options.reset {
            progress(FlashProgress::new(FlashStage::Resetting, 95, "target reset by driver"));
        }
        progress(FlashProgress::new(FlashStage::Done, 100, "flash complete"));

        Ok(FlashReport {
            device_id,
            bytes: image.len(),
            verified,
            message: if verified {
                "Flash successful, verified".to_string()
            } else {
                "Flash successful".to_string()
            },
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn reset(&self) -> ForgeResult<()> {
        let driver = self.driver()?;
        let _session = self.claim()?;
        let cmd = self.command(&driver, None, &["init", "reset", "exit"]);
        let output = self.run(cmd, "target reset", self.config.detect_timeout()).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ForgeError::device("target reset failed", output.combined()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_id_case_insensitively() {
        let out = "Info : STLINK V2J37S7\nInfo : device id = 0x20036410\n";
        assert_eq!(parse_device_id(out), Some(DeviceId(0x2003_6410)));
        assert_eq!(parse_device_id("Info : Device ID = 0X1001641f"), Some(DeviceId(0x1001_641F)));
        assert_eq!(parse_device_id("Error: open failed"), None);
    }

    #[test]
    fn program_command_places_raw_binaries() {
        let backend = LocalProbeBackend::new(LocalProbeConfig::default());
        let options = FlashOptions::default();
        let bin = FirmwareImage::from_bytes(vec![0, 1, 2, 3]);
        let cmd = backend.program_command(Path::new("/tmp/fw.bin"), &bin, &options);
        assert_eq!(cmd, "program /tmp/fw.bin verify reset exit 0x08000000");

        let hex = FirmwareImage::from_bytes(b":00000001FF\n".to_vec());
        let options = FlashOptions {
            verify: false,
            reset: false,
            ..FlashOptions::default()
        };
        let cmd = backend.program_command(Path::new("/tmp/my fw.hex"), &hex, &options);
        assert_eq!(cmd, "program {/tmp/my fw.hex} exit");
    }

    #[tokio::test]
    async fn missing_driver_is_unavailable_without_spawning() {
        let backend = LocalProbeBackend::new(LocalProbeConfig {
            driver: PathBuf::from("/nonexistent/forge-probe-driver"),
            ..LocalProbeConfig::default()
        });
        assert!(!backend.is_available().await);
        assert!(matches!(backend.connect().await, Err(ForgeError::ToolchainUnavailable(_))));
        assert!(matches!(backend.detect_target().await, Err(ForgeError::ToolchainUnavailable(_))));
    }
}
