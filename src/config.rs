use crate::core::SelectionPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BRIDGE_PORT: u16 = 4444;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime CLI.
    pub runtime: PathBuf,
    pub image: String,
    pub probe_timeout_sec: u64,
    pub pull_timeout_sec: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: PathBuf::from("docker"),
            image: "nabla/arm-none-eabi-toolchain:latest".to_string(),
            probe_timeout_sec: 10,
            pull_timeout_sec: 600,
        }
    }
}

impl SandboxConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_sec)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProbeConfig {
    pub enabled: bool,
    /// Probe driver executable, resolved through PATH when relative.
    pub driver: PathBuf,
    /// Interface profile, e.g. `stlink` or `cmsis-dap`.
    pub interface: String,
    /// Target profile used until a device has been identified.
    pub target_profile: String,
    /// Extra script search directory handed to the driver with `-s`.
    pub scripts_dir: Option<PathBuf>,
    /// Where firmware scratch files are written; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub detect_timeout_sec: u64,
    pub flash_base_address: u32,
}

impl Default for LocalProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            driver: PathBuf::from("openocd"),
            interface: "stlink".to_string(),
            target_profile: "stm32f1x".to_string(),
            scripts_dir: None,
            scratch_dir: None,
            detect_timeout_sec: 10,
            flash_base_address: 0x0800_0000,
        }
    }
}

impl LocalProbeConfig {
    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_sec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBridgeConfig {
    pub host: String,
    pub port: u16,
    pub banner_prefix: String,
    pub connect_timeout_sec: u64,
    pub command_timeout_sec: u64,
    pub flash_timeout_sec: u64,
    pub flash_base_address: u32,
}

impl Default for RemoteBridgeConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: DEFAULT_BRIDGE_PORT,
            banner_prefix: "ESP32-STM32-Bridge".to_string(),
            connect_timeout_sec: 5,
            command_timeout_sec: 10,
            flash_timeout_sec: 300,
            flash_base_address: 0x0800_0000,
        }
    }
}

impl RemoteBridgeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parses `host` or `host:port`.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        match entry.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid bridge port in {:?}", entry))?;
                Ok(Self::new(host, port))
            }
            _ if !entry.is_empty() => Ok(Self::new(entry, DEFAULT_BRIDGE_PORT)),
            _ => anyhow::bail!("empty bridge address"),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub port: u16,
    pub sandbox: SandboxConfig,
    pub local_probe: LocalProbeConfig,
    pub remote_bridges: Vec<RemoteBridgeConfig>,
    pub selection: SelectionPolicy,
    /// Workspaces must live under one of these; empty allows any directory.
    pub allowed_roots: Vec<PathBuf>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            sandbox: SandboxConfig::default(),
            local_probe: LocalProbeConfig::default(),
            remote_bridges: Vec::new(),
            selection: SelectionPolicy::PreferLocal,
            allowed_roots: Vec::new(),
        }
    }
}

impl ForgeConfig {
    /// Load `FORGE_CONFIG` (JSON) when set, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let base = match env::var_os("FORGE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        base.with_env_overrides(|key| env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// `lookup` is the environment; injected so tests don't touch process state.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = port.parse().with_context(|| format!("invalid PORT {:?}", port))?;
        }
        if let Some(runtime) = lookup("FORGE_CONTAINER_RUNTIME") {
            self.sandbox.runtime = PathBuf::from(runtime);
        }
        if let Some(image) = lookup("FORGE_TOOLCHAIN_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(driver) = lookup("FORGE_PROBE_DRIVER") {
            self.local_probe.driver = PathBuf::from(driver);
        }
        if let Some(interface) = lookup("FORGE_PROBE_INTERFACE") {
            self.local_probe.interface = interface;
        }
        if let Some(profile) = lookup("FORGE_TARGET_PROFILE") {
            self.local_probe.target_profile = profile;
        }
        if let Some(flag) = lookup("FORGE_LOCAL_PROBE") {
            self.local_probe.enabled = parse_flag(&flag);
        }
        if let Some(bridges) = lookup("FORGE_REMOTE_BRIDGES") {
            self.remote_bridges = bridges
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(RemoteBridgeConfig::parse)
                .collect::<Result<_>>()?;
        }
        if let Some(policy) = lookup("FORGE_SELECTION") {
            self.selection = policy.parse().map_err(anyhow::Error::from)?;
        }
        if let Some(roots) = lookup("FORGE_ALLOWED_ROOTS") {
            self.allowed_roots = env::split_paths(&roots).collect();
        }
        Ok(self)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn bridge_addresses_parse() {
        let bridge = RemoteBridgeConfig::parse("10.0.0.7:5555").unwrap();
        assert_eq!((bridge.host.as_str(), bridge.port), ("10.0.0.7", 5555));
        let bridge = RemoteBridgeConfig::parse("bridge.local").unwrap();
        assert_eq!(bridge.port, DEFAULT_BRIDGE_PORT);
        assert!(RemoteBridgeConfig::parse("host:notaport").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let config = ForgeConfig::default()
            .with_env_overrides(env_of(&[
                ("PORT", "9090"),
                ("FORGE_REMOTE_BRIDGES", "10.0.0.7, 10.0.0.8:4000"),
                ("FORGE_SELECTION", "prefer-remote"),
                ("FORGE_LOCAL_PROBE", "off"),
                ("FORGE_ALLOWED_ROOTS", "/home:/tmp"),
            ]))
            .unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.remote_bridges.len(), 2);
        assert_eq!(config.remote_bridges[1].endpoint(), "10.0.0.8:4000");
        assert_eq!(config.selection, SelectionPolicy::PreferRemote);
        assert!(!config.local_probe.enabled);
        assert_eq!(config.allowed_roots, vec![PathBuf::from("/home"), PathBuf::from("/tmp")]);
    }

    #[test]
    fn json_config_fills_defaults() {
        let config: ForgeConfig =
            serde_json::from_str(r#"{"local_probe": {"interface": "cmsis-dap"}}"#).unwrap();
        assert_eq!(config.local_probe.interface, "cmsis-dap");
        assert_eq!(config.local_probe.driver, PathBuf::from("openocd"));
        assert_eq!(config.port, 8080);
    }
}
