//! Programmer backends: one contract, two transports.

pub mod local;
pub mod remote;

use crate::core::{BackendKind, FamilySource, FlashStage, TargetInfo};
use crate::error::ForgeResult;
use crate::firmware::FirmwareImage;
use crate::targets::{self, DeviceId, McuFamily};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub use local::LocalProbeBackend;
pub use remote::RemoteBridgeBackend;

#[derive(Debug, Clone)]
pub struct FlashOptions {
    /// Probe target profile; backends fall back to their default when unset.
    pub target_profile: Option<String>,
    pub verify: bool,
    pub reset: bool,
    pub timeout: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            target_profile: None,
            verify: true,
            reset: true,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlashProgress {
    pub stage: FlashStage,
    pub percent: u8,
    pub message: String,
}

impl FlashProgress {
    pub fn new(stage: FlashStage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Receives stage and percentage updates while a flash runs. May borrow the
/// caller for the duration of the call.
pub type ProgressCallback<'a> = dyn Fn(FlashProgress) + Send + Sync + 'a;

#[derive(Debug, Clone, Default)]
pub struct FlashReport {
    pub device_id: Option<String>,
    pub bytes: usize,
    pub verified: bool,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

/// A way of reaching a debug probe. Implementations own their transport
/// state; a call that finds the transport in use fails with `Busy`.
#[async_trait]
pub trait ProgrammerBackend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Human-readable location, e.g. `usb:stlink` or `192.168.4.1:4444`.
    fn endpoint(&self) -> String;

    /// Firmware version of the programmer itself, when it reports one.
    fn version(&self) -> Option<String> {
        None
    }

    async fn connect(&self) -> ForgeResult<()>;

    async fn disconnect(&self);

    /// Cheap liveness probe. Never errors; anything wrong reads as unavailable.
    async fn is_available(&self) -> bool;

    async fn detect_target(&self) -> ForgeResult<TargetInfo>;

    async fn flash(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        progress: &ProgressCallback<'_>,
    ) -> ForgeResult<FlashReport>;

    async fn reset(&self) -> ForgeResult<()>;
}

/// Resolve a detected identifier. The device table wins, then the prefix
/// fallback, then whatever family hint the transport itself offers.
pub fn describe_target(id: DeviceId, transport_hint: Option<McuFamily>) -> TargetInfo {
    let (family, family_source, descriptor) = match targets::lookup_id(id) {
        Some(descriptor) => (descriptor.family, FamilySource::Database, Some(descriptor)),
        None => match targets::infer_family(id) {
            McuFamily::Unknown => match transport_hint {
                Some(hint) if hint != McuFamily::Unknown => (hint, FamilySource::BridgePartNumber, None),
                _ => (McuFamily::Unknown, FamilySource::Unknown, None),
            },
            family => (family, FamilySource::PrefixFallback, None),
        },
    };

    let name = match (descriptor, family) {
        (Some(descriptor), _) => descriptor.name.to_string(),
        (None, McuFamily::Unknown) => "Unknown".to_string(),
        (None, family) => format!("Unknown {}", family),
    };

    TargetInfo {
        connected: true,
        device_id: Some(id.to_string()),
        name,
        family,
        family_source,
        target_profile: family.target_profile().map(str::to_string),
        descriptor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_beats_transport_hint() {
        let info = describe_target(DeviceId(0x2003_6410), Some(McuFamily::L4));
        assert_eq!(info.family, McuFamily::F1);
        assert_eq!(info.family_source, FamilySource::Database);
        assert_eq!(info.name, "STM32F103C8");
        assert_eq!(info.target_profile.as_deref(), Some("stm32f1x"));
    }

    #[test]
    fn prefix_fallback_then_hint() {
        let info = describe_target(DeviceId(0x2003_6499), None);
        assert_eq!(info.family, McuFamily::F1);
        assert_eq!(info.family_source, FamilySource::PrefixFallback);
        assert!(info.descriptor.is_none());

        let info = describe_target(DeviceId(0x0041_3000), Some(McuFamily::F4));
        assert_eq!(info.family, McuFamily::F4);
        assert_eq!(info.family_source, FamilySource::BridgePartNumber);

        let info = describe_target(DeviceId(0x0041_3000), None);
        assert_eq!(info.family, McuFamily::Unknown);
        assert_eq!(info.target_profile, None);
        assert_eq!(info.device_id.as_deref(), Some("0x00413000"));
    }
}
