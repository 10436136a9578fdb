//! Static STM32 device table keyed by the debug-port identifier.
//!
//! Lookups are pure: the same identifier always resolves to the same
//! descriptor, and identifiers missing from the table fall back to a coarse
//! family guess from the identifier's leading digits.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum McuFamily {
    #[serde(rename = "STM32F0")]
    F0,
    #[serde(rename = "STM32F1")]
    F1,
    #[serde(rename = "STM32F2")]
    F2,
    #[serde(rename = "STM32F3")]
    F3,
    #[serde(rename = "STM32F4")]
    F4,
    #[serde(rename = "STM32F7")]
    F7,
    #[serde(rename = "STM32H7")]
    H7,
    #[serde(rename = "STM32L0")]
    L0,
    #[serde(rename = "STM32L1")]
    L1,
    #[serde(rename = "STM32L4")]
    L4,
    #[serde(rename = "STM32L5")]
    L5,
    #[serde(rename = "STM32G0")]
    G0,
    #[serde(rename = "STM32G4")]
    G4,
    #[serde(rename = "STM32U5")]
    U5,
    #[serde(rename = "STM32WB")]
    WB,
    #[serde(rename = "STM32WL")]
    WL,
    #[serde(rename = "unknown")]
    Unknown,
}

const ALL_FAMILIES: [McuFamily; 16] = [
    McuFamily::F0,
    McuFamily::F1,
    McuFamily::F2,
    McuFamily::F3,
    McuFamily::F4,
    McuFamily::F7,
    McuFamily::H7,
    McuFamily::L0,
    McuFamily::L1,
    McuFamily::L4,
    McuFamily::L5,
    McuFamily::G0,
    McuFamily::G4,
    McuFamily::U5,
    McuFamily::WB,
    McuFamily::WL,
];

impl McuFamily {
    pub fn short_name(self) -> &'static str {
        match self {
            McuFamily::F0 => "F0",
            McuFamily::F1 => "F1",
            McuFamily::F2 => "F2",
            McuFamily::F3 => "F3",
            McuFamily::F4 => "F4",
            McuFamily::F7 => "F7",
            McuFamily::H7 => "H7",
            McuFamily::L0 => "L0",
            McuFamily::L1 => "L1",
            McuFamily::L4 => "L4",
            McuFamily::L5 => "L5",
            McuFamily::G0 => "G0",
            McuFamily::G4 => "G4",
            McuFamily::U5 => "U5",
            McuFamily::WB => "WB",
            McuFamily::WL => "WL",
            McuFamily::Unknown => "unknown",
        }
    }

    /// Debug-probe target profile for the family, without the `.cfg` suffix.
    pub const fn target_profile(self) -> Option<&'static str> {
        let profile = match self {
            McuFamily::F0 => "stm32f0x",
            McuFamily::F1 => "stm32f1x",
            McuFamily::F2 => "stm32f2x",
            McuFamily::F3 => "stm32f3x",
            McuFamily::F4 => "stm32f4x",
            McuFamily::F7 => "stm32f7x",
            McuFamily::H7 => "stm32h7x",
            McuFamily::L0 => "stm32l0",
            McuFamily::L1 => "stm32l1",
            McuFamily::L4 => "stm32l4x",
            McuFamily::L5 => "stm32l5x",
            McuFamily::G0 => "stm32g0x",
            McuFamily::G4 => "stm32g4x",
            McuFamily::U5 => "stm32u5x",
            McuFamily::WB => "stm32wbx",
            McuFamily::WL => "stm32wlx",
            McuFamily::Unknown => return None,
        };
        Some(profile)
    }

    /// Accepts "F4", "f4", "STM32F4" and "stm32f4xx".
    pub fn parse(name: &str) -> Option<McuFamily> {
        let upper = name.trim().to_ascii_uppercase();
        let stripped = upper.strip_prefix("STM32").unwrap_or(&upper);
        let stripped = stripped.strip_suffix("XX").unwrap_or(stripped);
        ALL_FAMILIES
            .iter()
            .copied()
            .find(|family| family.short_name() == stripped)
    }
}

impl fmt::Display for McuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McuFamily::Unknown => f.write_str("unknown family"),
            other => write!(f, "STM32{}", other.short_name()),
        }
    }
}

/// 32-bit debug-port identifier, rendered as `0x` plus eight uppercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDeviceId(pub String);

impl fmt::Display for InvalidDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid device identifier: {:?}", self.0)
    }
}

impl std::error::Error for InvalidDeviceId {}

impl FromStr for DeviceId {
    type Err = InvalidDeviceId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 8 {
            return Err(InvalidDeviceId(raw.to_string()));
        }
        u32::from_str_radix(digits, 16)
            .map(DeviceId)
            .map_err(|_| InvalidDeviceId(raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    pub device_id: DeviceId,
    pub name: &'static str,
    pub family: McuFamily,
    pub flash_kb: u32,
    pub ram_kb: u32,
    pub core: &'static str,
    pub target_profile: &'static str,
    pub description: &'static str,
    pub max_clock_mhz: u32,
}

macro_rules! target {
    ($id:expr, $name:expr, $family:ident, $flash:expr, $ram:expr, $core:expr, $desc:expr, $clock:expr) => {
        TargetDescriptor {
            device_id: DeviceId($id),
            name: $name,
            family: McuFamily::$family,
            flash_kb: $flash,
            ram_kb: $ram,
            core: $core,
            target_profile: match McuFamily::$family.target_profile() {
                Some(profile) => profile,
                None => "",
            },
            description: $desc,
            max_clock_mhz: $clock,
        }
    };
}

// Identifiers are unique. Where F4 and F7 parts report the same value the
// F7 part is listed.
static TARGETS: &[TargetDescriptor] = &[
    target!(0x2003_6410, "STM32F103C8", F1, 64, 20, "Cortex-M3", "STM32F103C8T6 medium-density", 72),
    target!(0x2003_6414, "STM32F103CB", F1, 128, 20, "Cortex-M3", "STM32F103CBT6 medium-density", 72),
    target!(0x2003_6420, "STM32F103RC", F1, 256, 48, "Cortex-M3", "STM32F103RCT6 high-density", 72),
    target!(0x2003_6430, "STM32F103RE", F1, 512, 64, "Cortex-M3", "STM32F103RET6 high-density", 72),
    target!(0x2003_6440, "STM32F103ZC", F1, 256, 48, "Cortex-M3", "STM32F103ZCT6 high-density", 72),
    target!(0x2003_6450, "STM32F103ZE", F1, 512, 64, "Cortex-M3", "STM32F103ZET6 high-density", 72),
    target!(0x1007_6413, "STM32F401CC", F4, 256, 64, "Cortex-M4", "STM32F401CCU6 entry-level", 84),
    target!(0x1007_6415, "STM32F401CE", F4, 512, 96, "Cortex-M4", "STM32F401CEU6 entry-level", 84),
    target!(0x1007_6419, "STM32F401RC", F4, 256, 64, "Cortex-M4", "STM32F401RCT6 entry-level", 84),
    target!(0x1007_641B, "STM32F401RE", F4, 512, 96, "Cortex-M4", "STM32F401RET6 entry-level", 84),
    target!(0x1007_6423, "STM32F401VC", F4, 256, 64, "Cortex-M4", "STM32F401VCT6 entry-level", 84),
    target!(0x1007_6425, "STM32F401VE", F4, 512, 96, "Cortex-M4", "STM32F401VET6 entry-level", 84),
    target!(0x1001_6419, "STM32F405RG", F4, 1024, 192, "Cortex-M4", "STM32F405RGT6 foundation", 168),
    target!(0x1001_641F, "STM32F407VG", F4, 1024, 192, "Cortex-M4", "STM32F407VGT6 foundation", 168),
    target!(0x1001_6433, "STM32F407IG", F4, 1024, 192, "Cortex-M4", "STM32F407IGT6 foundation", 168),
    target!(0x1001_6449, "STM32F411CC", F4, 256, 128, "Cortex-M4", "STM32F411CCU6 access line", 100),
    target!(0x1001_644B, "STM32F411CE", F4, 512, 128, "Cortex-M4", "STM32F411CEU6 access line", 100),
    target!(0x1001_6461, "STM32F412CG", F4, 1024, 256, "Cortex-M4", "STM32F412CGU6 access line", 100),
    target!(0x1001_6469, "STM32F413CG", F4, 1024, 320, "Cortex-M4", "STM32F413CGU6 access line", 100),
    target!(0x1001_6479, "STM32F429ZI", F4, 2048, 256, "Cortex-M4", "STM32F429ZIT6 advanced line", 180),
    target!(0x1001_6481, "STM32F446RC", F4, 256, 128, "Cortex-M4", "STM32F446RCT6 high-performance", 180),
    target!(0x1001_6483, "STM32F446RE", F4, 512, 128, "Cortex-M4", "STM32F446RET6 high-performance", 180),
    target!(0x1001_6452, "STM32F745VG", F7, 1024, 320, "Cortex-M7", "STM32F745VGT6", 216),
    target!(0x1001_6453, "STM32F745ZG", F7, 1024, 320, "Cortex-M7", "STM32F745ZGT6", 216),
    target!(0x1001_6454, "STM32F750N8", F7, 64, 320, "Cortex-M7", "STM32F750N8H6 value line", 216),
    target!(0x1001_6458, "STM32F756VG", F7, 1024, 320, "Cortex-M7", "STM32F756VGT6 crypto", 216),
    target!(0x1001_6463, "STM32F765VG", F7, 1024, 512, "Cortex-M7", "STM32F765VGT6", 216),
    target!(0x1001_646B, "STM32F767ZI", F7, 2048, 512, "Cortex-M7", "STM32F767ZIT6", 216),
    target!(0x1001_6485, "STM32F722RC", F7, 256, 256, "Cortex-M7", "STM32F722RCT6", 216),
    target!(0x1001_648B, "STM32F722ZC", F7, 256, 256, "Cortex-M7", "STM32F722ZCT6", 216),
    target!(0x1001_6495, "STM32F723VC", F7, 256, 256, "Cortex-M7", "STM32F723VCT6", 216),
    target!(0x1001_64A3, "STM32F730R8", F7, 64, 256, "Cortex-M7", "STM32F730R8T6 value line", 216),
    target!(0x1001_64B3, "STM32F732RE", F7, 512, 256, "Cortex-M7", "STM32F732RET6", 216),
    target!(0x1000_6450, "STM32H743ZI", H7, 2048, 1024, "Cortex-M7", "STM32H743ZIT6 high-performance", 480),
    target!(0x1000_6453, "STM32H747ZI", H7, 2048, 1024, "Cortex-M7", "STM32H747ZIT6 dual-core", 480),
    target!(0x1000_6460, "STM32H723ZG", H7, 1024, 564, "Cortex-M7", "STM32H723ZGT6", 550),
    target!(0x1000_6463, "STM32H725IG", H7, 1024, 564, "Cortex-M7", "STM32H725IGT6", 550),
    target!(0x1000_6470, "STM32H730IB", H7, 2048, 564, "Cortex-M7", "STM32H730IBT6 value line", 550),
    target!(0x1000_6480, "STM32H7A3ZI", H7, 2048, 1024, "Cortex-M7", "STM32H7A3ZIT6", 280),
    target!(0x1000_6490, "STM32H7B3ZI", H7, 2048, 1024, "Cortex-M7", "STM32H7B3ZIT6 crypto", 280),
];

/// Exact table lookup. Malformed identifiers are simply not found.
pub fn lookup(identifier: &str) -> Option<&'static TargetDescriptor> {
    let id = identifier.parse::<DeviceId>().ok()?;
    lookup_id(id)
}

pub fn lookup_id(id: DeviceId) -> Option<&'static TargetDescriptor> {
    TARGETS.iter().find(|target| target.device_id == id)
}

/// Coarse family guess from the identifier's leading digits. Never returns metadata.
pub fn infer_family(id: DeviceId) -> McuFamily {
    match id.0 {
        v if v >> 16 == 0x2003 => McuFamily::F1,
        v if v >> 8 == 0x10_0064 => McuFamily::H7,
        v if v >> 8 == 0x10_0764 => McuFamily::F4,
        // 0x1001_64xx is shared by F4 and F7 parts and cannot be told apart here.
        _ => McuFamily::Unknown,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    pub device_id: Option<DeviceId>,
    pub descriptor: Option<&'static TargetDescriptor>,
    pub family: McuFamily,
    pub exact: bool,
}

/// Exact match first, prefix fallback second. Total over every input string.
pub fn identify(identifier: &str) -> Identification {
    let Ok(id) = identifier.parse::<DeviceId>() else {
        return Identification {
            device_id: None,
            descriptor: None,
            family: McuFamily::Unknown,
            exact: false,
        };
    };
    match lookup_id(id) {
        Some(descriptor) => Identification {
            device_id: Some(id),
            descriptor: Some(descriptor),
            family: descriptor.family,
            exact: true,
        },
        None => Identification {
            device_id: Some(id),
            descriptor: None,
            family: infer_family(id),
            exact: false,
        },
    }
}

/// Every known part, ordered by family then name.
pub fn list_supported() -> Vec<&'static TargetDescriptor> {
    let mut targets: Vec<_> = TARGETS.iter().collect();
    targets.sort_by(|a, b| a.family.cmp(&b.family).then(a.name.cmp(b.name)));
    targets
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilySummary {
    pub family: McuFamily,
    pub target_profile: Option<&'static str>,
    pub mcu_count: usize,
    pub cores: Vec<&'static str>,
    pub max_clock_range: String,
}

pub fn supported_families() -> Vec<FamilySummary> {
    let mut grouped: BTreeMap<McuFamily, Vec<&'static TargetDescriptor>> = BTreeMap::new();
    for target in TARGETS {
        grouped.entry(target.family).or_default().push(target);
    }

    grouped
        .into_iter()
        .map(|(family, parts)| {
            let mut cores: Vec<&'static str> = parts.iter().map(|p| p.core).collect();
            cores.sort_unstable();
            cores.dedup();
            let min_clock = parts.iter().map(|p| p.max_clock_mhz).min().unwrap_or(0);
            let max_clock = parts.iter().map(|p| p.max_clock_mhz).max().unwrap_or(0);
            FamilySummary {
                family,
                target_profile: family.target_profile(),
                mcu_count: parts.len(),
                cores,
                max_clock_range: format!("{}-{} MHz", min_clock, max_clock),
            }
        })
        .collect()
}
