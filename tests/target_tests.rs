use nabla_forge::backend::describe_target;
use nabla_forge::backend::remote::bridge_family;
use nabla_forge::core::FamilySource;
use nabla_forge::targets::{self, DeviceId, McuFamily};

#[test]
fn test_f103_descriptor_metadata() {
    let descriptor = targets::lookup("0x20036410").expect("F103C8 is in the table");
    assert_eq!(descriptor.name, "STM32F103C8");
    assert_eq!(descriptor.family, McuFamily::F1);
    assert_eq!(descriptor.flash_kb, 64);
    assert_eq!(descriptor.ram_kb, 20);
    assert_eq!(descriptor.core, "Cortex-M3");
    assert_eq!(descriptor.target_profile, "stm32f1x");
}

#[test]
fn test_identifiers_are_normalised() {
    let upper = targets::lookup("0X1001641F").unwrap();
    let lower = targets::lookup("0x1001641f").unwrap();
    let bare = targets::lookup("1001641f").unwrap();
    assert_eq!(upper, lower);
    assert_eq!(lower, bare);
    assert_eq!(upper.device_id.to_string(), "0x1001641F");
}

#[test]
fn test_lookup_is_total() {
    for input in ["", "0x", "zzzz", "0x123456789", "not an id", "0xDEADBEEF", "  0x20036410  "] {
        let identification = targets::identify(input);
        if identification.exact {
            assert!(identification.descriptor.is_some());
        } else {
            assert!(identification.descriptor.is_none());
        }
    }
    assert!(targets::lookup("0xDEADBEEF").is_none());
    assert_eq!(targets::identify("zzzz").device_id, None);
    assert_eq!(targets::identify("0xDEADBEEF").family, McuFamily::Unknown);
}

#[test]
fn test_prefix_fallback_gives_family_only() {
    let identification = targets::identify("0x20036499");
    assert!(!identification.exact);
    assert!(identification.descriptor.is_none());
    assert_eq!(identification.family, McuFamily::F1);
}

#[test]
fn test_database_wins_over_bridge_table() {
    let id = DeviceId(0x2003_6410);
    assert_eq!(bridge_family(id), McuFamily::Unknown);

    let target = describe_target(id, Some(bridge_family(id)));
    assert_eq!(target.family, McuFamily::F1);
    assert_eq!(target.family_source, FamilySource::Database);
    assert_eq!(target.name, "STM32F103C8");
    assert_eq!(target.device_id.as_deref(), Some("0x20036410"));
}

#[test]
fn test_bridge_hint_used_only_as_last_resort() {
    // Not in the table and outside every known prefix range.
    let id = DeviceId(0x0041_3000);
    assert_eq!(targets::infer_family(id), McuFamily::Unknown);
    let target = describe_target(id, Some(bridge_family(id)));
    assert_eq!(target.family, McuFamily::F4);
    assert_eq!(target.family_source, FamilySource::BridgePartNumber);
    assert_eq!(target.target_profile.as_deref(), Some("stm32f4x"));
}

#[test]
fn test_catalogue_listing() {
    let listed = targets::list_supported();
    let counted: usize = targets::supported_families().iter().map(|f| f.mcu_count).sum();
    assert_eq!(listed.len(), counted);
    assert!(listed
        .windows(2)
        .all(|pair| (pair[0].family, pair[0].name) <= (pair[1].family, pair[1].name)));

    let families = targets::supported_families();
    let f1 = families.iter().find(|f| f.family == McuFamily::F1).unwrap();
    assert_eq!(f1.target_profile, Some("stm32f1x"));
    assert_eq!(f1.cores, vec!["Cortex-M3"]);
    assert_eq!(f1.mcu_count, 6);
}

#[test]
fn test_family_names_parse() {
    assert_eq!(McuFamily::parse("F4"), Some(McuFamily::F4));
    assert_eq!(McuFamily::parse("stm32h7xx"), Some(McuFamily::H7));
    assert_eq!(McuFamily::parse("Z9"), None);
    assert_eq!(McuFamily::L0.target_profile(), Some("stm32l0"));
}
