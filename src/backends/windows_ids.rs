//! Windows device-identifier parsing: the pure half of the Windows backend.
//!
//! Lives outside the `cfg(windows)` module so the canonical port-chain
//! formula and the classification rules are unit-tested on every platform.
//! Persisted configuration stores these port-chain strings verbatim, so the
//! formula must keep producing byte-identical output.

use std::sync::OnceLock;

use regex::Regex;

use crate::backends::InterfaceClass;
use crate::chip::is_known_serial;

/// Canonical port chain from a device-instance walk, given the instance IDs
/// top-down (root-most ancestor first, the device itself last; at most
/// three entries).
///
/// The historical formula: take the root ancestor's trailing digit plus
/// one, a dash, then each middle ID's trailing character, and close with
/// `.2`. A two-level walk stops after the second ID and carries no suffix.
/// Odd, but existing deployments persist exactly these strings.
pub fn build_port_chain(ids_top_down: &[String]) -> String {
    let mut result = String::new();
    let mut prefix = String::new();

    for (index, id) in ids_top_down.iter().enumerate() {
        if index == 0 {
            if let Some(last) = id.chars().last() {
                if let Some(digit) = last.to_digit(10) {
                    prefix = format!("{}-", digit + 1);
                }
            }
        } else if index == 1 {
            if let Some(last) = id.chars().last() {
                result = format!("{prefix}{last}");
            }
        } else if index + 1 < ids_top_down.len() {
            if let Some(last) = id.chars().last() {
                result.push('-');
                result.push(last);
            }
        } else {
            result.push_str(".2");
        }
    }

    result
}

/// COM label from a Ports-class friendly name: the parenthesized form
/// first (`USB-SERIAL CH340 (COM7)`), then a bare `COMn` anywhere.
pub fn parse_com_port(friendly_name: &str) -> Option<String> {
    static PAREN: OnceLock<Regex> = OnceLock::new();
    static BARE: OnceLock<Regex> = OnceLock::new();
    let paren = PAREN.get_or_init(|| Regex::new(r"\(COM(\d+)\)").expect("static pattern"));
    let bare = BARE.get_or_init(|| Regex::new(r"COM(\d+)").expect("static pattern"));

    let captures = paren.captures(friendly_name).or_else(|| bare.captures(friendly_name))?;
    Some(format!("COM{}", &captures[1]))
}

/// True for the interface endpoints the discovery walk skips outright.
pub fn is_skipped_endpoint(device_id: &str) -> bool {
    device_id.contains("&0002") || device_id.contains("&0004")
}

/// Classifies a sibling/descendant of a matched USB device by hardware-ID
/// substring.
///
/// `MI_00` is the camera interface, `MI_04` carrying `HID` is the register
/// channel, `Audio`/`MI_01` the audio endpoint, and a known serial VID/PID
/// marks the serial function.
pub fn classify_node(hardware_id: &str, device_id: &str) -> Option<InterfaceClass> {
    if is_skipped_endpoint(device_id) {
        return None;
    }
    let hw = hardware_id.to_uppercase();
    let dev = device_id.to_uppercase();

    if hw.contains("HID") && dev.contains("MI_04") {
        return Some(InterfaceClass::Hid);
    }
    if hw.contains("MI_00") || dev.contains("MI_00") {
        return Some(InterfaceClass::Video);
    }
    if hw.contains("AUDIO") || hw.contains("MI_01") || dev.contains("MI_01") {
        return Some(InterfaceClass::Audio);
    }
    if let Some((vid, pid)) = vid_pid_from_hardware_id(&hw) {
        if is_known_serial(&vid, &pid) {
            return Some(InterfaceClass::Serial);
        }
    }
    None
}

/// `VID_xxxx` / `PID_xxxx` tokens from a hardware ID.
pub fn vid_pid_from_hardware_id(hardware_id: &str) -> Option<(String, String)> {
    static IDS: OnceLock<Regex> = OnceLock::new();
    let ids = IDS.get_or_init(|| {
        Regex::new(r"VID_([0-9A-Fa-f]{4}).*PID_([0-9A-Fa-f]{4})").expect("static pattern")
    });
    let captures = ids.captures(hardware_id)?;
    Some((captures[1].to_uppercase(), captures[2].to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn port_chain_formula_three_levels() {
        // Root hub instance ends in 0 → bus digit 1; parent ends in 3; the
        // device itself contributes the ".2" suffix.
        let chain = build_port_chain(&ids(&[
            r"USB\ROOT_HUB30\4&38AB1234&0&0",
            r"USB\VID_0000&PID_0000\5&2C9A&0&3",
            r"USB\VID_345F&PID_2132\6&1F00&0&8",
        ]));
        assert_eq!(chain, "1-3.2");
    }

    #[test]
    fn port_chain_formula_two_levels_has_no_suffix() {
        let chain = build_port_chain(&ids(&[
            r"USB\ROOT_HUB30\4&38AB1234&0&1",
            r"USB\VID_534D&PID_2109\5&2C9A&0&4",
        ]));
        assert_eq!(chain, "2-4");
    }

    #[test]
    fn port_chain_formula_tolerates_non_digit_roots() {
        // Root not ending in a digit produces no bus prefix.
        let chain = build_port_chain(&ids(&[
            r"ACPI\PNP0A08\PCIROOT",
            r"USB\VID_534D&PID_2109\5&2C9A&0&4",
        ]));
        assert_eq!(chain, "4");
        assert_eq!(build_port_chain(&[]), "");
    }

    #[test]
    fn com_port_parsing_prefers_parenthesized_form() {
        assert_eq!(parse_com_port("USB-SERIAL CH340 (COM7)").as_deref(), Some("COM7"));
        assert_eq!(parse_com_port("COM12 bridge device").as_deref(), Some("COM12"));
        assert_eq!(parse_com_port("no serial here"), None);
    }

    #[test]
    fn endpoint_skip_rules() {
        assert!(is_skipped_endpoint(r"USB\VID_345F&PID_2132&0002\X"));
        assert!(is_skipped_endpoint(r"USB\VID_345F&PID_2132&0004\X"));
        assert!(!is_skipped_endpoint(r"USB\VID_345F&PID_2132&MI_00\X"));
    }

    #[test]
    fn classification_by_hardware_id() {
        assert_eq!(
            classify_node(r"HID\VID_534D&PID_2109&MI_04", r"USB\VID_534D&PID_2109&MI_04\7&1"),
            Some(InterfaceClass::Hid)
        );
        assert_eq!(
            classify_node(r"USB\VID_534D&PID_2109&MI_00", r"USB\VID_534D&PID_2109&MI_00\7&2"),
            Some(InterfaceClass::Video)
        );
        assert_eq!(
            classify_node(r"USB\Audio&VID_534D&PID_2109", r"USB\VID_534D&PID_2109&MI_03\7&3"),
            Some(InterfaceClass::Audio)
        );
        assert_eq!(
            classify_node(r"USB\VID_1A86&PID_7523", r"USB\VID_1A86&PID_7523\7&4"),
            Some(InterfaceClass::Serial)
        );
        // Skipped endpoints classify as nothing even with a matching ID.
        assert_eq!(
            classify_node(r"USB\VID_534D&PID_2109&MI_00", r"USB\VID_534D&PID_2109&0002\X"),
            None
        );
        assert_eq!(classify_node(r"USB\VID_FFFF&PID_0001", r"USB\X"), None);
    }

    #[test]
    fn hardware_id_vid_pid_extraction() {
        assert_eq!(
            vid_pid_from_hardware_id(r"USB\VID_1a86&PID_fe0c&REV_0100"),
            Some(("1A86".to_string(), "FE0C".to_string()))
        );
        assert_eq!(vid_pid_from_hardware_id("HID_DEVICE"), None);
    }
}
