//! Linux enumerator backed by libudev.
//!
//! Four scans feed the correlator: the `usb` subsystem filtered per known
//! VID/PID pair, then `hidraw`, `tty`, `video4linux` and `sound`, each node
//! tied back to its nearest `usb_device` ancestor and kept only when that
//! ancestor carries a known VID/PID. A final pass over the system serial
//! registry catches serial ports the `tty` scan missed.

#![cfg(target_os = "linux")]

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::OnceLock;

use log::{debug, warn};
use regex::Regex;

use crate::backends::{InterfaceClass, PlatformEnumerator, RawInterface};
use crate::chip::{is_known_integrated, is_known_serial, Generation};
use crate::error::{Error, Result};

pub struct LinuxEnumerator;

impl LinuxEnumerator {
    pub fn new() -> Self {
        LinuxEnumerator
    }
}

impl Default for LinuxEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformEnumerator for LinuxEnumerator {
    fn name(&self) -> &str {
        "linux"
    }

    fn enumerate(&self) -> Result<Vec<RawInterface>> {
        let mut raw = Vec::new();

        // Pass 1: the USB devices themselves, one scan per known VID/PID.
        let mut id_pairs: Vec<(&str, &str)> = Vec::new();
        for generation in Generation::ALL {
            for pair in [generation.serial_ids(), generation.integrated_ids()] {
                if !id_pairs.contains(&pair) {
                    id_pairs.push(pair);
                }
            }
        }
        for (vid, pid) in id_pairs {
            raw.extend(scan_usb_devices(vid, pid)?);
        }

        // Pass 2: interface nodes, classified by subsystem.
        for (subsystem, class) in [
            ("hidraw", InterfaceClass::Hid),
            ("tty", InterfaceClass::Serial),
            ("video4linux", InterfaceClass::Video),
            ("sound", InterfaceClass::Audio),
        ] {
            match scan_interface_nodes(subsystem, class) {
                Ok(nodes) => raw.extend(nodes),
                Err(err) => warn!("{subsystem} scan failed: {err}"),
            }
        }

        // Pass 3: serial-registry fallback for ports udev missed.
        raw.extend(scan_serial_registry());

        debug!("linux enumeration produced {} raw records", raw.len());
        Ok(raw)
    }
}

fn scan_usb_devices(vid: &str, pid: &str) -> Result<Vec<RawInterface>> {
    let mut enumerator =
        udev::Enumerator::new().map_err(|err| Error::Discovery(format!("udev: {err}")))?;
    enumerator
        .match_subsystem("usb")
        .map_err(|err| Error::Discovery(format!("udev match: {err}")))?;

    let devices = enumerator
        .scan_devices()
        .map_err(|err| Error::Discovery(format!("udev scan: {err}")))?;

    let mut found = Vec::new();
    for device in devices {
        if device.devtype() != Some(OsStr::new("usb_device")) {
            continue;
        }
        let Some(dev_vid) = attr(&device, "idVendor") else { continue };
        let Some(dev_pid) = attr(&device, "idProduct") else { continue };
        if !dev_vid.eq_ignore_ascii_case(vid) || !dev_pid.eq_ignore_ascii_case(pid) {
            continue;
        }

        let syspath = device.syspath().to_string_lossy().to_string();
        let port_chain = extract_port_chain(&syspath).unwrap_or_default();
        debug!("found usb device {syspath} ({vid}:{pid}) port chain {port_chain}");

        found.push(RawInterface {
            class: InterfaceClass::UsbDevice,
            instance_id: syspath,
            port_chain,
            vid: dev_vid.to_uppercase(),
            pid: dev_pid.to_uppercase(),
            node_path: String::new(),
            properties: collect_properties(&device),
        });
    }
    Ok(found)
}

fn scan_interface_nodes(subsystem: &str, class: InterfaceClass) -> Result<Vec<RawInterface>> {
    let mut enumerator =
        udev::Enumerator::new().map_err(|err| Error::Discovery(format!("udev: {err}")))?;
    enumerator
        .match_subsystem(subsystem)
        .map_err(|err| Error::Discovery(format!("udev match: {err}")))?;

    let devices = enumerator
        .scan_devices()
        .map_err(|err| Error::Discovery(format!("udev scan: {err}")))?;

    let mut found = Vec::new();
    for device in devices {
        let Some(ancestor) = usb_ancestor(&device) else { continue };
        let Some(vid) = attr(&ancestor, "idVendor") else { continue };
        let Some(pid) = attr(&ancestor, "idProduct") else { continue };
        if !is_known_serial(&vid, &pid) && !is_known_integrated(&vid, &pid) {
            continue;
        }

        let node_path = match device.devnode() {
            Some(node) => node.to_string_lossy().to_string(),
            None => continue,
        };
        // Sound cards expose many nodes; only pcm/control endpoints matter.
        if class == InterfaceClass::Audio
            && !(node_path.contains("pcm") || node_path.contains("control"))
        {
            continue;
        }

        let ancestor_syspath = ancestor.syspath().to_string_lossy().to_string();
        let port_chain = extract_port_chain(&ancestor_syspath).unwrap_or_default();
        debug!("found {subsystem} node {node_path} under {ancestor_syspath} (port {port_chain})");

        found.push(RawInterface {
            class,
            instance_id: device.syspath().to_string_lossy().to_string(),
            port_chain,
            vid: vid.to_uppercase(),
            pid: pid.to_uppercase(),
            node_path,
            properties: collect_properties(&device),
        });
    }
    Ok(found)
}

/// System serial-port registry pass: ports whose USB VID/PID matches a known
/// serial device, emitted without a port chain so the correlator only uses
/// them as a fallback.
fn scan_serial_registry() -> Vec<RawInterface> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            warn!("serial registry scan failed: {err}");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for port in ports {
        let serialport::SerialPortType::UsbPort(info) = &port.port_type else {
            continue;
        };
        let vid = format!("{:04X}", info.vid);
        let pid = format!("{:04X}", info.pid);
        if !is_known_serial(&vid, &pid) {
            continue;
        }
        debug!("serial registry: {} ({vid}:{pid})", port.port_name);
        found.push(RawInterface {
            class: InterfaceClass::Serial,
            instance_id: String::new(),
            port_chain: String::new(),
            vid,
            pid,
            node_path: port.port_name.clone(),
            properties: BTreeMap::new(),
        });
    }
    found
}

fn attr(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .map(|value| value.to_string_lossy().trim().to_string())
}

/// Nearest ancestor that is a whole USB device (`usb` subsystem,
/// `usb_device` devtype).
fn usb_ancestor(device: &udev::Device) -> Option<udev::Device> {
    let mut current = device.parent();
    while let Some(parent) = current {
        if parent.subsystem() == Some(OsStr::new("usb"))
            && parent.devtype() == Some(OsStr::new("usb_device"))
        {
            return Some(parent);
        }
        current = parent.parent();
    }
    None
}

fn collect_properties(device: &udev::Device) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("SYSPATH".to_string(), device.syspath().to_string_lossy().to_string());
    properties.insert("SYSNAME".to_string(), device.sysname().to_string_lossy().to_string());
    if let Some(node) = device.devnode() {
        properties.insert("DEVNAME".to_string(), node.to_string_lossy().to_string());
    }
    if let Some(subsystem) = device.subsystem() {
        properties.insert("SUBSYSTEM".to_string(), subsystem.to_string_lossy().to_string());
    }
    if let Some(devtype) = device.devtype() {
        properties.insert("DEVTYPE".to_string(), devtype.to_string_lossy().to_string());
    }
    for property in device.properties() {
        properties.insert(
            property.name().to_string_lossy().to_string(),
            property.value().to_string_lossy().to_string(),
        );
    }
    properties
}

/// Extracts the device port from a sysfs path.
///
/// `/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2.1` yields `1-2`: the
/// token right under `usbN`, collapsed from an interface subpath (`x-y.z`)
/// to its hub-port parent where needed.
pub(crate) fn extract_port_chain(syspath: &str) -> Option<String> {
    static UNDER_USB: OnceLock<Regex> = OnceLock::new();
    static PORT_TOKEN: OnceLock<Regex> = OnceLock::new();
    let under_usb = UNDER_USB
        .get_or_init(|| Regex::new(r"/usb\d+/(\d+-\d+(?:\.\d+)*)").expect("static pattern"));
    let port_token = PORT_TOKEN
        .get_or_init(|| Regex::new(r"^\d+-\d+(?:\.\d+)*$").expect("static pattern"));

    if let Some(captures) = under_usb.captures(syspath) {
        return Some(collapse_interface_subpath(&captures[1]));
    }

    // Fallback for unusual layouts: last path component that looks like a
    // port token.
    syspath
        .split('/')
        .rev()
        .find(|part| port_token.is_match(part))
        .map(collapse_interface_subpath)
}

/// `x-y.z` → `x-y`; tokens without a dot pass through.
fn collapse_interface_subpath(token: &str) -> String {
    match token.rfind('.') {
        Some(idx) => token[..idx].to_string(),
        None => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_chain_from_plain_device_path() {
        assert_eq!(
            extract_port_chain("/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2").as_deref(),
            Some("1-2")
        );
    }

    #[test]
    fn interface_subpaths_collapse_to_hub_port() {
        assert_eq!(
            extract_port_chain("/sys/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2.1").as_deref(),
            Some("1-2")
        );
        assert_eq!(
            extract_port_chain("/sys/devices/pci0000:00/0000:00:14.0/usb3/3-4/3-4.2/3-4.2:1.0")
                .as_deref(),
            Some("3-4")
        );
    }

    #[test]
    fn fallback_matches_trailing_port_token() {
        assert_eq!(extract_port_chain("weird/layout/2-7.3").as_deref(), Some("2-7"));
        assert_eq!(extract_port_chain("no ports here"), None);
    }
}
