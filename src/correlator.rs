//! Composite-device correlation.
//!
//! Turns the flat [`RawInterface`] list a platform enumerator produces into
//! logical [`DeviceInfo`] records, one per physical unit, across the three
//! device generations:
//!
//! - **Gen1** — serial and integrated device share one hub port; interfaces
//!   are grouped by hub port.
//! - **Gen2/Gen3** — the serial device is split onto its own port chain.
//!   Candidate serials are accepted in a fixed order: the expected-next rule
//!   (serial hub = integrated hub + 1), same hub, the `related` predicate,
//!   and finally (Windows only) a USB 3.0 controller port-remap hint that is
//!   itself confirmed by the expected-next rule.
//!
//! The output is deduplicated by unique key; when two candidates describe
//! one unit, the record with more populated interfaces wins.

use std::collections::HashMap;

use log::debug;

use crate::backends::{InterfaceClass, RawInterface};
use crate::chip::{ids_match, Generation};
use crate::device::DeviceInfo;
use crate::portchain::{hub_port, next_numeric, related};

/// Correlates one enumeration pass into logical device records.
pub fn correlate(raw: &[RawInterface]) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    devices.extend(correlate_gen1(raw));
    for generation in [Generation::Gen2, Generation::Gen3] {
        devices.extend(correlate_split(raw, generation));
    }
    dedupe_by_key(devices)
}

fn usb_devices<'a>(raw: &'a [RawInterface], vid: &str, pid: &str) -> Vec<&'a RawInterface> {
    raw.iter()
        .filter(|r| r.class == InterfaceClass::UsbDevice && ids_match(&r.vid, &r.pid, vid, pid))
        .collect()
}

/// Gen1: group every matched interface by the hub port both USB devices
/// hang off.
fn correlate_gen1(raw: &[RawInterface]) -> Vec<DeviceInfo> {
    let generation = Generation::Gen1;
    let (serial_vid, serial_pid) = generation.serial_ids();
    let (integrated_vid, integrated_pid) = generation.integrated_ids();

    let mut map: HashMap<String, DeviceInfo> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for serial in usb_devices(raw, serial_vid, serial_pid) {
        let hub = hub_port(&serial.port_chain).to_string();
        if hub.is_empty() {
            continue;
        }
        let mut info = DeviceInfo::new(hub.clone());
        info.device_instance_id = serial.instance_id.clone();
        info.vid = serial_vid.to_string();
        info.pid = serial_pid.to_string();
        info.platform_specific = serial.properties.clone();
        if !map.contains_key(&hub) {
            order.push(hub.clone());
        }
        map.insert(hub, info);
    }

    for integrated in usb_devices(raw, integrated_vid, integrated_pid) {
        let hub = hub_port(&integrated.port_chain).to_string();
        if hub.is_empty() {
            continue;
        }
        map.entry(hub.clone()).or_insert_with(|| {
            order.push(hub.clone());
            let mut info = DeviceInfo::new(hub.clone());
            info.device_instance_id = integrated.instance_id.clone();
            info.vid = integrated_vid.to_string();
            info.pid = integrated_pid.to_string();
            info.platform_specific = integrated.properties.clone();
            info
        });
    }

    if map.is_empty() {
        return Vec::new();
    }

    // Attach interface nodes whose USB ancestor belongs to this generation
    // and lives on a grouped hub port.
    for node in raw {
        let hub = hub_port(&node.port_chain).to_string();
        let Some(info) = map.get_mut(&hub) else {
            continue;
        };
        match node.class {
            InterfaceClass::Serial => {
                if ids_match(&node.vid, &node.pid, serial_vid, serial_pid) && !node.node_path.is_empty()
                {
                    info.serial_port_path = node.node_path.clone();
                    info.serial_port_id = node.instance_id.clone();
                }
            }
            InterfaceClass::Hid => {
                if ids_match(&node.vid, &node.pid, integrated_vid, integrated_pid)
                    && !node.node_path.is_empty()
                {
                    info.hid_device_path = node.node_path.clone();
                    info.hid_device_id = node.instance_id.clone();
                }
            }
            InterfaceClass::Video => {
                if ids_match(&node.vid, &node.pid, integrated_vid, integrated_pid) {
                    attach_camera(info, node);
                }
            }
            InterfaceClass::Audio => {
                if ids_match(&node.vid, &node.pid, integrated_vid, integrated_pid)
                    && !node.node_path.is_empty()
                {
                    info.audio_device_path = node.node_path.clone();
                    info.audio_device_id = node.instance_id.clone();
                }
            }
            InterfaceClass::UsbDevice => {}
        }
    }

    attach_serial_registry_fallback(&mut map, raw, serial_vid, serial_pid);

    order
        .into_iter()
        .filter_map(|hub| map.remove(&hub))
        .filter(DeviceInfo::is_valid)
        .collect()
}

/// Gen2/Gen3: pair each integrated device with its split serial device.
fn correlate_split(raw: &[RawInterface], generation: Generation) -> Vec<DeviceInfo> {
    let (serial_vid, serial_pid) = generation.serial_ids();
    let (integrated_vid, integrated_pid) = generation.integrated_ids();

    let integrated_devices = usb_devices(raw, integrated_vid, integrated_pid);
    let serial_devices = usb_devices(raw, serial_vid, serial_pid);
    let mut devices = Vec::new();

    for integrated in integrated_devices {
        let serial = find_serial_for_integrated(integrated, &serial_devices);

        let mut info = match serial {
            Some(serial) => {
                debug!(
                    "{}: paired integrated {} with serial {}",
                    generation.label(),
                    integrated.port_chain,
                    serial.port_chain
                );
                let mut info = DeviceInfo::new(serial.port_chain.clone());
                info.companion_port_chain = integrated.port_chain.clone();
                info.has_companion_device = true;
                info.serial_port_id = serial.instance_id.clone();
                info
            }
            None => {
                debug!(
                    "{}: no serial sibling for integrated device at {}",
                    generation.label(),
                    integrated.port_chain
                );
                DeviceInfo::new(integrated.port_chain.clone())
            }
        };
        info.device_instance_id = integrated.instance_id.clone();
        info.vid = integrated_vid.to_string();
        info.pid = integrated_pid.to_string();
        info.platform_specific = integrated.properties.clone();

        // Composite interfaces live under the integrated device's address.
        for node in raw {
            if node.port_chain != integrated.port_chain || node.node_path.is_empty() {
                continue;
            }
            if !ids_match(&node.vid, &node.pid, integrated_vid, integrated_pid) {
                continue;
            }
            match node.class {
                InterfaceClass::Hid => {
                    info.hid_device_path = node.node_path.clone();
                    info.hid_device_id = node.instance_id.clone();
                }
                InterfaceClass::Video => attach_camera(&mut info, node),
                InterfaceClass::Audio => {
                    info.audio_device_path = node.node_path.clone();
                    info.audio_device_id = node.instance_id.clone();
                }
                InterfaceClass::Serial | InterfaceClass::UsbDevice => {}
            }
        }

        // The serial node lives under the serial device's address.
        if let Some(serial) = serial {
            for node in raw {
                if node.class != InterfaceClass::Serial || node.node_path.is_empty() {
                    continue;
                }
                let same_device = (!node.instance_id.is_empty()
                    && node.instance_id == serial.instance_id)
                    || node.port_chain == serial.port_chain;
                if same_device && ids_match(&node.vid, &node.pid, serial_vid, serial_pid) {
                    info.serial_port_path = node.node_path.clone();
                    if info.serial_port_id.is_empty() {
                        info.serial_port_id = node.instance_id.clone();
                    }
                    break;
                }
            }
        }

        // Registry fallback for serials the tty scan missed.
        if info.serial_port_path.is_empty() {
            if let Some(node) = serial_registry_node(raw, serial_vid, serial_pid) {
                info.serial_port_path = node.node_path.clone();
            }
        }

        devices.push(info);
    }

    devices
}

/// Ordered acceptance of a serial candidate for an integrated device.
fn find_serial_for_integrated<'a>(
    integrated: &RawInterface,
    serials: &[&'a RawInterface],
) -> Option<&'a RawInterface> {
    let integrated_hub = hub_port(&integrated.port_chain);
    if integrated_hub.is_empty() {
        return None;
    }

    // 1. Expected-next: the firmware presents the serial one port above.
    if let Some(expected) = next_numeric(integrated_hub) {
        if let Some(found) = serials.iter().find(|s| hub_port(&s.port_chain) == expected) {
            return Some(*found);
        }
    }

    // 2. Same hub (rare bus configurations).
    if let Some(found) = serials.iter().find(|s| hub_port(&s.port_chain) == integrated_hub) {
        return Some(*found);
    }

    // 3. Sibling / adjacent-port relationship.
    if let Some(found) = serials
        .iter()
        .find(|s| related(hub_port(&s.port_chain), integrated_hub))
    {
        return Some(*found);
    }

    // 4. USB 3.0 controllers that renumber ports between their 2.0 and 3.0
    // halves: remap the integrated port and re-apply the expected-next rule.
    // Only Windows exhibits the renumbering.
    #[cfg(windows)]
    if let Some(mapped) = usb3_companion_hint(integrated_hub) {
        if let Some(expected) = next_numeric(&mapped) {
            if let Some(found) = serials.iter().find(|s| hub_port(&s.port_chain) == expected) {
                return Some(*found);
            }
        }
    }

    None
}

/// Maps high USB 3.0 hub ports onto the low companion ports of the paired
/// USB 2.0 root hub: ports 15.. wrap onto 1..=4.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn usb3_companion_hint(hub: &str) -> Option<String> {
    let (bus, port) = hub.split_once('-')?;
    let port: u32 = port.parse().ok()?;
    if port < 15 {
        return None;
    }
    let companion = ((port - 15) % 4) + 1;
    Some(format!("{bus}-{companion}"))
}

/// Camera slot preference: first node wins unless a later node has a lower
/// trailing index (`/dev/video0` beats `/dev/video1`).
fn attach_camera(info: &mut DeviceInfo, node: &RawInterface) {
    if node.node_path.is_empty() {
        return;
    }
    let replace = info.camera_device_path.is_empty()
        || trailing_index(&node.node_path) < trailing_index(&info.camera_device_path);
    if replace {
        info.camera_device_path = node.node_path.clone();
        info.camera_device_id = if node.instance_id.is_empty() {
            node.node_path.clone()
        } else {
            node.instance_id.clone()
        };
    }
}

fn trailing_index(path: &str) -> u32 {
    let digits: String = path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(u32::MAX)
}

fn serial_registry_node<'a>(
    raw: &'a [RawInterface],
    vid: &str,
    pid: &str,
) -> Option<&'a RawInterface> {
    raw.iter().find(|r| {
        r.class == InterfaceClass::Serial
            && r.port_chain.is_empty()
            && !r.node_path.is_empty()
            && ids_match(&r.vid, &r.pid, vid, pid)
    })
}

fn attach_serial_registry_fallback(
    map: &mut HashMap<String, DeviceInfo>,
    raw: &[RawInterface],
    vid: &str,
    pid: &str,
) {
    let Some(fallback) = serial_registry_node(raw, vid, pid) else {
        return;
    };
    for info in map.values_mut() {
        if info.serial_port_path.is_empty() {
            info.serial_port_path = fallback.node_path.clone();
            debug!(
                "serial registry fallback {} attached at {}",
                fallback.node_path, info.port_chain
            );
            break;
        }
    }
}

/// At most one record per unique key; the better-populated candidate wins.
fn dedupe_by_key(devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, DeviceInfo> = HashMap::new();

    for device in devices {
        let key = device.unique_key();
        match by_key.get(&key) {
            Some(existing) if existing.interface_count() >= device.interface_count() => {}
            Some(_) => {
                by_key.insert(key, device);
            }
            None => {
                order.push(key.clone());
                by_key.insert(key, device);
            }
        }
    }

    order.into_iter().filter_map(|key| by_key.remove(&key)).collect()
}
