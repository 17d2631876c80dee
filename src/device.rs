//! The logical device record.
//!
//! [`DeviceInfo`] describes one physical Openterface unit as assembled by the
//! correlator: its bus location, the optional USB 3.0 companion location, and
//! the four interface slots (serial / HID / camera / audio).
//!
//! ## Design goals
//! - **Stable identity:** [`DeviceInfo::unique_key`] prefers the port chain,
//!   which survives re-enumeration; device nodes and instance IDs are
//!   fallbacks only.
//! - **Value semantics:** records are plain cloneable values. Snapshot
//!   diffing compares the identifying fields; the platform attribute bag and
//!   the `last_seen` timestamp never participate in equality.
//! - **Empty means unknown:** absent paths/IDs are empty strings, matching
//!   the identifiers persisted by existing deployments.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// One physical Openterface unit as seen at a single discovery pass.
///
/// Produced by the correlator, cached by the device manager, diffed by the
/// hotplug monitor. Consumers outside the platform enumerators must not
/// interpret `platform_specific`; it is an opaque side-channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Primary identity: the serial/main bus path (e.g. `1-2`).
    pub port_chain: String,
    /// OS-opaque device instance identifier, used for OS lookups only.
    pub device_instance_id: String,

    /// USB 3.0 split configurations put the integrated video/HID device at a
    /// second bus address; this is that address. Empty for Gen1.
    pub companion_port_chain: String,
    /// True when `companion_port_chain` names a live composite device.
    pub has_companion_device: bool,

    /// Four-digit hex vendor ID of the matched USB device.
    pub vid: String,
    /// Four-digit hex product ID of the matched USB device.
    pub pid: String,

    /// Serial node, e.g. `/dev/ttyUSB0` or `COM7`.
    pub serial_port_path: String,
    /// HID node, e.g. `/dev/hidraw3` or a Windows device-interface path.
    pub hid_device_path: String,
    /// Camera node: V4L2 path or DirectShow friendly name.
    pub camera_device_path: String,
    /// Audio endpoint path.
    pub audio_device_path: String,

    /// OS-opaque per-interface instance IDs, parallel to the paths above.
    pub serial_port_id: String,
    pub hid_device_id: String,
    pub camera_device_id: String,
    pub audio_device_id: String,

    /// Enumerator-private attributes (udev properties, SetupAPI registry
    /// values). String-keyed, ordered for deterministic serialization.
    pub platform_specific: BTreeMap<String, String>,

    /// When this record was last produced by a discovery pass.
    pub last_seen: SystemTime,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            port_chain: String::new(),
            device_instance_id: String::new(),
            companion_port_chain: String::new(),
            has_companion_device: false,
            vid: String::new(),
            pid: String::new(),
            serial_port_path: String::new(),
            hid_device_path: String::new(),
            camera_device_path: String::new(),
            audio_device_path: String::new(),
            serial_port_id: String::new(),
            hid_device_id: String::new(),
            camera_device_id: String::new(),
            audio_device_id: String::new(),
            platform_specific: BTreeMap::new(),
            last_seen: SystemTime::UNIX_EPOCH,
        }
    }
}

impl DeviceInfo {
    /// New record at a known port chain, stamped now.
    pub fn new(port_chain: impl Into<String>) -> Self {
        DeviceInfo {
            port_chain: port_chain.into(),
            last_seen: SystemTime::now(),
            ..DeviceInfo::default()
        }
    }

    /// The key the hotplug differ indexes snapshots by.
    ///
    /// Priority: port chain, then instance ID, then `serial|hid` paths. A
    /// record with none of those is invalid and never enters a snapshot.
    pub fn unique_key(&self) -> String {
        if !self.port_chain.is_empty() {
            return self.port_chain.clone();
        }
        if !self.device_instance_id.is_empty() {
            return self.device_instance_id.clone();
        }
        format!("{}|{}", self.serial_port_path, self.hid_device_path)
    }

    /// A record is worth keeping iff it carries any identity at all.
    pub fn is_valid(&self) -> bool {
        !self.port_chain.is_empty()
            || !self.device_instance_id.is_empty()
            || !self.serial_port_path.is_empty()
            || !self.hid_device_path.is_empty()
    }

    pub fn has_serial(&self) -> bool {
        !self.serial_port_path.is_empty()
    }

    pub fn has_hid(&self) -> bool {
        !self.hid_device_path.is_empty()
    }

    pub fn has_camera(&self) -> bool {
        !self.camera_device_path.is_empty()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio_device_path.is_empty()
    }

    /// Both control channels present: the unit is fully usable.
    pub fn is_complete(&self) -> bool {
        self.has_serial() && self.has_hid()
    }

    pub fn has_companion_port_chain(&self) -> bool {
        !self.companion_port_chain.is_empty()
    }

    /// USB 3.0 completeness: serial plus a confirmed companion address.
    pub fn is_complete_usb3(&self) -> bool {
        self.has_serial() && self.has_companion_device && self.has_companion_port_chain()
    }

    /// How many of the four interface slots are filled.
    pub fn interface_count(&self) -> usize {
        [self.has_serial(), self.has_hid(), self.has_camera(), self.has_audio()]
            .iter()
            .filter(|present| **present)
            .count()
    }

    /// The bus address where the composite interfaces (camera/HID/audio)
    /// live: the companion chain when set, the main chain otherwise.
    pub fn active_companion_port_chain(&self) -> &str {
        if self.has_companion_port_chain() {
            &self.companion_port_chain
        } else {
            &self.port_chain
        }
    }

    /// Alias used by callers resolving composite interfaces.
    pub fn composite_port_chain(&self) -> &str {
        self.active_companion_port_chain()
    }

    /// The serial channel always lives on the main chain.
    pub fn serial_port_chain(&self) -> &str {
        &self.port_chain
    }

    /// UI label for this unit.
    pub fn display_name(&self) -> String {
        format!("Openterface Device \u{2014} Port {}", self.port_chain)
    }

    /// Pipe-joined interface listing, e.g.
    /// `Serial(/dev/ttyUSB0) | HID | Camera [Companion: 1-4]`.
    pub fn interface_summary(&self) -> String {
        let mut parts = Vec::new();
        if self.has_serial() {
            parts.push(format!("Serial({})", self.serial_port_path));
        }
        if self.has_hid() {
            parts.push("HID".to_string());
        }
        if self.has_camera() {
            parts.push("Camera".to_string());
        }
        if self.has_audio() {
            parts.push("Audio".to_string());
        }
        let mut summary = parts.join(" | ");
        if self.has_companion_port_chain() {
            summary.push_str(&format!(" [Companion: {}]", self.companion_port_chain));
        }
        summary
    }

    /// Short completeness indicator, e.g. `3/4 interfaces`.
    pub fn device_status(&self) -> String {
        format!("{}/4 interfaces", self.interface_count())
    }

    /// User-facing location string.
    pub fn port_chain_display(&self) -> String {
        if self.port_chain.is_empty() {
            return "Unknown".to_string();
        }
        let mut display = format!("Port {}", self.port_chain);
        if self.has_companion_port_chain() {
            display.push_str(&format!(" + Companion {}", self.companion_port_chain));
        }
        display
    }

    /// JSON dump for diagnostics and bug reports.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Identity comparison: all path/ID/VID/PID fields. `platform_specific` and
/// `last_seen` are deliberately excluded — attribute churn and timestamps
/// must not surface as hotplug "modified" events.
impl PartialEq for DeviceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.port_chain == other.port_chain
            && self.device_instance_id == other.device_instance_id
            && self.companion_port_chain == other.companion_port_chain
            && self.vid == other.vid
            && self.pid == other.pid
            && self.serial_port_path == other.serial_port_path
            && self.serial_port_id == other.serial_port_id
            && self.hid_device_path == other.hid_device_path
            && self.hid_device_id == other.hid_device_id
            && self.camera_device_path == other.camera_device_path
            && self.camera_device_id == other.camera_device_id
            && self.audio_device_path == other.audio_device_path
            && self.audio_device_id == other.audio_device_id
    }
}

impl Eq for DeviceInfo {}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.device_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_device() -> DeviceInfo {
        let mut d = DeviceInfo::new("1-2");
        d.vid = "534D".into();
        d.pid = "2109".into();
        d.serial_port_path = "/dev/ttyUSB0".into();
        d.hid_device_path = "/dev/hidraw3".into();
        d.camera_device_path = "/dev/video0".into();
        d
    }

    #[test]
    fn unique_key_prefers_port_chain() {
        let d = complete_device();
        assert_eq!(d.unique_key(), "1-2");

        let mut no_chain = d.clone();
        no_chain.port_chain.clear();
        no_chain.device_instance_id = "usb-1".into();
        assert_eq!(no_chain.unique_key(), "usb-1");

        no_chain.device_instance_id.clear();
        assert_eq!(no_chain.unique_key(), "/dev/ttyUSB0|/dev/hidraw3");
    }

    #[test]
    fn validity_and_completeness() {
        assert!(complete_device().is_valid());
        assert!(complete_device().is_complete());
        assert!(!DeviceInfo::default().is_valid());

        let mut usb3 = DeviceInfo::new("1-5");
        usb3.serial_port_path = "/dev/ttyACM0".into();
        usb3.companion_port_chain = "1-4".into();
        usb3.has_companion_device = true;
        assert!(usb3.is_complete_usb3());
        assert_eq!(usb3.active_companion_port_chain(), "1-4");
        assert_eq!(usb3.serial_port_chain(), "1-5");
    }

    #[test]
    fn equality_ignores_bag_and_timestamp() {
        let a = complete_device();
        let mut b = a.clone();
        b.last_seen = SystemTime::UNIX_EPOCH;
        b.platform_specific.insert("SYSPATH".into(), "/sys/x".into());
        assert_eq!(a, b);

        b.camera_device_path = "/dev/video2".into();
        assert_ne!(a, b);
    }

    #[test]
    fn summary_and_display() {
        let d = complete_device();
        assert_eq!(d.interface_count(), 3);
        assert_eq!(d.interface_summary(), "Serial(/dev/ttyUSB0) | HID | Camera");
        assert_eq!(d.display_name(), "Openterface Device \u{2014} Port 1-2");
        assert_eq!(d.device_status(), "3/4 interfaces");
        assert_eq!(d.port_chain_display(), "Port 1-2");

        let mut usb3 = d.clone();
        usb3.companion_port_chain = "1-4".into();
        assert!(usb3.interface_summary().ends_with("[Companion: 1-4]"));
        assert_eq!(usb3.port_chain_display(), "Port 1-2 + Companion 1-4");
    }

    #[test]
    fn serde_round_trip() {
        let d = complete_device();
        let json = d.to_json();
        let back: DeviceInfo = serde_json::from_str(&json).expect("round trip");
        assert_eq!(d, back);
        assert_eq!(d.platform_specific, back.platform_specific);
    }
}
