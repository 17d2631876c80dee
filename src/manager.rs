//! The device manager: discovery cache, selection state, and queries.
//!
//! [`DeviceManager`] is a cheaply cloneable handle (the library's `init()`
//! returns one; subsystems each get their own clone — there is no hidden
//! global). It owns the platform enumerator, a snapshot cache with a short
//! freshness window, the UI's "selected device", and the child
//! [`HotplugMonitor`](crate::hotplug::HotplugMonitor).
//!
//! ## Discovery policy
//! - cache younger than the freshness window → served as-is;
//! - cache present but stale → served as-is **and** a background
//!   re-enumeration is kicked off (never more than one in flight);
//! - no cache at all → one blocking enumeration on the calling thread.
//!
//! Enumeration failures are logged and leave the previous cache in place;
//! lookups that match nothing return empty lists, not errors.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backends::{platform_enumerator, PlatformEnumerator};
use crate::chip::{chip_type_for_ids, ids_match, ChipType, OPENTERFACE_PID, OPENTERFACE_VID};
use crate::correlator::correlate;
use crate::device::DeviceInfo;
use crate::hotplug::HotplugMonitor;
use crate::portchain::is_interface_of;
use crate::settings::Settings;

/// How long a discovery snapshot stays fresh before a read triggers a
/// background refresh.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(1);

/// Process handle to the device-management core. Clone freely; all clones
/// share one cache, one selection, and one monitor.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    enumerator: Box<dyn PlatformEnumerator>,
    freshness: Duration,
    cache: Mutex<DiscoveryCache>,
    refreshing: AtomicBool,
    selected: Mutex<Option<DeviceInfo>>,
    settings_path: Mutex<Option<PathBuf>>,
    monitor: HotplugMonitor,
}

#[derive(Default)]
struct DiscoveryCache {
    devices: Vec<DeviceInfo>,
    updated_at: Option<Instant>,
}

impl DeviceManager {
    /// Handle backed by the enumerator for the build target.
    pub fn new() -> Self {
        Self::with_enumerator(platform_enumerator())
    }

    /// Handle backed by a caller-supplied enumerator (tests use a scripted
    /// one), with the default freshness window.
    pub fn with_enumerator(enumerator: Box<dyn PlatformEnumerator>) -> Self {
        Self::with_config(enumerator, DEFAULT_FRESHNESS)
    }

    /// Fully configurable constructor.
    pub fn with_config(enumerator: Box<dyn PlatformEnumerator>, freshness: Duration) -> Self {
        let inner = Arc::new_cyclic(|weak| ManagerInner {
            enumerator,
            freshness,
            cache: Mutex::new(DiscoveryCache::default()),
            refreshing: AtomicBool::new(false),
            selected: Mutex::new(None),
            settings_path: Mutex::new(None),
            monitor: HotplugMonitor::new(weak.clone()),
        });
        info!("device manager initialized for platform: {}", inner.enumerator.name());
        DeviceManager { inner }
    }

    /// Short platform label (`linux`, `windows`).
    pub fn platform_name(&self) -> &str {
        self.inner.enumerator.name()
    }

    /// Current device list per the discovery policy above.
    pub fn discover(&self) -> Vec<DeviceInfo> {
        self.inner.discover()
    }

    /// Blocking re-enumeration that replaces the cache unconditionally.
    pub fn force_refresh(&self) -> Vec<DeviceInfo> {
        self.inner.enumerate_and_store()
    }

    /// Drops the cache; the next `discover` blocks.
    pub fn clear_cache(&self) {
        let mut cache = self.inner.cache.lock().unwrap();
        cache.devices.clear();
        cache.updated_at = None;
    }

    /// The most recently cached list, without triggering discovery.
    pub fn current_devices(&self) -> Vec<DeviceInfo> {
        self.inner.cache.lock().unwrap().devices.clone()
    }

    /// Devices whose main port chain matches `port_chain` (exact, or either
    /// side being the more specific interface form of the other). An empty
    /// `port_chain` returns the first device, if any.
    pub fn devices_by_port_chain(&self, port_chain: &str) -> Vec<DeviceInfo> {
        filter_by_port_chain(&self.discover(), port_chain)
    }

    /// Like [`devices_by_port_chain`](Self::devices_by_port_chain) but also
    /// matching the companion chain — except for Gen1 units, which never
    /// have one.
    pub fn devices_by_any_port_chain(&self, port_chain: &str) -> Vec<DeviceInfo> {
        filter_by_any_port_chain(&self.discover(), port_chain)
    }

    /// Devices whose companion chain matches `companion_port_chain`.
    pub fn devices_with_companion_port_chain(&self, companion_port_chain: &str) -> Vec<DeviceInfo> {
        filter_by_companion_port_chain(&self.discover(), companion_port_chain)
    }

    /// Distinct main port chains of the current device list.
    pub fn available_port_chains(&self) -> Vec<String> {
        let mut chains = Vec::new();
        for device in self.discover() {
            if !device.port_chain.is_empty() && !chains.contains(&device.port_chain) {
                chains.push(device.port_chain.clone());
            }
        }
        chains
    }

    /// The companion chain recorded for the device at `port_chain`, if any.
    pub fn companion_port_chain_for(&self, port_chain: &str) -> Option<String> {
        self.devices_by_port_chain(port_chain)
            .into_iter()
            .find(|d| d.has_companion_port_chain())
            .map(|d| d.companion_port_chain)
    }

    /// Selects the first device matching `port_chain`, remembers it, writes
    /// the persisted setting when one is attached, and returns it.
    pub fn select(&self, port_chain: &str) -> Option<DeviceInfo> {
        let device = self.devices_by_port_chain(port_chain).into_iter().next()?;
        debug!("selected device at port {}", device.port_chain);
        *self.inner.selected.lock().unwrap() = Some(device.clone());
        self.persist_selection(&device.port_chain);
        Some(device)
    }

    /// Selects whatever device is first in the discovery order.
    pub fn first_available(&self) -> Option<DeviceInfo> {
        let device = self.discover().into_iter().next()?;
        debug!("selected first available device at port {}", device.port_chain);
        *self.inner.selected.lock().unwrap() = Some(device.clone());
        self.persist_selection(&device.port_chain);
        Some(device)
    }

    /// The device a subsystem adapter or the UI last selected.
    pub fn selected(&self) -> Option<DeviceInfo> {
        self.inner.selected.lock().unwrap().clone()
    }

    pub fn set_selected(&self, device: DeviceInfo) {
        *self.inner.selected.lock().unwrap() = Some(device);
    }

    /// Attaches a settings file holding the persisted port chain; if the
    /// file already names one, it is selected right away.
    pub fn attach_settings(&self, path: PathBuf) {
        let stored = Settings::load(&path).port_chain;
        *self.inner.settings_path.lock().unwrap() = Some(path);
        if !stored.is_empty() {
            debug!("restoring persisted port chain {stored}");
            self.select(&stored);
        }
    }

    fn persist_selection(&self, port_chain: &str) {
        let path = self.inner.settings_path.lock().unwrap().clone();
        if let Some(path) = path {
            let settings = Settings { port_chain: port_chain.to_string() };
            if let Err(err) = settings.save(&path) {
                warn!("failed to persist port chain {port_chain}: {err}");
            }
        }
    }

    /// Bridge-chip type of a device record: strictly by VID/PID.
    pub fn chip_type_for(&self, device: &DeviceInfo) -> ChipType {
        chip_type_for_ids(&device.vid, &device.pid)
    }

    /// Chip type of the first device at `port_chain`.
    pub fn chip_type_for_port_chain(&self, port_chain: &str) -> ChipType {
        match self.devices_by_port_chain(port_chain).first() {
            Some(device) => self.chip_type_for(device),
            None => ChipType::Unknown,
        }
    }

    pub fn is_ms2109(&self, device: &DeviceInfo) -> bool {
        self.chip_type_for(device) == ChipType::Ms2109
    }

    pub fn is_ms2130s(&self, device: &DeviceInfo) -> bool {
        self.chip_type_for(device) == ChipType::Ms2130s
    }

    /// The hotplug monitor owned by this manager.
    pub fn hotplug(&self) -> &HotplugMonitor {
        &self.inner.monitor
    }

    /// Indented listing of the current devices for diagnostics output.
    pub fn format_device_tree(&self) -> String {
        format_device_tree(&self.discover())
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    pub(crate) fn monitor(&self) -> &HotplugMonitor {
        &self.monitor
    }

    pub(crate) fn discover(self: &Arc<Self>) -> Vec<DeviceInfo> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(updated_at) = cache.updated_at {
                if updated_at.elapsed() < self.freshness {
                    return cache.devices.clone();
                }
                let stale = cache.devices.clone();
                drop(cache);
                self.spawn_refresh();
                return stale;
            }
        }

        if self.refreshing.load(Ordering::SeqCst) {
            // Cold cache but a refresh is already running: don't pile on.
            return self.cache.lock().unwrap().devices.clone();
        }
        self.enumerate_and_store()
    }

    fn spawn_refresh(self: &Arc<Self>) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new().name("opf-discovery".into()).spawn(move || {
            inner.enumerate_and_store();
            inner.refreshing.store(false, Ordering::SeqCst);
        });
        if let Err(err) = spawned {
            warn!("failed to spawn discovery thread: {err}");
            self.refreshing.store(false, Ordering::SeqCst);
        }
    }

    /// Blocking enumerate + correlate + cache write. On failure the old
    /// cache is preserved and returned.
    pub(crate) fn enumerate_and_store(&self) -> Vec<DeviceInfo> {
        match self.enumerator.enumerate() {
            Ok(raw) => {
                let devices = correlate(&raw);
                debug!(
                    "discovery found {} device(s) from {} raw record(s)",
                    devices.len(),
                    raw.len()
                );
                let mut cache = self.cache.lock().unwrap();
                cache.devices = devices.clone();
                cache.updated_at = Some(Instant::now());
                devices
            }
            Err(err) => {
                warn!("discovery failed on {}: {err}", self.enumerator.name());
                self.cache.lock().unwrap().devices.clone()
            }
        }
    }
}

/// The §"devices on port chain X" filtering contract, main chain only.
pub(crate) fn filter_by_port_chain(devices: &[DeviceInfo], target: &str) -> Vec<DeviceInfo> {
    if target.is_empty() {
        return devices.first().cloned().into_iter().collect();
    }
    devices
        .iter()
        .filter(|d| chain_matches(&d.port_chain, target))
        .cloned()
        .collect()
}

/// Filtering across both the main and the companion chain. Gen1 units
/// (534D:2109) never match by companion — they have none.
pub(crate) fn filter_by_any_port_chain(devices: &[DeviceInfo], target: &str) -> Vec<DeviceInfo> {
    if target.is_empty() {
        return devices.first().cloned().into_iter().collect();
    }
    devices
        .iter()
        .filter(|d| {
            let main = chain_matches(&d.port_chain, target);
            let gen1 = ids_match(&d.vid, &d.pid, OPENTERFACE_VID, OPENTERFACE_PID);
            let companion = !gen1
                && d.has_companion_port_chain()
                && chain_matches(&d.companion_port_chain, target);
            main || companion
        })
        .cloned()
        .collect()
}

pub(crate) fn filter_by_companion_port_chain(
    devices: &[DeviceInfo],
    target: &str,
) -> Vec<DeviceInfo> {
    if target.is_empty() {
        return Vec::new();
    }
    devices
        .iter()
        .filter(|d| d.has_companion_port_chain() && chain_matches(&d.companion_port_chain, target))
        .cloned()
        .collect()
}

/// Exact match, or either chain being the interface form of the other.
fn chain_matches(device_chain: &str, target: &str) -> bool {
    if device_chain.is_empty() {
        return false;
    }
    device_chain == target
        || is_interface_of(target, device_chain)
        || is_interface_of(device_chain, target)
}

pub(crate) fn format_device_tree(devices: &[DeviceInfo]) -> String {
    if devices.is_empty() {
        return "No devices found".to_string();
    }
    let mut sorted: Vec<&DeviceInfo> = devices.iter().collect();
    sorted.sort_by(|a, b| a.port_chain.cmp(&b.port_chain));

    let mut lines = Vec::new();
    for d in sorted {
        lines.push(d.port_chain.clone());
        if !d.vid.is_empty() || !d.pid.is_empty() {
            lines.push(format!("  VID: {} PID: {}", d.vid, d.pid));
        }
        if d.has_serial() {
            lines.push(format!("  Serial: {}", d.serial_port_path));
        }
        if d.has_hid() {
            lines.push(format!("  HID: {}", d.hid_device_path));
        }
        if d.has_camera() {
            lines.push(format!("  Camera: {}", d.camera_device_path));
        }
        if d.has_audio() {
            lines.push(format!("  Audio: {}", d.audio_device_path));
        }
        if !d.device_instance_id.is_empty() {
            lines.push(format!("  DeviceInstanceId: {}", d.device_instance_id));
        }
    }
    lines.join("\n")
}


#[cfg(test)]
mod tests {
    use super::testing::{manager_with, ScriptedEnumerator};
    use super::*;
    use crate::backends::{InterfaceClass, RawInterface};

    fn usb(vid: &str, pid: &str, chain: &str) -> RawInterface {
        RawInterface {
            class: InterfaceClass::UsbDevice,
            instance_id: format!("usb:{chain}"),
            port_chain: chain.to_string(),
            vid: vid.to_string(),
            pid: pid.to_string(),
            ..RawInterface::default()
        }
    }

    fn gen1_record(chain: &str) -> DeviceInfo {
        let mut d = DeviceInfo::new(chain);
        d.vid = "534D".into();
        d.pid = "2109".into();
        d
    }

    fn gen2_record(chain: &str, companion: &str) -> DeviceInfo {
        let mut d = DeviceInfo::new(chain);
        d.vid = "345F".into();
        d.pid = "2132".into();
        d.companion_port_chain = companion.into();
        d.has_companion_device = true;
        d
    }

    #[test]
    fn filter_exact_and_interface_forms() {
        let devices = vec![gen1_record("1-2")];
        assert_eq!(filter_by_port_chain(&devices, "1-2").len(), 1);
        assert_eq!(filter_by_port_chain(&devices, "1-2.1").len(), 1);
        assert_eq!(filter_by_port_chain(&devices, "1-3").len(), 0);

        let nested = vec![gen1_record("1-2.1")];
        assert_eq!(filter_by_port_chain(&nested, "1-2").len(), 1);
    }

    #[test]
    fn filter_empty_target_returns_first() {
        let devices = vec![gen1_record("1-2"), gen1_record("1-5")];
        let filtered = filter_by_port_chain(&devices, "");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].port_chain, "1-2");
        assert!(filter_by_port_chain(&[], "").is_empty());
    }

    #[test]
    fn any_port_chain_matches_companion_except_gen1() {
        let devices = vec![gen2_record("1-5", "1-4")];
        assert_eq!(filter_by_any_port_chain(&devices, "1-4").len(), 1);
        assert_eq!(filter_by_any_port_chain(&devices, "1-5").len(), 1);

        // A Gen1 unit that somehow carries a companion chain must still not
        // match through it.
        let mut weird = gen1_record("1-2");
        weird.companion_port_chain = "1-9".into();
        let devices = vec![weird];
        assert_eq!(filter_by_any_port_chain(&devices, "1-9").len(), 0);
        assert_eq!(filter_by_any_port_chain(&devices, "1-2").len(), 1);
    }

    #[test]
    fn companion_filter_ignores_devices_without_companion() {
        let devices = vec![gen1_record("1-2"), gen2_record("1-5", "1-4")];
        let filtered = filter_by_companion_port_chain(&devices, "1-4");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].port_chain, "1-5");
        assert!(filter_by_companion_port_chain(&devices, "").is_empty());
    }

    #[test]
    fn discover_correlates_and_caches() {
        let script = ScriptedEnumerator::new();
        script.push(vec![usb("345F", "2132", "1-4"), usb("1A86", "FE0C", "1-5")]);
        let manager = manager_with(&script);

        let devices = manager.discover();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].port_chain, "1-5");

        // Within the freshness window the cache is served without touching
        // the enumerator again.
        script.push_error("should not be consulted");
        let again = manager.discover();
        assert_eq!(again, devices);
    }

    #[test]
    fn discovery_failure_preserves_cache() {
        let script = ScriptedEnumerator::new();
        script.push(vec![usb("534D", "2109", "1-2"), usb("1A86", "7523", "1-2")]);
        let manager = manager_with(&script);
        let first = manager.force_refresh();
        assert_eq!(first.len(), 1);

        script.push_error("udev unavailable");
        let after_failure = manager.force_refresh();
        assert_eq!(after_failure, first);
    }

    #[test]
    fn selection_and_chip_helpers() {
        let script = ScriptedEnumerator::new();
        script.push(vec![usb("534D", "2109", "1-2"), usb("1A86", "7523", "1-2")]);
        let manager = manager_with(&script);
        manager.force_refresh();

        let selected = manager.select("1-2").expect("device at 1-2");
        assert_eq!(manager.selected(), Some(selected.clone()));
        assert_eq!(manager.chip_type_for(&selected), ChipType::Ms2109);
        assert_eq!(manager.chip_type_for_port_chain("1-2"), ChipType::Ms2109);
        assert_eq!(manager.chip_type_for_port_chain("9-9"), ChipType::Unknown);
        assert!(manager.is_ms2109(&selected));
        assert!(!manager.is_ms2130s(&selected));

        assert_eq!(manager.available_port_chains(), ["1-2"]);
        assert!(manager.select("9-9").is_none());
    }

    #[test]
    fn first_available_selects_head_of_list() {
        let script = ScriptedEnumerator::new();
        script.push(vec![usb("345F", "2132", "1-4"), usb("1A86", "FE0C", "1-5")]);
        let manager = manager_with(&script);
        manager.force_refresh();

        let first = manager.first_available().expect("a device");
        assert_eq!(first.port_chain, "1-5");
        assert_eq!(manager.companion_port_chain_for("1-5").as_deref(), Some("1-4"));
    }

    #[test]
    fn device_tree_formatting() {
        let mut d = gen1_record("1-2");
        d.serial_port_path = "/dev/ttyUSB0".into();
        let tree = format_device_tree(&[d]);
        assert!(tree.starts_with("1-2"));
        assert!(tree.contains("  VID: 534D PID: 2109"));
        assert!(tree.contains("  Serial: /dev/ttyUSB0"));
        assert_eq!(format_device_tree(&[]), "No devices found");
    }
}
