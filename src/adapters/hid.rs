//! HID adapter: binds the register transport to whatever matching device is
//! plugged in.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::adapters::{defer, defer_after};
use crate::device::DeviceInfo;
use crate::events::{DeviceChangeListener, ListenerId};
use crate::hotplug::HotplugMonitor;
use crate::transport::HidTransport;

/// Wait for the OS to finish enumerating the HID node after plug-in before
/// binding to it.
pub const HID_SETTLE_DELAY: Duration = Duration::from_millis(500);

pub struct HidAdapter {
    transport: Arc<HidTransport>,
    settle_delay: Duration,
}

impl HidAdapter {
    pub fn new(transport: Arc<HidTransport>) -> Self {
        HidAdapter { transport, settle_delay: HID_SETTLE_DELAY }
    }

    /// Test constructor with a shortened settle delay.
    #[cfg(test)]
    pub(crate) fn with_settle_delay(transport: Arc<HidTransport>, settle_delay: Duration) -> Self {
        HidAdapter { transport, settle_delay }
    }

    pub fn attach(&self, monitor: &HotplugMonitor) -> ListenerId {
        monitor.add_listener(Box::new(HidListener {
            transport: Arc::clone(&self.transport),
            settle_delay: self.settle_delay,
        }))
    }

    pub fn transport(&self) -> &Arc<HidTransport> {
        &self.transport
    }
}

struct HidListener {
    transport: Arc<HidTransport>,
    settle_delay: Duration,
}

impl DeviceChangeListener for HidListener {
    fn on_device_unplugged(&mut self, device: &DeviceInfo) {
        if !device.has_hid() {
            debug!("device at {} has no HID component, skipping deactivation", device.port_chain);
            return;
        }
        if self.transport.current_hid_port_chain() != device.port_chain {
            debug!("HID deactivation skipped, port chain mismatch for {}", device.port_chain);
            return;
        }
        info!("stopping HID transport for unplugged device at {}", device.port_chain);
        let transport = Arc::clone(&self.transport);
        let old_path = transport.current_hid_device_path();
        // Stop joins the poll thread; never do that on the hotplug thread.
        defer(move || {
            transport.stop();
            transport.announce_disconnected(&old_path);
        });
    }

    fn on_new_device_plugged_in(&mut self, device: &DeviceInfo) {
        if !device.has_hid() {
            debug!("device at {} has no HID component, skipping auto-switch", device.port_chain);
            return;
        }
        if self.transport.is_in_transaction() {
            debug!("HID transport already active, skipping auto-switch to {}", device.port_chain);
            return;
        }
        let transport = Arc::clone(&self.transport);
        let port_chain = device.port_chain.clone();
        // Give the OS time to enumerate the fresh HID node, then bind and
        // start the status poll.
        defer_after(self.settle_delay, move || {
            if transport.switch_to_hid_by_port_chain(&port_chain) {
                transport.start();
            } else {
                debug!("HID auto-switch failed for port chain {port_chain}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InterfaceClass, RawInterface};
    use crate::manager::testing::{manager_with, ScriptedEnumerator};
    use crate::transport::testing::mock_transport_gen1;

    fn hid_device(chain: &str, path: &str) -> DeviceInfo {
        let mut d = DeviceInfo::new(chain);
        d.hid_device_path = path.to_string();
        d
    }

    fn gen1_with_hid(chain: &str, hid: &str) -> Vec<RawInterface> {
        vec![
            RawInterface {
                class: InterfaceClass::UsbDevice,
                instance_id: format!("usb:{chain}:serial"),
                port_chain: chain.to_string(),
                vid: "1A86".into(),
                pid: "7523".into(),
                ..RawInterface::default()
            },
            RawInterface {
                class: InterfaceClass::UsbDevice,
                instance_id: format!("usb:{chain}:video"),
                port_chain: chain.to_string(),
                vid: "534D".into(),
                pid: "2109".into(),
                ..RawInterface::default()
            },
            RawInterface {
                class: InterfaceClass::Hid,
                instance_id: format!("hid:{hid}"),
                port_chain: chain.to_string(),
                vid: "534D".into(),
                pid: "2109".into(),
                node_path: hid.to_string(),
                ..RawInterface::default()
            },
        ]
    }

    fn wait_until(what: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn plug_in_binds_and_starts_polling() {
        let script = ScriptedEnumerator::new();
        script.push(gen1_with_hid("1-2", "hid-vid_534d&pid_2109"));
        let manager = manager_with(&script);
        manager.force_refresh();

        let transport = mock_transport_gen1(manager);
        let adapter = HidAdapter::with_settle_delay(Arc::clone(&transport), Duration::from_millis(10));
        let monitor_device = hid_device("1-2", "hid-vid_534d&pid_2109");

        let mut listener = HidListener {
            transport: Arc::clone(adapter.transport()),
            settle_delay: adapter.settle_delay,
        };
        listener.on_new_device_plugged_in(&monitor_device);

        assert!(wait_until(|| transport.is_polling()));
        assert_eq!(transport.current_hid_port_chain(), "1-2");
        assert!(transport.is_in_transaction());
        transport.stop();
    }

    #[test]
    fn plug_in_without_hid_component_is_ignored() {
        let script = ScriptedEnumerator::new();
        script.push(Vec::new());
        let manager = manager_with(&script);
        let transport = mock_transport_gen1(manager);
        let adapter = HidAdapter::with_settle_delay(Arc::clone(&transport), Duration::from_millis(1));

        let mut listener = HidListener {
            transport: Arc::clone(adapter.transport()),
            settle_delay: adapter.settle_delay,
        };
        listener.on_new_device_plugged_in(&DeviceInfo::new("1-2"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!transport.is_polling());
    }

    #[test]
    fn unplug_of_bound_device_stops_transport() {
        let script = ScriptedEnumerator::new();
        script.push(gen1_with_hid("1-2", "hid-vid_534d&pid_2109"));
        let manager = manager_with(&script);
        manager.force_refresh();

        let transport = mock_transport_gen1(manager);
        assert!(transport.switch_to_hid_by_port_chain("1-2"));
        assert!(transport.start());
        assert!(transport.is_polling());

        let adapter = HidAdapter::with_settle_delay(Arc::clone(&transport), Duration::from_millis(1));
        let mut listener = HidListener {
            transport: Arc::clone(adapter.transport()),
            settle_delay: adapter.settle_delay,
        };

        // Mismatched port chain: nothing happens.
        listener.on_device_unplugged(&hid_device("9-9", "other"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(transport.is_polling());

        listener.on_device_unplugged(&hid_device("1-2", "hid-vid_534d&pid_2109"));
        assert!(wait_until(|| !transport.is_polling()));
        assert!(!transport.is_in_transaction());
    }
}
