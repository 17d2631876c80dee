//! Windows enumerator backed by SetupAPI / cfgmgr32.
//!
//! For each known VID/PID the USB device-interface class is walked; every
//! match contributes a [`RawInterface`] for the device itself plus
//! classified records for its siblings (same parent hub) and descendants
//! (first-child / next-sibling walk). The canonical port chain comes from
//! [`windows_ids::build_port_chain`] over a three-level parent walk and must
//! stay byte-identical to what existing configuration files persist.

#![cfg(windows)]

use std::collections::BTreeMap;

use log::{debug, warn};

use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_Child, CM_Get_Device_IDW, CM_Get_Parent, CM_Get_Sibling, SetupDiDestroyDeviceInfoList,
    SetupDiEnumDeviceInfo, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
    SetupDiGetDeviceInterfaceDetailW, SetupDiGetDeviceRegistryPropertyW, CR_SUCCESS,
    DIGCF_ALLCLASSES, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO, SPDRP_FRIENDLYNAME,
    SPDRP_HARDWAREID, SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W,
    SP_DEVINFO_DATA,
};
use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;

use crate::backends::windows_ids::{
    build_port_chain, classify_node, parse_com_port, vid_pid_from_hardware_id,
};
use crate::backends::{InterfaceClass, PlatformEnumerator, RawInterface};
use crate::chip::{is_known_serial, Generation};
use crate::error::{Error, Result};

const GUID_DEVINTERFACE_USB_DEVICE: GUID = GUID {
    data1: 0xA5DCBF10,
    data2: 0x6530,
    data3: 0x11D2,
    data4: [0x90, 0x1F, 0x00, 0xC0, 0x4F, 0xB9, 0x51, 0xED],
};

const GUID_DEVINTERFACE_HID: GUID = GUID {
    data1: 0x4D1E55B2,
    data2: 0xF16F,
    data3: 0x11CF,
    data4: [0x88, 0xCB, 0x00, 0x11, 0x11, 0x00, 0x00, 0x30],
};

const GUID_DEVCLASS_PORTS: GUID = GUID {
    data1: 0x4D36E978,
    data2: 0xE325,
    data3: 0x11CE,
    data4: [0xBF, 0xC1, 0x08, 0x00, 0x2B, 0xE1, 0x03, 0x18],
};

pub struct WindowsEnumerator;

impl WindowsEnumerator {
    pub fn new() -> Self {
        WindowsEnumerator
    }
}

impl Default for WindowsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformEnumerator for WindowsEnumerator {
    fn name(&self) -> &str {
        "windows"
    }

    fn enumerate(&self) -> Result<Vec<RawInterface>> {
        let mut raw = Vec::new();

        let mut id_pairs: Vec<(&str, &str)> = Vec::new();
        for generation in Generation::ALL {
            for pair in [generation.serial_ids(), generation.integrated_ids()] {
                if !id_pairs.contains(&pair) {
                    id_pairs.push(pair);
                }
            }
        }
        for (vid, pid) in id_pairs {
            raw.extend(find_usb_devices(vid, pid)?);
        }

        // Serial registry fallback, mirroring the Linux pass.
        raw.extend(scan_serial_registry());

        debug!("windows enumeration produced {} raw records", raw.len());
        Ok(raw)
    }
}

/// USB devices matching one VID/PID, plus their classified siblings and
/// descendants.
fn find_usb_devices(vid: &str, pid: &str) -> Result<Vec<RawInterface>> {
    let target = format!("VID_{}&PID_{}", vid.to_uppercase(), pid.to_uppercase());
    let mut found = Vec::new();

    let dev_info = unsafe {
        SetupDiGetClassDevsW(
            &GUID_DEVINTERFACE_USB_DEVICE,
            std::ptr::null(),
            std::ptr::null_mut(),
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
    };
    if dev_info == INVALID_HANDLE_VALUE {
        return Err(Error::Discovery("SetupDiGetClassDevs failed for USB devices".to_string()));
    }

    let mut index = 0u32;
    loop {
        let mut data = empty_devinfo();
        let ok = unsafe { SetupDiEnumDeviceInfo(dev_info, index, &mut data) };
        if ok == 0 {
            break;
        }
        index += 1;

        let hardware_id = registry_property(dev_info, &mut data, SPDRP_HARDWAREID);
        if !hardware_id.to_uppercase().contains(&target) {
            continue;
        }

        let instance_id = device_id(data.DevInst);
        let port_chain = port_chain_for(data.DevInst);
        debug!("matched USB device {instance_id} at port chain {port_chain}");

        let mut properties = BTreeMap::new();
        properties.insert("hardwareId".to_string(), hardware_id.clone());
        let friendly = registry_property(dev_info, &mut data, SPDRP_FRIENDLYNAME);
        if !friendly.is_empty() {
            properties.insert("friendlyName".to_string(), friendly);
        }

        found.push(RawInterface {
            class: InterfaceClass::UsbDevice,
            instance_id: instance_id.clone(),
            port_chain: port_chain.clone(),
            vid: vid.to_uppercase(),
            pid: pid.to_uppercase(),
            node_path: String::new(),
            properties,
        });

        // Siblings share the parent hub; descendants are the device's own
        // interface functions.
        let mut related: Vec<u32> = Vec::new();
        let mut parent = 0u32;
        if unsafe { CM_Get_Parent(&mut parent, data.DevInst, 0) } == CR_SUCCESS {
            related.extend(children_of(parent));
        }
        related.extend(descendants_of(data.DevInst));

        for node in related {
            if node == data.DevInst {
                continue;
            }
            let node_id = device_id(node);
            let node_hw = hardware_id_of(node);
            let Some(class) = classify_node(&node_hw, &node_id) else {
                continue;
            };
            let (node_vid, node_pid) =
                vid_pid_from_hardware_id(&node_hw).unwrap_or((vid.to_uppercase(), pid.to_uppercase()));

            let node_path = match class {
                InterfaceClass::Serial => com_port_for_instance(&node_id).unwrap_or_default(),
                InterfaceClass::Hid => {
                    hid_interface_path_for(&node_id).unwrap_or_else(|| node_id.clone())
                }
                // DirectShow / audio endpoints resolve by friendly name.
                _ => friendly_name_of(node).unwrap_or_else(|| node_id.clone()),
            };
            if node_path.is_empty() {
                continue;
            }

            let chain = match class {
                // The split serial device owns its own location.
                InterfaceClass::Serial => port_chain_for(node),
                _ => port_chain.clone(),
            };

            found.push(RawInterface {
                class,
                instance_id: node_id,
                port_chain: chain,
                vid: node_vid,
                pid: node_pid,
                node_path,
                properties: BTreeMap::new(),
            });
        }
    }

    unsafe { SetupDiDestroyDeviceInfoList(dev_info) };
    Ok(found)
}

/// Canonical port chain: walk up to three instance levels and feed the IDs
/// top-down through the historical formula.
fn port_chain_for(dev_inst: u32) -> String {
    let mut ids = Vec::new();
    let mut current = dev_inst;
    for _ in 0..3 {
        ids.push(device_id(current));
        let mut parent = 0u32;
        if unsafe { CM_Get_Parent(&mut parent, current, 0) } != CR_SUCCESS {
            break;
        }
        current = parent;
    }
    ids.reverse();
    build_port_chain(&ids)
}

/// Direct children of a device instance, via first-child + next-sibling.
fn children_of(dev_inst: u32) -> Vec<u32> {
    let mut children = Vec::new();
    let mut child = 0u32;
    if unsafe { CM_Get_Child(&mut child, dev_inst, 0) } != CR_SUCCESS {
        return children;
    }
    loop {
        children.push(child);
        let mut sibling = 0u32;
        if unsafe { CM_Get_Sibling(&mut sibling, child, 0) } != CR_SUCCESS {
            break;
        }
        child = sibling;
    }
    children
}

/// All descendants, depth first.
fn descendants_of(dev_inst: u32) -> Vec<u32> {
    let mut all = Vec::new();
    for child in children_of(dev_inst) {
        all.push(child);
        all.extend(descendants_of(child));
    }
    all
}

fn empty_devinfo() -> SP_DEVINFO_DATA {
    SP_DEVINFO_DATA {
        cbSize: std::mem::size_of::<SP_DEVINFO_DATA>() as u32,
        ClassGuid: GUID { data1: 0, data2: 0, data3: 0, data4: [0; 8] },
        DevInst: 0,
        Reserved: 0,
    }
}

fn device_id(dev_inst: u32) -> String {
    let mut buffer = [0u16; 512];
    let ret =
        unsafe { CM_Get_Device_IDW(dev_inst, buffer.as_mut_ptr(), buffer.len() as u32, 0) };
    if ret != CR_SUCCESS {
        return String::new();
    }
    utf16_until_nul(&buffer)
}

fn registry_property(dev_info: HDEVINFO, data: &mut SP_DEVINFO_DATA, property: u32) -> String {
    let mut buffer = [0u16; 1024];
    let mut required = 0u32;
    let ok = unsafe {
        SetupDiGetDeviceRegistryPropertyW(
            dev_info,
            data,
            property,
            std::ptr::null_mut(),
            buffer.as_mut_ptr() as *mut u8,
            (buffer.len() * 2) as u32,
            &mut required,
        )
    };
    if ok == 0 {
        return String::new();
    }
    utf16_until_nul(&buffer)
}

/// Looks a bare instance up in the all-classes device list to fetch a
/// registry property.
fn instance_property(dev_inst: u32, property: u32) -> Option<String> {
    let dev_info = unsafe {
        SetupDiGetClassDevsW(
            std::ptr::null(),
            std::ptr::null(),
            std::ptr::null_mut(),
            DIGCF_PRESENT | DIGCF_ALLCLASSES,
        )
    };
    if dev_info == INVALID_HANDLE_VALUE {
        return None;
    }

    let mut result = None;
    let mut index = 0u32;
    loop {
        let mut data = empty_devinfo();
        if unsafe { SetupDiEnumDeviceInfo(dev_info, index, &mut data) } == 0 {
            break;
        }
        index += 1;
        if data.DevInst == dev_inst {
            let value = registry_property(dev_info, &mut data, property);
            if !value.is_empty() {
                result = Some(value);
            }
            break;
        }
    }
    unsafe { SetupDiDestroyDeviceInfoList(dev_info) };
    result
}

fn hardware_id_of(dev_inst: u32) -> String {
    instance_property(dev_inst, SPDRP_HARDWAREID).unwrap_or_default()
}

fn friendly_name_of(dev_inst: u32) -> Option<String> {
    instance_property(dev_inst, SPDRP_FRIENDLYNAME)
}

/// COM label for a Ports-class instance, parsed from its friendly name.
fn com_port_for_instance(instance_id: &str) -> Option<String> {
    let dev_info = unsafe {
        SetupDiGetClassDevsW(
            &GUID_DEVCLASS_PORTS,
            std::ptr::null(),
            std::ptr::null_mut(),
            DIGCF_PRESENT,
        )
    };
    if dev_info == INVALID_HANDLE_VALUE {
        return None;
    }

    let target_tail = instance_tail(instance_id);
    let mut result = None;
    let mut index = 0u32;
    loop {
        let mut data = empty_devinfo();
        if unsafe { SetupDiEnumDeviceInfo(dev_info, index, &mut data) } == 0 {
            break;
        }
        index += 1;

        let port_instance = device_id(data.DevInst);
        let hardware_id = registry_property(dev_info, &mut data, SPDRP_HARDWAREID);
        let serial_match = vid_pid_from_hardware_id(&hardware_id)
            .map(|(v, p)| is_known_serial(&v, &p))
            .unwrap_or(false);
        if instance_tail(&port_instance) != target_tail && !serial_match {
            continue;
        }

        let friendly = registry_property(dev_info, &mut data, SPDRP_FRIENDLYNAME);
        if let Some(com) = parse_com_port(&friendly) {
            result = Some(com);
            break;
        }
    }
    unsafe { SetupDiDestroyDeviceInfoList(dev_info) };
    result
}

/// Last backslash-separated component of a device instance ID.
fn instance_tail(instance_id: &str) -> &str {
    instance_id.rsplit('\\').next().unwrap_or(instance_id)
}

/// Resolves a HID instance to the `\\?\hid#...` interface path that
/// `CreateFile`/hidapi accept.
fn hid_interface_path_for(instance_id: &str) -> Option<String> {
    let dev_info = unsafe {
        SetupDiGetClassDevsW(
            &GUID_DEVINTERFACE_HID,
            std::ptr::null(),
            std::ptr::null_mut(),
            DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
        )
    };
    if dev_info == INVALID_HANDLE_VALUE {
        return None;
    }

    // Interface paths swap separators; compare case-insensitively on the
    // normalized instance.
    let needle = instance_id.to_uppercase().replace('\\', "#");
    let mut result = None;
    let mut index = 0u32;
    loop {
        let mut iface = SP_DEVICE_INTERFACE_DATA {
            cbSize: std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            InterfaceClassGuid: GUID { data1: 0, data2: 0, data3: 0, data4: [0; 8] },
            Flags: 0,
            Reserved: 0,
        };
        let ok = unsafe {
            SetupDiEnumDeviceInterfaces(
                dev_info,
                std::ptr::null(),
                &GUID_DEVINTERFACE_HID,
                index,
                &mut iface,
            )
        };
        if ok == 0 {
            break;
        }
        index += 1;

        if let Some(path) = interface_detail(dev_info, &mut iface) {
            if path.to_uppercase().contains(&needle) {
                result = Some(path);
                break;
            }
        }
    }
    unsafe { SetupDiDestroyDeviceInfoList(dev_info) };
    result
}

fn interface_detail(dev_info: HDEVINFO, iface: &mut SP_DEVICE_INTERFACE_DATA) -> Option<String> {
    let mut required = 0u32;
    unsafe {
        SetupDiGetDeviceInterfaceDetailW(
            dev_info,
            iface,
            std::ptr::null_mut(),
            0,
            &mut required,
            std::ptr::null_mut(),
        )
    };
    if required == 0 {
        return None;
    }

    let mut buffer = vec![0u8; required as usize];
    let detail = buffer.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
    unsafe {
        // cbSize is the fixed header size, not the allocation size.
        (*detail).cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
        if SetupDiGetDeviceInterfaceDetailW(
            dev_info,
            iface,
            detail,
            required,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        ) == 0
        {
            return None;
        }
        let path_ptr = (*detail).DevicePath.as_ptr();
        let mut len = 0usize;
        while *path_ptr.add(len) != 0 {
            len += 1;
        }
        Some(String::from_utf16_lossy(std::slice::from_raw_parts(path_ptr, len)))
    }
}

/// COM ports with known serial VID/PIDs via the system serial registry,
/// emitted without a port chain so the correlator treats them as fallback.
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

fn utf16_until_nul(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|c| *c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}
