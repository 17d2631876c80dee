//! Camera adapter: routes hotplug events to the external capture backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::adapters::defer;
use crate::device::DeviceInfo;
use crate::events::{DeviceChangeListener, ListenerId};
use crate::hotplug::HotplugMonitor;

/// The video-capture collaborator (FFmpeg/GStreamer/whatever the host app
/// uses). The core never captures video itself; it only tells the backend
/// which node to use and when.
pub trait CameraBackend: Send {
    /// Points the backend at a camera node before starting capture.
    fn set_device(&mut self, path: &str, port_chain: &str);
    /// Starts capture on the configured node.
    fn start_capture(&mut self) -> bool;
    /// Stops capture and releases the node.
    fn stop_capture(&mut self);
    /// Fallback lookup when a device record lacks a camera path but the OS
    /// still reports an Openterface camera.
    fn find_system_camera(&self) -> Option<String> {
        None
    }
}

struct CameraShared {
    backend: Mutex<Box<dyn CameraBackend>>,
    current_port_chain: Mutex<String>,
    active: AtomicBool,
}

pub struct CameraAdapter {
    shared: Arc<CameraShared>,
}

impl CameraAdapter {
    pub fn new(backend: Box<dyn CameraBackend>) -> Self {
        CameraAdapter {
            shared: Arc::new(CameraShared {
                backend: Mutex::new(backend),
                current_port_chain: Mutex::new(String::new()),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Registers this adapter on the monitor; events are deferred off the
    /// hotplug thread before touching the backend.
    pub fn attach(&self, monitor: &HotplugMonitor) -> ListenerId {
        monitor.add_listener(Box::new(CameraListener { shared: Arc::clone(&self.shared) }))
    }

    pub fn current_port_chain(&self) -> String {
        self.shared.current_port_chain.lock().unwrap().clone()
    }

    pub fn set_current_port_chain(&self, port_chain: &str) {
        *self.shared.current_port_chain.lock().unwrap() = port_chain.to_string();
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Synchronous activation path; the hotplug listener defers onto this.
    fn activate(shared: &CameraShared, device: &DeviceInfo) {
        let path = if device.has_camera() {
            Some(device.camera_device_path.clone())
        } else {
            // Record has no camera slot: ask the backend whether the OS
            // still sees an Openterface camera node.
            shared.backend.lock().unwrap().find_system_camera()
        };
        let Some(path) = path else {
            debug!("no camera node for device at {}", device.port_chain);
            return;
        };

        let mut backend = shared.backend.lock().unwrap();
        backend.set_device(&path, &device.port_chain);
        if backend.start_capture() {
            *shared.current_port_chain.lock().unwrap() = device.port_chain.clone();
            shared.active.store(true, Ordering::SeqCst);
            info!("camera capture started on {path} (port {})", device.port_chain);
        } else {
            debug!("camera backend failed to start capture on {path}");
        }
    }

    /// Synchronous deactivation path.
    fn deactivate(shared: &CameraShared) {
        shared.backend.lock().unwrap().stop_capture();
        shared.current_port_chain.lock().unwrap().clear();
        shared.active.store(false, Ordering::SeqCst);
        info!("camera capture stopped");
    }
}

struct CameraListener {
    shared: Arc<CameraShared>,
}

impl DeviceChangeListener for CameraListener {
    fn on_device_unplugged(&mut self, device: &DeviceInfo) {
        let current = self.shared.current_port_chain.lock().unwrap().clone();
        if current.is_empty() || current != device.port_chain {
            return;
        }
        debug!("camera device at {} unplugged, scheduling stop", device.port_chain);
        let shared = Arc::clone(&self.shared);
        defer(move || CameraAdapter::deactivate(&shared));
    }

    fn on_new_device_plugged_in(&mut self, device: &DeviceInfo) {
        if self.shared.active.load(Ordering::SeqCst) {
            debug!("camera already active, ignoring device at {}", device.port_chain);
            return;
        }
        let shared = Arc::clone(&self.shared);
        let device = device.clone();
        defer(move || CameraAdapter::activate(&shared, &device));
    }
}
