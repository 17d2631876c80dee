//! Hotplug-driven subsystem adapters.
//!
//! Each adapter is a small state machine registered as a listener on the
//! [`HotplugMonitor`](crate::hotplug::HotplugMonitor). It owns a "current
//! port chain" and activates or deactivates its subsystem when a matching
//! device arrives or leaves. Heavy work is always deferred onto a worker
//! thread — the hotplug tick must never block on a subsystem.

pub mod camera;
pub mod hid;
pub mod serial;

pub use camera::{CameraAdapter, CameraBackend};
pub use hid::HidAdapter;
pub use serial::{SerialAdapter, SerialOwner};

use std::thread;
use std::time::Duration;

/// Runs `work` off the calling (hotplug) thread, the 0-delay-timer idiom.
pub(crate) fn defer(work: impl FnOnce() + Send + 'static) {
    if let Err(err) = thread::Builder::new().name("opf-deferred".into()).spawn(work) {
        log::warn!("failed to defer adapter work: {err}");
    }
}

/// Runs `work` off the calling thread after `delay`.
pub(crate) fn defer_after(delay: Duration, work: impl FnOnce() + Send + 'static) {
    defer(move || {
        thread::sleep(delay);
        work();
    });
}
