#![cfg_attr(docsrs, feature(doc_cfg))]
//! `openterface-core`: the device-management core of an Openterface KVM
//! host application.
//!
//! One physical Openterface unit shows up as up to four OS devices — a
//! serial control port, an HID register channel into the video bridge chip,
//! a UVC camera, and a USB audio endpoint — and on USB 3.0 the serial half
//! lives at a *different* bus address than the rest. This crate finds those
//! pieces, stitches them back into one logical [`DeviceInfo`], watches them
//! come and go, and speaks the bridge chip's feature-report register
//! protocol.
//!
//! # Platform support
//! - **Linux**: libudev scans (`usb`, `hidraw`, `tty`, `video4linux`,
//!   `sound`) with a serial-registry fallback.
//! - **Windows**: SetupAPI / cfgmgr32 device-tree walks with the canonical
//!   port-chain format existing deployments persist.
//!
//! # Quick start
//! ```no_run
//! use openterface_core::{init, HidTransport};
//!
//! let manager = init();
//! for device in manager.discover() {
//!     println!("{}: {}", device.display_name(), device.interface_summary());
//! }
//!
//! // Watch for plug/unplug and bind the register transport to whatever
//! // arrives.
//! manager.hotplug().start(2000);
//! let transport = HidTransport::new(manager.clone());
//! if let Some(device) = manager.first_available() {
//!     transport.switch_to_hid_by_port_chain(&device.port_chain);
//!     transport.start();
//! }
//! ```
//!
//! # Modules
//! - [`portchain`] — port-chain identity predicates
//! - [`device`] — the logical device record
//! - [`chip`] — chip types and the VID/PID generation table
//! - [`backends`] — platform enumerators producing raw interface records
//! - [`correlator`] — raw records → logical devices
//! - [`manager`] — discovery cache, selection, queries
//! - [`hotplug`] — snapshot polling and event fan-out
//! - [`transport`] — HID feature-report register channel and EEPROM access
//! - [`adapters`] — camera / HID / serial hotplug state machines
//! - [`settings`] — the one persisted setting (current port chain)
//!
//! ## Threading
//! Discovery and the two pollers run on worker threads; nothing here blocks
//! a UI thread unless the cache is stone cold. [`DeviceManager`] is a
//! cloneable handle — pass a clone to each subsystem instead of reaching
//! for a global.

pub mod adapters;
pub mod backends;
pub mod chip;
pub mod correlator;
pub mod device;
pub mod events;
pub mod hotplug;
pub mod manager;
pub mod portchain;
pub mod settings;
pub mod snapshot;
pub mod transport;

/// Error and Result types for the crate.
pub mod error {
    //! Error and result types used across the core.
    //!
    //! Most failures here are *conditions*, not exceptions: a lookup that
    //! matches nothing returns an empty list, a failed register read
    //! surfaces as a default value plus a log line. [`Error`] covers the
    //! cases callers genuinely need to branch on.

    /// Crate-wide error type.
    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        /// OS enumeration failed wholesale (udev/SetupAPI unavailable or a
        /// scan call errored). Callers keep their previous device list.
        #[error("device discovery failed: {0}")]
        Discovery(String),

        /// The OS refused to open the chosen HID path after retries.
        #[error("HID open failed: {0}")]
        HidOpen(String),

        /// A feature-report exchange failed after its framing fallbacks.
        #[error("HID report I/O failed: {0}")]
        HidIo(String),

        /// An EEPROM byte read kept failing past its retry budget; the
        /// whole read is aborted.
        #[error("EEPROM read failed at 0x{addr:04X}")]
        EepromRead { addr: u16 },

        /// An EEPROM byte write failed; there is no per-byte retry on the
        /// write path.
        #[error("EEPROM write failed at 0x{addr:04X}")]
        EepromWrite { addr: u16 },

        /// The persisted-settings file could not be written or serialized.
        #[error("settings: {0}")]
        Settings(String),
    }

    /// Convenient crate-wide result alias.
    pub type Result<T> = core::result::Result<T, Error>;
}

pub use chip::ChipType;
pub use device::DeviceInfo;
pub use error::{Error, Result};
pub use hotplug::HotplugMonitor;
pub use manager::DeviceManager;
pub use snapshot::DeviceChangeEvent;
pub use transport::{FirmwareResult, HidTransport};

/// Initializes the core for the build platform and returns the process
/// handle everything else hangs off. There is no hidden global: clone the
/// handle into each subsystem.
pub fn init() -> DeviceManager {
    DeviceManager::new()
}

// A tiny prelude for downstreams.
pub mod prelude {
    pub use crate::adapters::{CameraAdapter, CameraBackend, HidAdapter, SerialAdapter, SerialOwner};
    pub use crate::chip::ChipType;
    pub use crate::device::DeviceInfo;
    pub use crate::events::{DeviceChangeListener, StatusEventListener};
    pub use crate::manager::DeviceManager;
    pub use crate::snapshot::DeviceChangeEvent;
    pub use crate::transport::{FirmwareResult, HidTransport};
    pub use crate::{init, Error, Result};
}
