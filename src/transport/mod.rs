//! HID register-channel transport.
//!
//! [`HidTransport`] owns one OS handle onto the bridge chip's HID control
//! interface and speaks the feature-report register protocol over it:
//! 8-bit register reads/writes, EEPROM access for firmware update, and the
//! 1 Hz status poll that publishes input resolution and the hardware switch
//! state.
//!
//! ## Transaction discipline
//! A *transaction* is the open state of the handle. `begin_transaction`
//! opens (or confirms) the handle, `end_transaction` closes it. The status
//! poller runs inside one long-lived transaction; one-shot calls outside it
//! open and close around themselves. All register traffic is serialized by
//! the transport mutex — no exchange overlaps another.
//!
//! ## Failure policy
//! A failed open is retried three times with a 100 ms back-off and then
//! reported. A failed register read yields 0 for that byte and is logged;
//! the poll tick carries on. Chip detection runs on every fresh open and
//! falls back to the previously detected type when the path is inconclusive.

pub mod protocol;

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hidapi::HidApi;
use log::{debug, info, warn};

use crate::chip::ChipType;
use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::events::{ListenerId, ListenerSet, StatusEventListener};
use crate::manager::DeviceManager;
use self::protocol::*;

/// Status poll period.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// Open retries and back-off inside `begin_transaction`.
const OPEN_RETRIES: usize = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Settle delay after a fresh open.
const SETTLE_DELAY: Duration = Duration::from_millis(100);
/// How long a resolved HID path stays cached.
const PATH_CACHE_TTL: Duration = Duration::from_secs(10);
/// HID-node resolution retries after a plug-in event.
const RESOLVE_RETRIES: usize = 3;
const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(200);
/// EEPROM pacing.
const EEPROM_READ_RETRIES: usize = 3;
const EEPROM_RETRY_DELAY: Duration = Duration::from_millis(15);
const EEPROM_READ_PACE: Duration = Duration::from_millis(5);
const EEPROM_WRITE_GROUP: usize = 16;
const EEPROM_WRITE_GROUP_PACE: Duration = Duration::from_millis(150);

/// Outcome of the external firmware-update checker. The network transfer
/// itself lives outside the core; these are the classifications its
/// collaborators report back through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareResult {
    /// Installed firmware matches the published version.
    Latest,
    /// A newer image is available.
    Upgradable,
    /// The check timed out; no partial result is kept.
    Timeout,
    /// The check failed outright (network or TLS unavailable).
    CheckFailed,
}

/// Raw feature-report exchange with one open HID handle. The production
/// implementation wraps `hidapi`; tests substitute a scripted register
/// file.
pub(crate) trait FeatureReportChannel: Send {
    fn send_report(&mut self, report: &[u8]) -> Result<()>;
    fn get_report(&mut self, buf: &mut [u8]) -> Result<usize>;
}

struct HidapiChannel {
    device: hidapi::HidDevice,
}

impl FeatureReportChannel for HidapiChannel {
    fn send_report(&mut self, report: &[u8]) -> Result<()> {
        self.device
            .send_feature_report(report)
            .map_err(|err| Error::HidIo(err.to_string()))
    }

    fn get_report(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.device
            .get_feature_report(buf)
            .map_err(|err| Error::HidIo(err.to_string()))
    }
}

/// Opens a [`FeatureReportChannel`] for a device path.
pub(crate) trait HidOpener: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn FeatureReportChannel>>;
}

struct HidapiOpener;

impl HidOpener for HidapiOpener {
    fn open(&self, path: &str) -> Result<Box<dyn FeatureReportChannel>> {
        let cpath = CString::new(path).map_err(|_| Error::HidOpen(format!("bad path {path:?}")))?;
        let api = HidApi::new_without_enumerate().map_err(|err| Error::HidOpen(err.to_string()))?;
        let device = api
            .open_path(&cpath)
            .map_err(|err| Error::HidOpen(format!("{path}: {err}")))?;
        Ok(Box::new(HidapiChannel { device }))
    }
}

struct TransportState {
    channel: Option<Box<dyn FeatureReportChannel>>,
    in_transaction: bool,
    chip: ChipType,
    current_path: String,
    current_port_chain: String,
    cached_path: Option<(String, Instant)>,
    firmware_version: String,
    hard_switch_on_target: bool,
    last_width: u16,
    last_height: u16,
}

/// Events computed during a poll tick, emitted after the transport mutex is
/// released.
enum StatusEvent {
    ResolutionChanged(u16, u16, u16, u16),
    ResolutionUpdate(u16, u16, f32, f32),
    SwitchToggle(bool),
}

pub struct HidTransport {
    manager: DeviceManager,
    opener: Box<dyn HidOpener>,
    /// Weak self-handle for the poll thread; set at construction.
    self_ref: Weak<HidTransport>,
    state: Mutex<TransportState>,
    listeners: Mutex<ListenerSet<dyn StatusEventListener>>,
    polling: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
    poll_stop: Arc<(Mutex<bool>, Condvar)>,
}

impl HidTransport {
    pub fn new(manager: DeviceManager) -> Arc<Self> {
        Self::with_opener(manager, Box::new(HidapiOpener))
    }

    pub(crate) fn with_opener(manager: DeviceManager, opener: Box<dyn HidOpener>) -> Arc<Self> {
        Arc::new_cyclic(|weak| HidTransport {
            manager,
            opener,
            self_ref: weak.clone(),
            state: Mutex::new(TransportState {
                channel: None,
                in_transaction: false,
                chip: ChipType::Unknown,
                current_path: String::new(),
                current_port_chain: String::new(),
                cached_path: None,
                firmware_version: String::new(),
                hard_switch_on_target: false,
                last_width: 0,
                last_height: 0,
            }),
            listeners: Mutex::new(ListenerSet::new()),
            polling: AtomicBool::new(false),
            poller: Mutex::new(None),
            poll_stop: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }

    pub fn add_status_listener(&self, listener: Box<dyn StatusEventListener>) -> ListenerId {
        self.listeners.lock().unwrap().add(listener)
    }

    pub fn remove_status_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(id);
    }

    fn emit(&self, mut visit: impl FnMut(&mut dyn StatusEventListener)) {
        self.listeners.lock().unwrap().for_each(|listener| visit(listener));
    }

    // ---- transaction discipline ----

    /// Opens the OS handle (true if already open). Retries the open up to
    /// three times with a short back-off, lets the device settle, and runs
    /// chip detection against the fresh path.
    pub fn begin_transaction(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.begin_locked(&mut state)
    }

    fn begin_locked(&self, state: &mut TransportState) -> bool {
        if state.in_transaction {
            return true;
        }
        if state.current_path.is_empty() {
            warn!("cannot open HID transaction: no device path bound");
            return false;
        }
        for attempt in 0..OPEN_RETRIES {
            if attempt > 0 {
                thread::sleep(OPEN_RETRY_DELAY);
            }
            match self.opener.open(&state.current_path) {
                Ok(channel) => {
                    state.channel = Some(channel);
                    state.in_transaction = true;
                    // Fresh open: re-detect, never trust cached state.
                    Self::detect_chip_locked(state);
                    thread::sleep(SETTLE_DELAY);
                    debug!("HID transaction started on {}", state.current_path);
                    return true;
                }
                Err(err) => {
                    debug!("open attempt {} failed: {err}", attempt + 1);
                }
            }
        }
        warn!(
            "failed to open HID device {} after {OPEN_RETRIES} attempts",
            state.current_path
        );
        false
    }

    /// Closes the OS handle. Safe to call when no transaction is open.
    pub fn end_transaction(&self) {
        let mut state = self.state.lock().unwrap();
        Self::end_locked(&mut state);
    }

    fn end_locked(state: &mut TransportState) {
        if state.in_transaction || state.channel.is_some() {
            state.channel = None;
            state.in_transaction = false;
            debug!("HID transaction ended");
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }

    /// Chip detection from the bound device path. Inconclusive paths keep
    /// the previously detected type.
    fn detect_chip_locked(state: &mut TransportState) {
        let previous = state.chip;
        match detect_chip_from_path(&state.current_path) {
            Some(chip) => state.chip = chip,
            None => {
                debug!("unknown chipset in device path {}", state.current_path);
                if previous != ChipType::Unknown {
                    state.chip = previous;
                }
            }
        }
        if previous != state.chip {
            info!("chip type changed from {previous} to {}", state.chip);
        }
    }

    pub fn chip_type(&self) -> ChipType {
        self.state.lock().unwrap().chip
    }

    // ---- register access ----

    /// Reads the 8-bit register at `addr` using the framing of the detected
    /// chip. Opens a short-lived transaction when none is active.
    pub fn read_u8(&self, addr: u16) -> Result<u8> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let result = Self::exchange_read(&mut state, addr);
        if !was_open {
            Self::end_locked(&mut state);
        }
        result
    }

    /// Writes the 8-bit register at `addr`. The upper three data bytes of
    /// the frame stay zero.
    pub fn write_u8(&self, addr: u16, value: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let result = Self::exchange_write(&mut state, addr, [value, 0, 0, 0]);
        if !was_open {
            Self::end_locked(&mut state);
        }
        result
    }

    fn channel_of(state: &mut TransportState) -> Result<&mut Box<dyn FeatureReportChannel>> {
        state
            .channel
            .as_mut()
            .ok_or_else(|| Error::HidIo("no open HID handle".to_string()))
    }

    fn send_with_retry(channel: &mut dyn FeatureReportChannel, frame: &[u8]) -> Result<()> {
        let mut last = None;
        for _ in 0..2 {
            match channel.send_report(frame) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!("retrying feature-report send: {err}");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::HidIo("send failed".to_string())))
    }

    fn exchange_read(state: &mut TransportState, addr: u16) -> Result<u8> {
        let chip = state.chip;
        let channel = Self::channel_of(state)?;
        match chip {
            ChipType::Ms2130s => {
                for frame in ms2130s_read_reports(addr) {
                    if Self::send_with_retry(channel.as_mut(), &frame).is_err() {
                        continue;
                    }
                    let mut buf = vec![0u8; frame.len()];
                    buf[0] = frame[0]; // report ID must be preserved
                    if channel.get_report(&mut buf).is_ok() {
                        return Ok(buf[RESPONSE_DATA_INDEX]);
                    }
                }
                Err(Error::HidIo(format!("MS2130S read failed at 0x{addr:04X}")))
            }
            _ => {
                // Report ID 0 first; some stacks insist on ID 1.
                for report_id in [0u8, 1u8] {
                    let mut frame = ms2109_read_report(addr);
                    frame[0] = report_id;
                    if Self::send_with_retry(channel.as_mut(), &frame).is_err() {
                        continue;
                    }
                    let mut buf = vec![0u8; MS2109_REPORT_LEN];
                    buf[0] = report_id;
                    if channel.get_report(&mut buf).is_ok() {
                        return Ok(buf[RESPONSE_DATA_INDEX]);
                    }
                }
                Err(Error::HidIo(format!("MS2109 read failed at 0x{addr:04X}")))
            }
        }
    }

    fn exchange_write(state: &mut TransportState, addr: u16, data: [u8; 4]) -> Result<()> {
        let chip = state.chip;
        let channel = Self::channel_of(state)?;
        match chip {
            ChipType::Ms2130s => {
                let mut last = None;
                for frame in ms2130s_write_reports(addr, data) {
                    match Self::send_with_retry(channel.as_mut(), &frame) {
                        Ok(()) => return Ok(()),
                        Err(err) => last = Some(err),
                    }
                }
                Err(last.unwrap_or_else(|| Error::HidIo("write failed".to_string())))
            }
            _ => Self::send_with_retry(channel.as_mut(), &ms2109_write_report(addr, data)),
        }
    }

    /// Read with the poll-tick failure policy: a failed byte is logged and
    /// reported as 0.
    fn safe_read(state: &mut TransportState, addr: u16) -> u8 {
        match Self::exchange_read(state, addr) {
            Ok(value) => value,
            Err(err) => {
                warn!("HID read failed at 0x{addr:04X}, returning 0: {err}");
                0
            }
        }
    }

    // ---- one-shot status reads ----

    /// Input resolution (width, height), corrections applied.
    pub fn resolution(&self) -> Result<(u16, u16)> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let regs = registers(state.chip);
        let width = combine_u16(
            Self::safe_read(&mut state, regs.input_width_h),
            Self::safe_read(&mut state, regs.input_width_l),
        );
        let height = combine_u16(
            Self::safe_read(&mut state, regs.input_height_h),
            Self::safe_read(&mut state, regs.input_height_l),
        );
        let pixclk = combine_scaled(
            Self::safe_read(&mut state, regs.input_pixelclk_h),
            Self::safe_read(&mut state, regs.input_pixelclk_l),
        );
        let (width, height) = correct_resolution(state.chip, width, height, pixclk);
        if !was_open {
            Self::end_locked(&mut state);
        }
        Ok((width, height))
    }

    /// Input frame rate.
    pub fn fps(&self) -> Result<f32> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let regs = registers(state.chip);
        let fps = combine_scaled(
            Self::safe_read(&mut state, regs.input_fps_h),
            Self::safe_read(&mut state, regs.input_fps_l),
        );
        if !was_open {
            Self::end_locked(&mut state);
        }
        Ok(fps)
    }

    /// Input pixel clock in MHz.
    pub fn pixel_clock(&self) -> Result<f32> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let regs = registers(state.chip);
        let clk = combine_scaled(
            Self::safe_read(&mut state, regs.input_pixelclk_h),
            Self::safe_read(&mut state, regs.input_pixelclk_l),
        );
        if !was_open {
            Self::end_locked(&mut state);
        }
        Ok(clk)
    }

    /// Hardware switch direction: GPIO0 bit 0, true = target.
    pub fn gpio0(&self) -> Result<bool> {
        let regs_addr = registers(self.chip_type()).gpio0;
        Ok(self.read_u8(regs_addr)? & 0x01 != 0)
    }

    /// Soft switch state from the SPDIFOUT register, honoring the
    /// firmware-dependent bit position.
    pub fn spdifout(&self) -> Result<bool> {
        let (addr, bit) = {
            let state = self.state.lock().unwrap();
            let (bit, _mask) = spdif_bit_mask(&state.firmware_version);
            (registers(state.chip).spdifout, bit)
        };
        Ok(self.read_u8(addr)? & bit != 0)
    }

    /// HDMI source presence bit.
    pub fn hdmi_connected(&self) -> Result<bool> {
        let addr = registers(self.chip_type()).hdmi_connection_status;
        Ok(self.read_u8(addr)? & 0x01 != 0)
    }

    /// Drives the SPDIFOUT soft switch (read-modify-write of the moved
    /// bit).
    pub fn set_spdifout(&self, enable: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let result = Self::set_spdifout_locked(&mut state, enable);
        if !was_open {
            Self::end_locked(&mut state);
        }
        result
    }

    fn set_spdifout_locked(state: &mut TransportState, enable: bool) -> Result<()> {
        let addr = registers(state.chip).spdifout;
        let (bit, mask) = spdif_bit_mask(&state.firmware_version);
        let mut value = Self::safe_read(state, addr);
        if enable {
            value |= bit;
        } else {
            value &= mask;
        }
        Self::exchange_write(state, addr, [value, 0, 0, 0])
    }

    /// Routes the switchable USB port to the host side.
    pub fn switch_to_host(&self) -> Result<()> {
        debug!("switching USB to host");
        self.set_spdifout(false)?;
        self.emit(|l| l.on_switchable_usb_toggle(false));
        Ok(())
    }

    /// Routes the switchable USB port to the target side.
    pub fn switch_to_target(&self) -> Result<()> {
        debug!("switching USB to target");
        self.set_spdifout(true)?;
        self.emit(|l| l.on_switchable_usb_toggle(true));
        Ok(())
    }

    /// Eight-digit firmware version captured at `start`, empty before.
    pub fn firmware_version(&self) -> String {
        self.state.lock().unwrap().firmware_version.clone()
    }

    /// Reads the firmware version registers now (transaction-bracketed) and
    /// caches the result.
    pub fn read_firmware_version(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let was_open = state.in_transaction;
        if !was_open && !self.begin_locked(&mut state) {
            return Err(Error::HidOpen(state.current_path.clone()));
        }
        let regs = registers(state.chip);
        let groups = [
            Self::safe_read(&mut state, regs.firmware_version_0),
            Self::safe_read(&mut state, regs.firmware_version_1),
            Self::safe_read(&mut state, regs.firmware_version_2),
            Self::safe_read(&mut state, regs.firmware_version_3),
        ];
        if !was_open {
            Self::end_locked(&mut state);
        }
        let version = format_firmware_version(groups);
        state.firmware_version = version.clone();
        Ok(version)
    }

    // ---- status polling ----

    /// Opens the long-lived transaction, captures the firmware version and
    /// initial switch state, and starts the 1 Hz status poll. Returns false
    /// when the device cannot be opened.
    pub fn start(&self) -> bool {
        if self.polling.swap(true, Ordering::SeqCst) {
            debug!("transport already started, ignoring duplicate start");
            return true;
        }

        // Late bind: a port chain set before start resolves to a node now.
        {
            let port_chain = self.state.lock().unwrap().current_port_chain.clone();
            if !port_chain.is_empty() {
                if let Some(path) = self.find_matching_hid_device(&port_chain) {
                    let mut state = self.state.lock().unwrap();
                    state.current_path = path;
                    Self::detect_chip_locked(&mut state);
                }
            }
        }

        if !self.begin_transaction() {
            warn!("failed to open HID device for continuous monitoring");
            self.polling.store(false, Ordering::SeqCst);
            return false;
        }

        let version = self.read_firmware_version().unwrap_or_default();
        debug!("capture card firmware version: {version}");

        // Capture the initial switch state and align the soft switch with
        // it before the first tick.
        let gpio = self.gpio0().unwrap_or(false);
        debug!("initial hardware switch on target: {gpio}");
        let initial = self.spdifout().unwrap_or(false);
        {
            let mut state = self.state.lock().unwrap();
            state.hard_switch_on_target = initial;
        }
        self.emit(|l| l.on_switchable_usb_toggle(initial));
        if let Err(err) = self.set_spdifout(initial) {
            warn!("failed to align soft switch at start: {err}");
        }

        *self.poll_stop.0.lock().unwrap() = false;
        // The ticker holds a weak handle so dropping the last transport
        // reference ends polling instead of leaking the thread.
        let transport = self.self_ref.clone();
        let stop = Arc::clone(&self.poll_stop);
        let handle = thread::Builder::new().name("opf-hid-poll".into()).spawn(move || loop {
            let (flag, condvar) = &*stop;
            let guard = flag.lock().unwrap();
            let (guard, _) = condvar.wait_timeout(guard, POLL_INTERVAL).unwrap();
            if *guard {
                break;
            }
            drop(guard);
            let Some(transport) = transport.upgrade() else { break };
            transport.poll_tick();
        });
        match handle {
            Ok(handle) => {
                *self.poller.lock().unwrap() = Some(handle);
                info!("HID status polling started ({:?} interval)", POLL_INTERVAL);
                true
            }
            Err(err) => {
                warn!("failed to spawn HID poll thread: {err}");
                self.polling.store(false, Ordering::SeqCst);
                self.end_transaction();
                false
            }
        }
    }

    /// Stops the status poll and closes the handle, even mid-failure.
    pub fn stop(&self) {
        if self.polling.swap(false, Ordering::SeqCst) {
            {
                let (flag, condvar) = &*self.poll_stop;
                *flag.lock().unwrap() = true;
                condvar.notify_all();
            }
            if let Some(handle) = self.poller.lock().unwrap().take() {
                let _ = handle.join();
            }
            info!("HID status polling stopped");
        }
        self.end_transaction();
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// One status-poll pass. Public for force-refresh paths; the poll
    /// thread calls it every second.
    pub fn poll_tick(&self) {
        let mut events: Vec<StatusEvent> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if !state.in_transaction {
                return;
            }
            let regs = *registers(state.chip);

            let gpio_on_target = Self::safe_read(&mut state, regs.gpio0) & 0x01 != 0;
            let hdmi = Self::safe_read(&mut state, regs.hdmi_connection_status) & 0x01 != 0;

            if hdmi {
                let width = combine_u16(
                    Self::safe_read(&mut state, regs.input_width_h),
                    Self::safe_read(&mut state, regs.input_width_l),
                );
                let height = combine_u16(
                    Self::safe_read(&mut state, regs.input_height_h),
                    Self::safe_read(&mut state, regs.input_height_l),
                );
                let fps = combine_scaled(
                    Self::safe_read(&mut state, regs.input_fps_h),
                    Self::safe_read(&mut state, regs.input_fps_l),
                );
                let pixclk = combine_scaled(
                    Self::safe_read(&mut state, regs.input_pixelclk_h),
                    Self::safe_read(&mut state, regs.input_pixelclk_l),
                );
                let (width, height) = correct_resolution(state.chip, width, height, pixclk);

                if (state.last_width, state.last_height) != (width, height) {
                    events.push(StatusEvent::ResolutionChanged(
                        state.last_width,
                        state.last_height,
                        width,
                        height,
                    ));
                    state.last_width = width;
                    state.last_height = height;
                }
                events.push(StatusEvent::ResolutionUpdate(width, height, fps, pixclk));
            } else {
                events.push(StatusEvent::ResolutionUpdate(0, 0, 0.0, 0.0));
            }

            if gpio_on_target != state.hard_switch_on_target {
                events.push(StatusEvent::SwitchToggle(gpio_on_target));
                if let Err(err) = Self::set_spdifout_locked(&mut state, gpio_on_target) {
                    warn!("failed to follow hardware switch: {err}");
                }
                state.hard_switch_on_target = gpio_on_target;
            }
        }

        for event in events {
            match event {
                StatusEvent::ResolutionChanged(ow, oh, nw, nh) => {
                    self.emit(|l| l.on_input_resolution_changed(ow, oh, nw, nh))
                }
                StatusEvent::ResolutionUpdate(w, h, fps, clk) => {
                    self.emit(|l| l.on_resolution_change_update(w, h, fps, clk))
                }
                StatusEvent::SwitchToggle(on_target) => {
                    self.emit(|l| l.on_switchable_usb_toggle(on_target))
                }
            }
        }
    }

    // ---- EEPROM ----

    fn read_eeprom_byte(&self, addr: u16) -> Result<u8> {
        let mut state = self.state.lock().unwrap();
        let channel = Self::channel_of(&mut state)?;
        Self::send_with_retry(channel.as_mut(), &eeprom_read_report(addr))?;
        let mut buf = vec![0u8; MS2109_REPORT_LEN];
        channel.get_report(&mut buf)?;
        Ok(buf[RESPONSE_DATA_INDEX])
    }

    fn write_eeprom_byte(&self, addr: u16, byte: u8) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let channel = Self::channel_of(&mut state)?;
        Self::send_with_retry(channel.as_mut(), &eeprom_write_report(addr, byte))
    }

    /// Reads `size` EEPROM bytes starting at `base`, one byte per report,
    /// with per-byte retries and progress events. One transaction brackets
    /// the whole sequence.
    pub fn read_eeprom(&self, base: u16, size: u32) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let was_open = self.is_in_transaction();
        if !was_open && !self.begin_transaction() {
            let message = "failed to begin transaction for EEPROM read";
            self.emit(|l| l.on_firmware_read_error(message));
            return Err(Error::HidOpen(message.to_string()));
        }

        let mut data = Vec::with_capacity(size as usize);
        let mut outcome = Ok(());
        'bytes: for offset in 0..size {
            let addr = base.wrapping_add(offset as u16);
            let mut byte = None;
            for attempt in 0..EEPROM_READ_RETRIES {
                match self.read_eeprom_byte(addr) {
                    Ok(value) => {
                        byte = Some(value);
                        break;
                    }
                    Err(err) => {
                        debug!(
                            "EEPROM read retry {}/{} at 0x{addr:04X}: {err}",
                            attempt + 1,
                            EEPROM_READ_RETRIES
                        );
                        thread::sleep(EEPROM_RETRY_DELAY);
                    }
                }
            }
            match byte {
                Some(value) => {
                    data.push(value);
                    let read = data.len();
                    self.emit(|l| l.on_firmware_read_chunk(read));
                    let percent = (read as u32 * 100) / size;
                    self.emit(|l| l.on_firmware_read_progress(percent));
                    thread::sleep(EEPROM_READ_PACE);
                }
                None => {
                    outcome = Err(Error::EepromRead { addr });
                    break 'bytes;
                }
            }
        }

        if !was_open {
            self.end_transaction();
        }

        match outcome {
            Ok(()) => {
                self.emit(|l| l.on_firmware_read_complete(true));
                Ok(data)
            }
            Err(err) => {
                warn!("EEPROM read aborted: {err}");
                let message = err.to_string();
                self.emit(|l| l.on_firmware_read_error(&message));
                self.emit(|l| l.on_firmware_read_complete(false));
                Err(err)
            }
        }
    }

    /// Writes `data` to EEPROM starting at `base`, one byte per report in
    /// groups of sixteen with a pause between groups. There is no per-byte
    /// retry on this path: any failed byte aborts the sequence.
    pub fn write_eeprom(&self, base: u16, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let was_open = self.is_in_transaction();
        if !was_open && !self.begin_transaction() {
            self.emit(|l| l.on_firmware_write_complete(false));
            return Err(Error::HidOpen("failed to begin transaction for EEPROM write".to_string()));
        }

        let total = data.len();
        let mut written = 0usize;
        let mut outcome = Ok(());
        'groups: for group in data.chunks(EEPROM_WRITE_GROUP) {
            for byte in group {
                let addr = base.wrapping_add(written as u16);
                if let Err(err) = self.write_eeprom_byte(addr, *byte) {
                    warn!("EEPROM write failed at 0x{addr:04X}: {err}");
                    outcome = Err(Error::EepromWrite { addr });
                    break 'groups;
                }
                written += 1;
                self.emit(|l| l.on_firmware_write_chunk(written));
                let percent = (written * 100 / total) as u32;
                self.emit(|l| l.on_firmware_write_progress(percent));
            }
            thread::sleep(EEPROM_WRITE_GROUP_PACE);
        }

        if !was_open {
            self.end_transaction();
        }

        let ok = outcome.is_ok();
        self.emit(|l| l.on_firmware_write_complete(ok));
        outcome
    }

    /// Total firmware image size from the EEPROM header at address 0.
    pub fn read_firmware_size(&self) -> Result<u32> {
        let base = registers(self.chip_type()).eeprom_base;
        let header = self.read_eeprom(base, 4)?;
        let header: [u8; 4] = header
            .try_into()
            .map_err(|_| Error::EepromRead { addr: base })?;
        Ok(firmware_size_from_header(&header))
    }

    // ---- device binding ----

    /// Resolves the HID node for `port_chain` through the device manager,
    /// with a short-lived cache and retries to tolerate slow enumeration
    /// right after plug-in.
    pub fn find_matching_hid_device(&self, port_chain: &str) -> Option<String> {
        {
            let state = self.state.lock().unwrap();
            if let Some((path, at)) = &state.cached_path {
                if at.elapsed() < PATH_CACHE_TTL {
                    debug!("using cached HID device path {path}");
                    return Some(path.clone());
                }
            }
        }
        if port_chain.is_empty() {
            return None;
        }

        for attempt in 0..RESOLVE_RETRIES {
            if attempt > 0 {
                thread::sleep(RESOLVE_RETRY_DELAY);
                self.manager.force_refresh();
            }
            let devices = self.manager.devices_by_port_chain(port_chain);
            if let Some(device) = devices.iter().find(|d| d.has_hid()) {
                let path = device.hid_device_path.clone();
                let mut state = self.state.lock().unwrap();
                state.cached_path = Some((path.clone(), Instant::now()));
                return Some(path);
            }
            debug!(
                "no HID device for port chain {port_chain} (attempt {}/{RESOLVE_RETRIES})",
                attempt + 1
            );
        }
        warn!("no device with HID information found for port chain {port_chain}");
        None
    }

    pub fn clear_device_path_cache(&self) {
        self.state.lock().unwrap().cached_path = None;
    }

    pub fn current_hid_device_path(&self) -> String {
        self.state.lock().unwrap().current_path.clone()
    }

    pub fn current_hid_port_chain(&self) -> String {
        self.state.lock().unwrap().current_port_chain.clone()
    }

    /// Rebinds the transport to the device at `port_chain`.
    ///
    /// No-op when the resolved path is already bound. Otherwise any open
    /// transaction is closed, the path swapped, the transaction re-opened if
    /// one was active, chip detection re-run, and the change published.
    pub fn switch_to_hid_by_port_chain(&self, port_chain: &str) -> bool {
        if port_chain.is_empty() {
            warn!("cannot switch to HID device with empty port chain");
            return false;
        }
        self.clear_device_path_cache();
        let Some(target) = self.find_matching_hid_device(port_chain) else {
            warn!("no matching HID device for port chain {port_chain}");
            return false;
        };

        let previous_path;
        let previous_chain;
        {
            let mut state = self.state.lock().unwrap();
            if !state.current_path.is_empty() && state.current_path == target {
                debug!("already using HID device {target}, skipping switch");
                state.current_port_chain = port_chain.to_string();
                return true;
            }
            previous_path = state.current_path.clone();
            previous_chain = state.current_port_chain.clone();
            let was_open = state.in_transaction;
            if was_open {
                Self::end_locked(&mut state);
            }
            state.current_path = target.clone();
            state.current_port_chain = port_chain.to_string();
            state.cached_path = Some((target.clone(), Instant::now()));

            if was_open && !self.begin_locked(&mut state) {
                warn!("failed to re-open HID device after switch, reverting");
                state.current_path = previous_path;
                state.current_port_chain = previous_chain;
                return false;
            }
            Self::detect_chip_locked(&mut state);
        }

        // Remember the selection for the next session.
        self.manager.select(port_chain);

        self.emit(|l| l.on_hid_device_changed(&previous_path, &target));
        self.emit(|l| l.on_hid_device_connected(&target));
        if !previous_path.is_empty() {
            self.emit(|l| l.on_hid_device_disconnected(&previous_path));
        }
        info!("HID device switched to {target} (port chain {port_chain})");
        true
    }

    /// Binds to a port chain without resolving or opening yet; `start` will
    /// finish the job. Used when restoring a persisted selection.
    pub fn bind_port_chain(&self, port_chain: &str) {
        self.state.lock().unwrap().current_port_chain = port_chain.to_string();
    }

    /// Seeds the bound device from the manager's current selection.
    pub fn bind_selected_device(&self, device: &DeviceInfo) {
        let mut state = self.state.lock().unwrap();
        state.current_port_chain = device.port_chain.clone();
        if device.has_hid() {
            state.current_path = device.hid_device_path.clone();
            Self::detect_chip_locked(&mut state);
        }
    }

    /// Publishes a disconnect for a path that just went away; the HID
    /// adapter calls this after stopping the transport for an unplugged
    /// device.
    pub(crate) fn announce_disconnected(&self, path: &str) {
        if !path.is_empty() {
            self.emit(|l| l.on_hid_device_disconnected(path));
        }
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        // Handle closes with the transport even when a poll was left
        // running. The last reference may die on the poll thread itself, so
        // never join from there.
        self.polling.store(false, Ordering::SeqCst);
        {
            let (flag, condvar) = &*self.poll_stop;
            *flag.lock().unwrap() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.poller.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted HID channel shared by transport and adapter tests.

    use super::*;
    use crate::manager::testing::{manager_with, ScriptedEnumerator};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Register and EEPROM contents, shared across re-opens of the same
    /// mock device the way real hardware state persists.
    pub(crate) struct ChipStore {
        pub(crate) regs: HashMap<u16, u8>,
        pub(crate) eeprom: Vec<u8>,
    }

    impl ChipStore {
        fn new() -> Self {
            ChipStore { regs: HashMap::new(), eeprom: vec![0u8; 512] }
        }
    }

    /// One open channel onto the scripted chip.
    pub(crate) struct MockChip {
        chip: ChipType,
        store: Arc<StdMutex<ChipStore>>,
        pending: Option<(u8, u16)>, // (cmd, addr) awaiting get_report
        fail_sends: usize,
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl FeatureReportChannel for MockChip {
        fn send_report(&mut self, report: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(report.to_vec());
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(Error::HidIo("injected send failure".into()));
            }
            let cmd = report[1];
            let addr = combine_u16(report[2], report[3]);
            let expect_read = match self.chip {
                ChipType::Ms2130s => MS2130S_CMD_XDATA_READ,
                _ => MS2109_CMD_XDATA_READ,
            };
            let expect_write = match self.chip {
                ChipType::Ms2130s => MS2130S_CMD_XDATA_WRITE,
                _ => MS2109_CMD_XDATA_WRITE,
            };
            if cmd == expect_write {
                self.store.lock().unwrap().regs.insert(addr, report[4]);
            } else if cmd == MS2109_CMD_EEPROM_WRITE {
                self.store.lock().unwrap().eeprom[addr as usize] = report[4];
            } else if cmd == expect_read || cmd == MS2109_CMD_EEPROM_READ {
                self.pending = Some((cmd, addr));
            } else {
                return Err(Error::HidIo(format!("unexpected command 0x{cmd:02X}")));
            }
            Ok(())
        }

        fn get_report(&mut self, buf: &mut [u8]) -> Result<usize> {
            let (cmd, addr) = self
                .pending
                .take()
                .ok_or_else(|| Error::HidIo("get without pending read".into()))?;
            let store = self.store.lock().unwrap();
            let value = if cmd == MS2109_CMD_EEPROM_READ {
                store.eeprom[addr as usize]
            } else {
                *store.regs.get(&addr).unwrap_or(&0)
            };
            buf[RESPONSE_DATA_INDEX] = value;
            Ok(buf.len())
        }
    }

    pub(crate) struct MockOpener {
        chip: ChipType,
        store: Arc<StdMutex<ChipStore>>,
        pub(crate) fail_opens: StdMutex<usize>,
        pub(crate) fail_sends: usize,
        pub(crate) sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl MockOpener {
        pub(crate) fn quiet(chip: ChipType, seed: fn(&mut ChipStore)) -> Self {
            let mut store = ChipStore::new();
            seed(&mut store);
            MockOpener {
                chip,
                store: Arc::new(StdMutex::new(store)),
                fail_opens: StdMutex::new(0),
                fail_sends: 0,
                sent: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    impl HidOpener for MockOpener {
        fn open(&self, _path: &str) -> Result<Box<dyn FeatureReportChannel>> {
            let mut failures = self.fail_opens.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::HidOpen("injected open failure".into()));
            }
            Ok(Box::new(MockChip {
                chip: self.chip,
                store: Arc::clone(&self.store),
                pending: None,
                fail_sends: self.fail_sends,
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    pub(crate) fn no_seed(_store: &mut ChipStore) {}

    /// Transport with a mock chip and a pre-bound device path.
    pub(crate) fn transport_for(chip: ChipType, seed: fn(&mut ChipStore)) -> Arc<HidTransport> {
        let script = ScriptedEnumerator::new();
        script.push(Vec::new());
        let manager = manager_with(&script);
        let transport = HidTransport::with_opener(manager, Box::new(MockOpener::quiet(chip, seed)));
        {
            let mut state = transport.state.lock().unwrap();
            state.current_path = match chip {
                ChipType::Ms2130s => "hid-vid_345f&pid_2132".to_string(),
                _ => "hid-vid_534d&pid_2109".to_string(),
            };
        }
        transport
    }

    /// Mock MS2109 transport bound to a caller-supplied manager, with no
    /// device path pre-bound (adapters resolve it via the manager).
    pub(crate) fn mock_transport_gen1(manager: DeviceManager) -> Arc<HidTransport> {
        HidTransport::with_opener(
            manager,
            Box::new(MockOpener::quiet(ChipType::Ms2109, no_seed)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::manager::testing::{manager_with, ScriptedEnumerator};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn write_then_read_roundtrip_ms2109() {
        let transport = transport_for(ChipType::Ms2109, no_seed);
        assert!(transport.begin_transaction());
        assert_eq!(transport.chip_type(), ChipType::Ms2109);

        transport.write_u8(0xDF01, 0x5A).expect("write");
        assert_eq!(transport.read_u8(0xDF01).expect("read"), 0x5A);
        transport.end_transaction();
        assert!(!transport.is_in_transaction());
    }

    #[test]
    fn write_then_read_roundtrip_ms2130s() {
        let transport = transport_for(ChipType::Ms2130s, no_seed);
        assert!(transport.begin_transaction());
        assert_eq!(transport.chip_type(), ChipType::Ms2130s);

        transport.write_u8(0xC5A0, 0x07).expect("write");
        assert_eq!(transport.read_u8(0xC5A0).expect("read"), 0x07);
    }

    #[test]
    fn reads_outside_transaction_open_and_close() {
        let transport = transport_for(ChipType::Ms2109, no_seed);
        assert!(!transport.is_in_transaction());
        assert_eq!(transport.read_u8(0xC738).expect("read"), 0);
        // The short-lived transaction closed itself.
        assert!(!transport.is_in_transaction());
    }

    #[test]
    fn resolution_math_with_4k_correction() {
        fn seed(chip: &mut ChipStore) {
            let r = MS2109_REGISTERS;
            chip.regs.insert(r.input_width_h, 0x07);
            chip.regs.insert(r.input_width_l, 0x80); // 1920
            chip.regs.insert(r.input_height_h, 0x04);
            chip.regs.insert(r.input_height_l, 0x38); // 1080
            chip.regs.insert(r.input_fps_h, 0x17);
            chip.regs.insert(r.input_fps_l, 0x70); // 60.00
            chip.regs.insert(r.input_pixelclk_h, 0x52);
            chip.regs.insert(r.input_pixelclk_l, 0x08); // 210.00 MHz
            chip.regs.insert(r.hdmi_connection_status, 0x01);
        }

        let transport = transport_for(ChipType::Ms2109, seed);
        assert!(transport.begin_transaction());
        assert_eq!(transport.resolution().expect("resolution"), (3840, 2160));
        assert!((transport.fps().expect("fps") - 60.0).abs() < 0.001);
        assert!((transport.pixel_clock().expect("clk") - 210.0).abs() < 0.001);
        assert!(transport.hdmi_connected().expect("hdmi"));
    }

    #[test]
    fn poll_tick_publishes_corrected_resolution() {
        fn seed(chip: &mut ChipStore) {
            let r = MS2109_REGISTERS;
            chip.regs.insert(r.input_width_h, 0x07);
            chip.regs.insert(r.input_width_l, 0x80);
            chip.regs.insert(r.input_height_h, 0x04);
            chip.regs.insert(r.input_height_l, 0x38);
            chip.regs.insert(r.input_fps_h, 0x17);
            chip.regs.insert(r.input_fps_l, 0x70);
            chip.regs.insert(r.input_pixelclk_h, 0x52);
            chip.regs.insert(r.input_pixelclk_l, 0x08);
            chip.regs.insert(r.hdmi_connection_status, 0x01);
        }

        #[derive(Default)]
        struct Captured {
            updates: Vec<(u16, u16, f32, f32)>,
            changes: Vec<(u16, u16, u16, u16)>,
        }
        struct Capture(Arc<StdMutex<Captured>>);
        impl StatusEventListener for Capture {
            fn on_resolution_change_update(&mut self, w: u16, h: u16, fps: f32, clk: f32) {
                self.0.lock().unwrap().updates.push((w, h, fps, clk));
            }
            fn on_input_resolution_changed(&mut self, ow: u16, oh: u16, nw: u16, nh: u16) {
                self.0.lock().unwrap().changes.push((ow, oh, nw, nh));
            }
        }

        let transport = transport_for(ChipType::Ms2109, seed);
        let captured = Arc::new(StdMutex::new(Captured::default()));
        transport.add_status_listener(Box::new(Capture(captured.clone())));

        assert!(transport.begin_transaction());
        transport.poll_tick();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.changes, [(0, 0, 3840, 2160)]);
        assert_eq!(captured.updates.len(), 1);
        let (w, h, fps, clk) = captured.updates[0];
        assert_eq!((w, h), (3840, 2160));
        assert!((fps - 60.0).abs() < 0.001);
        assert!((clk - 210.0).abs() < 0.001);
    }

    #[test]
    fn poll_tick_reports_zeros_without_hdmi() {
        let transport = transport_for(ChipType::Ms2109, no_seed);
        let updates = Arc::new(StdMutex::new(Vec::new()));
        struct Capture(Arc<StdMutex<Vec<(u16, u16)>>>);
        impl StatusEventListener for Capture {
            fn on_resolution_change_update(&mut self, w: u16, h: u16, _fps: f32, _clk: f32) {
                self.0.lock().unwrap().push((w, h));
            }
        }
        transport.add_status_listener(Box::new(Capture(updates.clone())));

        assert!(transport.begin_transaction());
        transport.poll_tick();
        assert_eq!(*updates.lock().unwrap(), [(0, 0)]);
    }

    #[test]
    fn eeprom_write_then_read_round_trips() {
        let transport = transport_for(ChipType::Ms2109, no_seed);
        let payload: Vec<u8> = (0u8..40).collect();
        transport.write_eeprom(0x0000, &payload).expect("write eeprom");
        let back = transport.read_eeprom(0x0000, payload.len() as u32).expect("read eeprom");
        assert_eq!(back, payload);
    }

    #[test]
    fn firmware_size_uses_header_bytes_2_and_3() {
        fn seed(chip: &mut ChipStore) {
            chip.eeprom[2] = 0x01;
            chip.eeprom[3] = 0x10; // 272
        }
        let transport = transport_for(ChipType::Ms2109, seed);
        assert_eq!(transport.read_firmware_size().expect("size"), 272 + 52);
    }

    #[test]
    fn firmware_version_reads_and_caches() {
        fn seed(chip: &mut ChipStore) {
            let r = MS2109_REGISTERS;
            chip.regs.insert(r.firmware_version_0, 24);
            chip.regs.insert(r.firmware_version_1, 8);
            chip.regs.insert(r.firmware_version_2, 13);
            chip.regs.insert(r.firmware_version_3, 9);
        }
        let transport = transport_for(ChipType::Ms2109, seed);
        assert_eq!(transport.read_firmware_version().expect("version"), "24081309");
        assert_eq!(transport.firmware_version(), "24081309");
    }

    #[test]
    fn progress_events_cover_the_whole_eeprom_read() {
        struct Progress(Arc<StdMutex<Vec<u32>>>, Arc<StdMutex<bool>>);
        impl StatusEventListener for Progress {
            fn on_firmware_read_progress(&mut self, percent: u32) {
                self.0.lock().unwrap().push(percent);
            }
            fn on_firmware_read_complete(&mut self, ok: bool) {
                *self.1.lock().unwrap() = ok;
            }
        }

        let transport = transport_for(ChipType::Ms2109, no_seed);
        let percents = Arc::new(StdMutex::new(Vec::new()));
        let complete = Arc::new(StdMutex::new(false));
        transport.add_status_listener(Box::new(Progress(percents.clone(), complete.clone())));

        transport.read_eeprom(0, 4).expect("read");
        assert_eq!(*percents.lock().unwrap(), [25, 50, 75, 100]);
        assert!(*complete.lock().unwrap());
    }

    #[test]
    fn open_failures_are_retried_then_reported() {
        let script = ScriptedEnumerator::new();
        script.push(Vec::new());
        let manager = manager_with(&script);
        // Enough failures to exhaust both begin_transaction attempts below.
        let mut opener = MockOpener::quiet(ChipType::Ms2109, no_seed);
        opener.fail_opens = StdMutex::new(OPEN_RETRIES * 2);
        let transport = HidTransport::with_opener(manager, Box::new(opener));
        transport.state.lock().unwrap().current_path = "hid-vid_534d&pid_2109".into();

        assert!(!transport.begin_transaction());
        assert!(!transport.is_in_transaction());
        assert!(transport.read_u8(0xC738).is_err());
    }

    #[test]
    fn chip_detection_retains_previous_on_inconclusive_path() {
        let transport = transport_for(ChipType::Ms2109, no_seed);
        assert!(transport.begin_transaction());
        assert_eq!(transport.chip_type(), ChipType::Ms2109);
        transport.end_transaction();

        // Re-bind to a path that names no chip: type must survive.
        transport.state.lock().unwrap().current_path = "/dev/hidraw0".into();
        assert!(transport.begin_transaction());
        assert_eq!(transport.chip_type(), ChipType::Ms2109);
    }

    #[test]
    fn ms2109_send_failure_falls_back_to_report_id_1() {
        fn seed(chip: &mut ChipStore) {
            chip.regs.insert(0xDF00, 0x01);
        }
        let script = ScriptedEnumerator::new();
        script.push(Vec::new());
        let manager = manager_with(&script);
        // Two failing sends exhaust report-ID 0's retry budget; the read
        // must recover through the report-ID 1 framing.
        let mut opener = MockOpener::quiet(ChipType::Ms2109, seed);
        opener.fail_sends = 2;
        let sent = Arc::clone(&opener.sent);
        let transport = HidTransport::with_opener(manager, Box::new(opener));
        transport.state.lock().unwrap().current_path = "hid-vid_534d&pid_2109".into();

        assert!(transport.begin_transaction());
        assert_eq!(transport.read_u8(0xDF00).expect("fallback read"), 0x01);

        let sent = sent.lock().unwrap();
        let last = sent.last().expect("at least one frame sent");
        assert_eq!(last[0], 0x01, "fallback frame must carry report ID 1");
    }
}
