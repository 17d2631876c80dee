//! Serial adapter: auto-connect scheduling for the keyboard/mouse channel.
//!
//! The serial protocol itself lives outside the core; the adapter only
//! decides *when* the owner should try to open the port. On plug-in it
//! schedules two connection attempts (the device's MCU needs a moment after
//! enumeration), suppresses duplicates while a flow is in progress, and
//! defers everything while auto-connect is forbidden.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::adapters::defer;
use crate::device::DeviceInfo;
use crate::events::{DeviceChangeListener, ListenerId};
use crate::hotplug::HotplugMonitor;

/// First connection attempt after plug-in.
pub const AUTO_CONNECT_FIRST_DELAY: Duration = Duration::from_millis(250);
/// Second attempt, relative to the event.
pub const AUTO_CONNECT_SECOND_DELAY: Duration = Duration::from_millis(1000);

/// The serial-manager collaborator that actually opens ports.
pub trait SerialOwner: Send {
    /// The port the owner had open was unplugged.
    fn on_serial_unplugged(&mut self, port_chain: &str);
    /// The adapter wants the owner to try connecting at `port_chain`.
    fn on_auto_connect_requested(&mut self, port_chain: &str);
}

struct SerialState {
    current_port_chain: String,
    serial_open: bool,
    shutting_down: bool,
    allow_auto_connect: bool,
    pending_auto_connect: bool,
    pending_port_chain: String,
    auto_connect_in_progress: bool,
    /// Bumping this cancels attempts already scheduled on worker threads.
    generation: u64,
}

struct SerialShared {
    owner: Mutex<Box<dyn SerialOwner>>,
    state: Mutex<SerialState>,
    first_delay: Duration,
    second_delay: Duration,
}

pub struct SerialAdapter {
    shared: Arc<SerialShared>,
}

impl SerialAdapter {
    pub fn new(owner: Box<dyn SerialOwner>) -> Self {
        Self::with_delays(owner, AUTO_CONNECT_FIRST_DELAY, AUTO_CONNECT_SECOND_DELAY)
    }

    /// Constructor with explicit attempt delays (tests shrink them).
    pub fn with_delays(owner: Box<dyn SerialOwner>, first: Duration, second: Duration) -> Self {
        SerialAdapter {
            shared: Arc::new(SerialShared {
                owner: Mutex::new(owner),
                state: Mutex::new(SerialState {
                    current_port_chain: String::new(),
                    serial_open: false,
                    shutting_down: false,
                    allow_auto_connect: false,
                    pending_auto_connect: false,
                    pending_port_chain: String::new(),
                    auto_connect_in_progress: false,
                    generation: 0,
                }),
                first_delay: first,
                second_delay: second,
            }),
        }
    }

    pub fn attach(&self, monitor: &HotplugMonitor) -> ListenerId {
        monitor.add_listener(Box::new(SerialListener { shared: Arc::clone(&self.shared) }))
    }

    pub fn set_current_port_chain(&self, port_chain: &str) {
        let mut state = self.shared.state.lock().unwrap();
        state.current_port_chain = port_chain.to_string();
        debug!("serial adapter current port chain set to {port_chain}");
    }

    pub fn current_port_chain(&self) -> String {
        self.shared.state.lock().unwrap().current_port_chain.clone()
    }

    /// The owner reports the port's open state; an open port cancels any
    /// scheduled attempts.
    pub fn set_serial_open(&self, open: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.serial_open = open;
        if open {
            Self::cancel_attempts(&mut state);
        }
    }

    pub fn set_shutting_down(&self, shutting_down: bool) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutting_down = shutting_down;
        if shutting_down {
            Self::cancel_attempts(&mut state);
        }
    }

    /// Gate for auto-connect. Re-enabling with a deferred request pending
    /// schedules that request immediately.
    pub fn set_allow_auto_connect(&self, allow: bool) {
        let deferred = {
            let mut state = self.shared.state.lock().unwrap();
            state.allow_auto_connect = allow;
            if !allow {
                Self::cancel_attempts(&mut state);
                None
            } else if state.pending_auto_connect && !state.pending_port_chain.is_empty() {
                let chain = state.pending_port_chain.clone();
                state.pending_auto_connect = false;
                state.pending_port_chain.clear();
                Some(chain)
            } else {
                None
            }
        };
        if let Some(chain) = deferred {
            info!("processing deferred auto-connect for port chain {chain}");
            Self::schedule_attempts(&self.shared, &chain);
        }
    }

    fn cancel_attempts(state: &mut SerialState) {
        state.generation += 1;
        state.auto_connect_in_progress = false;
        state.pending_auto_connect = false;
        state.pending_port_chain.clear();
    }

    /// Two attempts on a worker thread, each checked against the state
    /// generation and the allow flag before firing.
    fn schedule_attempts(shared: &Arc<SerialShared>, port_chain: &str) {
        let generation = {
            let mut state = shared.state.lock().unwrap();
            state.generation += 1;
            state.auto_connect_in_progress = true;
            state.current_port_chain = port_chain.to_string();
            state.pending_port_chain = port_chain.to_string();
            state.generation
        };
        debug!("scheduled auto-connect attempts for port chain {port_chain}");

        let shared = Arc::clone(shared);
        let port_chain = port_chain.to_string();
        let first = shared.first_delay;
        let second = shared.second_delay.saturating_sub(first);
        defer(move || {
            thread::sleep(first);
            if Self::attempt_allowed(&shared, generation) {
                debug!("auto-connect attempt #1 for {port_chain}");
                shared.owner.lock().unwrap().on_auto_connect_requested(&port_chain);
            } else {
                return;
            }

            thread::sleep(second);
            if Self::attempt_allowed(&shared, generation) {
                debug!("auto-connect attempt #2 for {port_chain}");
                shared.owner.lock().unwrap().on_auto_connect_requested(&port_chain);
            }
            let mut state = shared.state.lock().unwrap();
            if state.generation == generation {
                state.auto_connect_in_progress = false;
            }
        });
    }

    fn attempt_allowed(shared: &Arc<SerialShared>, generation: u64) -> bool {
        let state = shared.state.lock().unwrap();
        state.generation == generation
            && state.allow_auto_connect
            && !state.serial_open
            && !state.shutting_down
    }
}

struct SerialListener {
    shared: Arc<SerialShared>,
}

impl DeviceChangeListener for SerialListener {
    fn on_device_unplugged(&mut self, device: &DeviceInfo) {
        let current = self.shared.state.lock().unwrap().current_port_chain.clone();
        if current.is_empty() || current != device.port_chain {
            debug!("unplugged device is not the current serial device, ignoring");
            return;
        }
        info!("current serial device at {} unplugged, notifying owner", device.port_chain);
        let shared = Arc::clone(&self.shared);
        let chain = device.port_chain.clone();
        // Queued notification keeps the hotplug thread unblocked.
        defer(move || shared.owner.lock().unwrap().on_serial_unplugged(&chain));
    }

    fn on_new_device_plugged_in(&mut self, device: &DeviceInfo) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                debug!("shutting down, ignoring plugged-in device");
                return;
            }
            if state.serial_open {
                debug!("serial already open, not auto-connecting");
                return;
            }
            if !state.allow_auto_connect {
                state.pending_auto_connect = true;
                state.pending_port_chain = device.port_chain.clone();
                info!("auto-connect deferred for port chain {}", device.port_chain);
                return;
            }
            if state.auto_connect_in_progress && state.pending_port_chain == device.port_chain {
                debug!("auto-connect already in progress for {}, ignoring duplicate", device.port_chain);
                return;
            }
        }
        SerialAdapter::schedule_attempts(&self.shared, &device.port_chain);
    }
}
