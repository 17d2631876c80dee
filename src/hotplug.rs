//! Hotplug monitoring.
//!
//! [`HotplugMonitor`] periodically re-discovers devices through its owning
//! [`DeviceManager`](crate::manager::DeviceManager), diffs the result against
//! the previous snapshot, and fans any changes out to registered listeners
//! and callbacks.
//!
//! ## Delivery contract
//! Per event and per listener: unplug/removed signals first, then the
//! single `new_device_plugged_in` (first added record only — the subsystem
//! adapters depend on this one-per-event shape), then per-record added and
//! modified signals, then `devices_changed`, then the combined event exactly
//! once. Callbacks receive the combined event after the listeners. A
//! listener that panics is logged and skipped; its peers still see the
//! event.
//!
//! ## Threading
//! Ticks run on a dedicated worker thread, never on the control thread.
//! `stop` lets a tick already in flight finish and deliver; subscribers must
//! tolerate one event arriving shortly after `stop` returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::device::DeviceInfo;
use crate::events::{DeviceChangeListener, ListenerId, ListenerSet};
use crate::manager::ManagerInner;
use crate::snapshot::{diff_snapshots, DeviceChangeEvent};

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Plain-function subscriber to combined change events.
pub type ChangeCallback = Box<dyn Fn(&DeviceChangeEvent) + Send>;

struct MonitorState {
    last_snapshot: Vec<DeviceInfo>,
    initial_snapshot: Vec<DeviceInfo>,
    change_event_count: u64,
    last_change_at: Option<SystemTime>,
}

pub struct HotplugMonitor {
    /// Non-owning back-reference: the manager owns the monitor, never the
    /// other way around.
    manager: Weak<ManagerInner>,
    state: Mutex<MonitorState>,
    listeners: Mutex<ListenerSet<dyn DeviceChangeListener>>,
    callbacks: Mutex<Vec<ChangeCallback>>,
    running: AtomicBool,
    interval_ms: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Flag + condvar the ticker sleeps on, so `stop` and `update_interval`
    /// take effect without waiting out a full interval.
    wakeup: Arc<(Mutex<bool>, Condvar)>,
}

impl HotplugMonitor {
    pub(crate) fn new(manager: Weak<ManagerInner>) -> Self {
        HotplugMonitor {
            manager,
            state: Mutex::new(MonitorState {
                last_snapshot: Vec::new(),
                initial_snapshot: Vec::new(),
                change_event_count: 0,
                last_change_at: None,
            }),
            listeners: Mutex::new(ListenerSet::new()),
            callbacks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL_MS),
            ticker: Mutex::new(None),
            wakeup: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Registers a listener; the id can mute or remove it later.
    pub fn add_listener(&self, listener: Box<dyn DeviceChangeListener>) -> ListenerId {
        self.listeners.lock().unwrap().add(listener)
    }

    pub fn enable_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().enable(id);
    }

    pub fn disable_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().disable(id);
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(id);
    }

    pub fn add_callback(&self, callback: impl Fn(&DeviceChangeEvent) + Send + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.lock().unwrap().clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Takes a blocking initial snapshot, publishes it as both last and
    /// initial, and starts periodic ticks at `interval_ms`.
    pub fn start(&self, interval_ms: u64) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("hotplug monitor already running");
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            warn!("cannot start hotplug monitor: manager is gone");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let interval = if interval_ms > 0 { interval_ms } else { DEFAULT_POLL_INTERVAL_MS };
        self.interval_ms.store(interval, Ordering::SeqCst);

        let initial = manager.enumerate_and_store();
        {
            let mut state = self.state.lock().unwrap();
            state.last_snapshot = initial.clone();
            state.initial_snapshot = initial;
        }
        *self.wakeup.0.lock().unwrap() = false;

        let weak = self.manager.clone();
        let wakeup = Arc::clone(&self.wakeup);
        // The ticker reaches the monitor back through the manager Arc, so it
        // cannot outlive the state it reads.
        let handle = thread::Builder::new()
            .name("opf-hotplug".into())
            .spawn(move || loop {
                let Some(manager) = weak.upgrade() else { break };
                let interval = manager.monitor().interval_ms.load(Ordering::SeqCst);
                drop(manager);

                let (stop_flag, condvar) = &*wakeup;
                let guard = stop_flag.lock().unwrap();
                let (guard, _timeout) = condvar
                    .wait_timeout(guard, Duration::from_millis(interval))
                    .unwrap();
                if *guard {
                    break;
                }
                drop(guard);

                let Some(manager) = weak.upgrade() else { break };
                manager.monitor().check_now();
            });
        match handle {
            Ok(handle) => {
                *self.ticker.lock().unwrap() = Some(handle);
                info!("hotplug monitoring started with interval {interval} ms");
            }
            Err(err) => {
                warn!("failed to spawn hotplug ticker: {err}");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Stops the periodic ticks. A tick in flight completes and delivers its
    /// event; no new tick starts afterwards.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let (stop_flag, condvar) = &*self.wakeup;
            *stop_flag.lock().unwrap() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            // Joining from a delivery callback would deadlock; adapters
            // defer their stops onto worker threads for exactly that reason.
            let _ = handle.join();
        }
        info!("hotplug monitoring stopped");
    }

    /// Retimes a running monitor without restarting it. Non-positive values
    /// are ignored.
    pub fn update_interval(&self, interval_ms: u64) {
        if interval_ms == 0 {
            warn!("ignoring invalid hotplug interval: 0 ms");
            return;
        }
        let previous = self.interval_ms.swap(interval_ms, Ordering::SeqCst);
        if previous != interval_ms && self.is_running() {
            // Nudge the ticker so the new interval applies immediately.
            self.wakeup.1.notify_all();
            info!("hotplug interval updated to {interval_ms} ms");
        }
    }

    /// One synchronous discovery-and-diff pass. The ticker calls this; tests
    /// and "force check" paths may call it directly.
    pub fn check_now(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let current = manager.discover();

        let event = {
            let state = self.state.lock().unwrap();
            let mut event = diff_snapshots(&current, &state.last_snapshot);
            event.initial = state.initial_snapshot.clone();
            event
        };

        if !event.has_changes() {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.last_snapshot = current;
            state.change_event_count += 1;
            state.last_change_at = event.timestamp;
        }
        info!(
            "device changes detected: {} added, {} removed, {} modified",
            event.added.len(),
            event.removed.len(),
            event.modified.len()
        );
        self.deliver(&event);
    }

    /// Fan-out per the delivery contract in the module docs. Runs without
    /// holding the snapshot mutex.
    fn deliver(&self, event: &DeviceChangeEvent) {
        {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.for_each(|listener| {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    for removed in &event.removed {
                        listener.on_device_unplugged(removed);
                        listener.on_device_removed(removed);
                    }
                    if let Some(first_added) = event.added.first() {
                        listener.on_new_device_plugged_in(first_added);
                    }
                    for added in &event.added {
                        listener.on_device_added(added);
                    }
                    for (old, new) in &event.modified {
                        listener.on_device_modified(old, new);
                    }
                    listener.on_devices_changed(&event.current);
                    listener.on_device_change(event);
                }));
                if outcome.is_err() {
                    warn!("hotplug listener panicked; continuing with remaining listeners");
                }
            });
        }

        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("hotplug callback panicked; continuing with remaining callbacks");
            }
        }
    }

    /// Copy of the most recent snapshot.
    pub fn last_snapshot(&self) -> Vec<DeviceInfo> {
        self.state.lock().unwrap().last_snapshot.clone()
    }

    /// The last snapshot wrapped as a no-change event.
    pub fn current_state(&self) -> DeviceChangeEvent {
        let state = self.state.lock().unwrap();
        DeviceChangeEvent {
            timestamp: Some(SystemTime::now()),
            current: state.last_snapshot.clone(),
            initial: state.initial_snapshot.clone(),
            ..DeviceChangeEvent::default()
        }
    }

    /// The initial snapshot wrapped as a no-change event.
    pub fn initial_state(&self) -> DeviceChangeEvent {
        let state = self.state.lock().unwrap();
        DeviceChangeEvent {
            timestamp: Some(SystemTime::now()),
            current: state.initial_snapshot.clone(),
            initial: state.initial_snapshot.clone(),
            ..DeviceChangeEvent::default()
        }
    }

    pub fn change_event_count(&self) -> u64 {
        self.state.lock().unwrap().change_event_count
    }

    pub fn last_change_at(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().last_change_at
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        // The manager owns the monitor; tearing the manager down stops the
        // ticker with it.
        if self.is_running() {
            let (stop_flag, condvar) = &*self.wakeup;
            *stop_flag.lock().unwrap() = true;
            condvar.notify_all();
            if let Some(handle) = self.ticker.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InterfaceClass, RawInterface};
    use crate::manager::testing::{manager_with, ScriptedEnumerator};

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

    fn video(chain: &str, path: &str) -> RawInterface {
        RawInterface {
            class: InterfaceClass::Video,
            instance_id: format!("video:{path}"),
            port_chain: chain.to_string(),
            vid: "534D".to_string(),
            pid: "2109".to_string(),
            node_path: path.to_string(),
            ..RawInterface::default()
        }
    }

    #[derive(Default)]
    struct Journal {
        plugged_in: Vec<String>,
        unplugged: Vec<String>,
        added: Vec<String>,
        removed: Vec<String>,
        modified: Vec<(String, String)>,
        combined_events: usize,
    }

    struct JournalListener(std::sync::Arc<Mutex<Journal>>);

    impl DeviceChangeListener for JournalListener {
        fn on_device_added(&mut self, device: &DeviceInfo) {
            self.0.lock().unwrap().added.push(device.port_chain.clone());
        }
        fn on_device_removed(&mut self, device: &DeviceInfo) {
            self.0.lock().unwrap().removed.push(device.port_chain.clone());
        }
        fn on_device_modified(&mut self, old: &DeviceInfo, new: &DeviceInfo) {
            self.0
                .lock()
                .unwrap()
                .modified
                .push((old.camera_device_path.clone(), new.camera_device_path.clone()));
        }
        fn on_new_device_plugged_in(&mut self, device: &DeviceInfo) {
            self.0.lock().unwrap().plugged_in.push(device.port_chain.clone());
        }
        fn on_device_unplugged(&mut self, device: &DeviceInfo) {
            self.0.lock().unwrap().unplugged.push(device.port_chain.clone());
        }
        fn on_device_change(&mut self, _event: &DeviceChangeEvent) {
            self.0.lock().unwrap().combined_events += 1;
        }
    }

    fn gen1(chain: &str) -> Vec<RawInterface> {
        vec![usb("1A86", "7523", chain), usb("534D", "2109", chain)]
    }

    #[test]
    fn diff_event_reaches_listeners_and_callbacks() {
        let script = ScriptedEnumerator::new();
        script.push(gen1("1-2"));
        let manager = manager_with(&script);
        let monitor = manager.hotplug();

        let journal = std::sync::Arc::new(Mutex::new(Journal::default()));
        monitor.add_listener(Box::new(JournalListener(journal.clone())));
        let callback_count = std::sync::Arc::new(Mutex::new(0usize));
        let cb = callback_count.clone();
        monitor.add_callback(move |event| {
            assert!(event.has_changes());
            *cb.lock().unwrap() += 1;
        });

        manager.force_refresh();
        {
            let mut state = monitor.state.lock().unwrap();
            state.last_snapshot = manager.current_devices();
            state.initial_snapshot = state.last_snapshot.clone();
        }

        // New snapshot: 1-2 grows a camera, 1-5 appears.
        let mut raw = gen1("1-2");
        raw.push(video("1-2", "/dev/video0"));
        raw.extend(gen1("1-5"));
        script.push(raw);
        manager.force_refresh();
        monitor.check_now();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.added, ["1-5"]);
        assert_eq!(journal.plugged_in, ["1-5"]);
        assert!(journal.removed.is_empty());
        assert_eq!(journal.modified, [(String::new(), "/dev/video0".to_string())]);
        assert_eq!(journal.combined_events, 1);
        assert_eq!(*callback_count.lock().unwrap(), 1);
        assert_eq!(monitor.change_event_count(), 1);
        assert!(monitor.last_change_at().is_some());
    }

    #[test]
    fn one_plug_in_signal_but_per_record_unplug_signals() {
        let script = ScriptedEnumerator::new();
        script.push(Vec::new());
        let manager = manager_with(&script);
        let monitor = manager.hotplug();

        let journal = std::sync::Arc::new(Mutex::new(Journal::default()));
        monitor.add_listener(Box::new(JournalListener(journal.clone())));
        manager.force_refresh();

        // Two devices appear at once: exactly one plugged-in signal.
        let mut raw = gen1("1-2");
        raw.extend(gen1("1-6"));
        script.push(raw);
        manager.force_refresh();
        monitor.check_now();
        assert_eq!(journal.lock().unwrap().plugged_in, ["1-2"]);
        assert_eq!(journal.lock().unwrap().added.len(), 2);

        // Both vanish: one unplugged signal per record.
        script.push(Vec::new());
        manager.force_refresh();
        monitor.check_now();
        let journal = journal.lock().unwrap();
        assert_eq!(journal.unplugged.len(), 2);
        assert_eq!(journal.removed.len(), 2);
    }

    #[test]
    fn panicking_listener_does_not_starve_peers() {
        struct Panicker;
        impl DeviceChangeListener for Panicker {
            fn on_device_change(&mut self, _event: &DeviceChangeEvent) {
                panic!("listener bug");
            }
        }

        let script = ScriptedEnumerator::new();
        script.push(Vec::new());
        let manager = manager_with(&script);
        let monitor = manager.hotplug();

        monitor.add_listener(Box::new(Panicker));
        let journal = std::sync::Arc::new(Mutex::new(Journal::default()));
        monitor.add_listener(Box::new(JournalListener(journal.clone())));

        manager.force_refresh();
        script.push(gen1("1-2"));
        manager.force_refresh();
        monitor.check_now();

        assert_eq!(journal.lock().unwrap().combined_events, 1);
    }

    #[test]
    fn no_event_without_changes() {
        let script = ScriptedEnumerator::new();
        script.push(gen1("1-2"));
        let manager = manager_with(&script);
        let monitor = manager.hotplug();

        let journal = std::sync::Arc::new(Mutex::new(Journal::default()));
        monitor.add_listener(Box::new(JournalListener(journal.clone())));

        let initial = manager.force_refresh();
        {
            let mut state = monitor.state.lock().unwrap();
            state.last_snapshot = initial.clone();
            state.initial_snapshot = initial;
        }
        monitor.check_now();
        assert_eq!(journal.lock().unwrap().combined_events, 0);
        assert_eq!(monitor.change_event_count(), 0);
    }

    #[test]
    fn start_and_stop_lifecycle() {
        let script = ScriptedEnumerator::new();
        script.push(gen1("1-2"));
        let manager = manager_with(&script);
        let monitor = manager.hotplug();

        monitor.start(50);
        assert!(monitor.is_running());
        assert_eq!(monitor.last_snapshot().len(), 1);
        assert_eq!(monitor.initial_state().current.len(), 1);

        monitor.update_interval(0); // ignored
        monitor.update_interval(25);

        monitor.stop();
        assert!(!monitor.is_running());
        // Stopping twice is harmless.
        monitor.stop();
    }
}
